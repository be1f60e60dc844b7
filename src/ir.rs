// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Arena-based intermediate representation consumed by the lowering pass.
//!
//! Expressions live in an [`ExprPool`] and refer to each other through
//! [`ExprId`] indices, so use counters can be updated while the tree is
//! being walked. Statements are plain values cloned out of a procedure
//! body before lowering starts.

use std::collections::HashMap;

/// Index of an expression node inside an [`ExprPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(u32);

impl ExprId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Storage width of a global cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitSize {
    #[default]
    None,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
}

impl BitSize {
    pub fn size_in_bytes(self) -> i64 {
        match self {
            BitSize::Int8 | BitSize::UInt8 => 1,
            BitSize::Int16 | BitSize::UInt16 => 2,
            _ => 4,
        }
    }

    pub fn needs_sign_ext(self) -> bool {
        matches!(self, BitSize::Int8 | BitSize::Int16)
    }
}

/// Where a cell lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Local,
    Arg,
    Capture,
    Global,
}

/// A variable slot: stack local, argument, captured local or global.
#[derive(Debug, Clone)]
pub struct Cell {
    pub index: i64,
    pub kind: CellKind,
    pub bit_size: BitSize,
    pub name: String,
}

impl Cell {
    pub fn new(index: i64, kind: CellKind, name: &str) -> Self {
        Self {
            index,
            kind,
            bit_size: BitSize::None,
            name: name.to_string(),
        }
    }

    pub fn is_global(&self) -> bool {
        self.kind == CellKind::Global
    }

    pub fn debug_info(&self) -> CellInfo {
        CellInfo {
            name: self.name.clone(),
            index: self.index,
        }
    }
}

/// Field slot inside an object; `idx` is the word index after the header.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub idx: i64,
    pub name: String,
}

/// Class identity used by dynamic dispatch and `instanceof` checks.
/// `class_no..last_subtype_no` is the contiguous subtype range.
#[derive(Debug, Clone)]
pub struct ClassDesc {
    pub id: String,
    pub class_no: u16,
    pub last_subtype_no: u16,
}

/// Validation flavor of an `instanceof` helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    Bool,
    Validate,
}

/// Argument conversion requested by a runtime call mask.
#[derive(Debug, Clone)]
pub struct ConvInfo {
    pub arg_idx: usize,
    pub method: String,
}

/// Per-call reference mask plus optional argument conversions.
#[derive(Debug, Clone, Default)]
pub struct MaskInfo {
    pub ref_mask: u32,
    pub conversions: Vec<ConvInfo>,
}

/// Target of a procedure call expression.
#[derive(Debug, Clone)]
pub enum ProcCallTarget {
    /// Direct call to a known procedure by index into `Binary::procs`.
    Static { proc: usize, is_this: bool },
    /// Virtual dispatch through the class vtable.
    Virtual { index: i64, class: ClassDesc },
    /// Interface dispatch by member index.
    Iface { index: i64, is_set: bool },
    /// Indirect call of a lambda object (first argument).
    Lambda,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    NumberLiteral(i64),
    PointerLiteral(String),
    RuntimeCall(String),
    ProcCall(ProcCallTarget),
    SharedRef,
    SharedDef,
    FieldAccess(FieldInfo),
    Store,
    CellRef(Cell),
    Sequence,
    JmpValue,
    Nop,
    InstanceOf(ClassDesc, CheckKind),
}

/// One expression node. `total_uses`/`curr_uses` drive the virtual
/// expression stack in the lowering; they are only meaningful on the
/// child of a `SharedDef`.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub args: Vec<ExprId>,
    pub mask: Option<MaskInfo>,
    pub total_uses: i32,
    pub curr_uses: i32,
    pub ir_curr_uses: i32,
}

/// Arena owning all expression nodes of a program.
#[derive(Debug, Default)]
pub struct ExprPool {
    nodes: Vec<Expr>,
}

impl ExprPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, kind: ExprKind, args: Vec<ExprId>) -> ExprId {
        let id = ExprId(self.nodes.len() as u32);
        self.nodes.push(Expr {
            kind,
            args,
            mask: None,
            total_uses: 0,
            curr_uses: 0,
            ir_curr_uses: 0,
        });
        id
    }

    pub fn get(&self, id: ExprId) -> &Expr {
        &self.nodes[id.index()]
    }

    pub fn get_mut(&mut self, id: ExprId) -> &mut Expr {
        &mut self.nodes[id.index()]
    }

    pub fn numlit(&mut self, v: i64) -> ExprId {
        self.alloc(ExprKind::NumberLiteral(v), Vec::new())
    }

    pub fn ptrlit(&mut self, lbl: &str) -> ExprId {
        self.alloc(ExprKind::PointerLiteral(lbl.to_string()), Vec::new())
    }

    pub fn rtcall(&mut self, name: &str, args: Vec<ExprId>) -> ExprId {
        self.alloc(ExprKind::RuntimeCall(name.to_string()), args)
    }

    pub fn rtcall_mask(&mut self, name: &str, mask: MaskInfo, args: Vec<ExprId>) -> ExprId {
        let id = self.rtcall(name, args);
        self.get_mut(id).mask = Some(mask);
        id
    }

    pub fn proc_call(&mut self, target: ProcCallTarget, args: Vec<ExprId>) -> ExprId {
        self.alloc(ExprKind::ProcCall(target), args)
    }

    pub fn cellref(&mut self, cell: &Cell) -> ExprId {
        self.alloc(ExprKind::CellRef(cell.clone()), Vec::new())
    }

    pub fn store(&mut self, trg: ExprId, src: ExprId) -> ExprId {
        self.alloc(ExprKind::Store, vec![trg, src])
    }

    /// Wrap `expr` for multiple uses. Re-sharing a `SharedRef` aliases the
    /// underlying definition; number literals are cheap enough to re-emit.
    pub fn shared(&mut self, expr: ExprId) -> ExprId {
        let inner = match &self.get(expr).kind {
            ExprKind::SharedRef => self.get(expr).args[0],
            ExprKind::NumberLiteral(_) => return expr,
            _ => expr,
        };
        self.alloc(ExprKind::SharedRef, vec![inner])
    }

    pub fn shared_def(&mut self, expr: ExprId) -> ExprId {
        self.alloc(ExprKind::SharedDef, vec![expr])
    }

    pub fn is_literal(&self, id: ExprId) -> bool {
        matches!(
            self.get(id).kind,
            ExprKind::NumberLiteral(_) | ExprKind::PointerLiteral(_)
        )
    }

    pub fn is_stateless(&self, id: ExprId) -> bool {
        matches!(
            self.get(id).kind,
            ExprKind::NumberLiteral(_) | ExprKind::PointerLiteral(_) | ExprKind::SharedRef
        )
    }

    pub fn is_pure(&self, id: ExprId) -> bool {
        self.is_stateless(id) || matches!(self.get(id).kind, ExprKind::CellRef(_))
    }

    pub fn can_update_cells(&self, id: ExprId) -> bool {
        let e = self.get(id);
        match e.kind {
            ExprKind::NumberLiteral(_)
            | ExprKind::PointerLiteral(_)
            | ExprKind::CellRef(_)
            | ExprKind::JmpValue
            | ExprKind::SharedRef
            | ExprKind::Nop => false,
            ExprKind::SharedDef | ExprKind::FieldAccess(_) | ExprKind::InstanceOf(_, _) => {
                self.can_update_cells(e.args[0])
            }
            ExprKind::RuntimeCall(_)
            | ExprKind::ProcCall(_)
            | ExprKind::Sequence
            | ExprKind::Store => true,
        }
    }
}

/// Jump condition of a [`Stmt::Jmp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JmpMode {
    Always,
    IfZero,
    IfNotZero,
}

#[derive(Debug, Clone)]
pub struct Jmp {
    pub lbl: String,
    pub expr: Option<ExprId>,
    pub mode: JmpMode,
    /// Shared expression that dies on this edge; its stack slots are
    /// discarded before the branch.
    pub terminate: Option<ExprId>,
}

#[derive(Debug, Clone)]
pub struct BreakpointInfo {
    pub id: u32,
    pub is_debugger_stmt: bool,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Expr(ExprId),
    StackEmpty,
    Jmp(Jmp),
    Label(String),
    Comment(String),
    Breakpoint(BreakpointInfo),
}

/// Call site recorded during lowering; `addr`/`stack` are filled in by
/// debug-info finalization once labels are resolved.
#[derive(Debug, Clone)]
pub struct ProcCallInfo {
    pub proc_index: i32,
    pub call_label: String,
    pub addr: i64,
    pub stack: i32,
}

#[derive(Debug, Clone)]
pub struct CellInfo {
    pub name: String,
    pub index: i64,
}

/// Debugger metadata for one procedure, resolved after assembly.
#[derive(Debug, Clone, Default)]
pub struct ProcDebugInfo {
    pub name: String,
    pub idx: usize,
    pub locals: Vec<CellInfo>,
    pub args: Vec<CellInfo>,
    pub code_start_loc: i64,
    pub code_end_loc: i64,
    pub bkpt_loc: i64,
    pub locals_mark: i32,
    pub size: i64,
    pub calls: Vec<ProcCallInfo>,
}

#[derive(Debug, Clone)]
pub struct Procedure {
    pub label: String,
    pub full_name: String,
    pub seq_no: usize,
    pub is_root: bool,
    pub used_as_value: bool,
    /// Class whose `this` argument must be validated on entry.
    pub class_check: Option<ClassDesc>,
    pub args: Vec<Cell>,
    pub locals: Vec<Cell>,
    pub body: Vec<Stmt>,
    pub calls: Vec<ProcCallInfo>,
    pub debug_info: Option<ProcDebugInfo>,
}

impl Procedure {
    pub fn new(label: &str, full_name: &str, seq_no: usize) -> Self {
        Self {
            label: label.to_string(),
            full_name: full_name.to_string(),
            seq_no,
            is_root: false,
            used_as_value: false,
            class_check: None,
            args: Vec::new(),
            locals: Vec::new(),
            body: Vec::new(),
            calls: Vec::new(),
            debug_info: None,
        }
    }

    pub fn mk_arg(&mut self, name: &str) -> Cell {
        let c = Cell::new(self.args.len() as i64, CellKind::Arg, name);
        self.args.push(c.clone());
        c
    }

    pub fn mk_local(&mut self, name: &str) -> Cell {
        let c = Cell::new(self.locals.len() as i64, CellKind::Local, name);
        self.locals.push(c.clone());
        c
    }

    pub fn emit(&mut self, s: Stmt) {
        self.body.push(s);
    }

    pub fn emit_expr(&mut self, e: ExprId) {
        self.emit(Stmt::Expr(e));
    }

    pub fn emit_lbl(&mut self, name: &str) {
        self.emit(Stmt::Label(name.to_string()));
    }

    pub fn emit_jmp(&mut self, lbl: &str, expr: Option<ExprId>, mode: JmpMode) {
        self.emit(Stmt::Jmp(Jmp {
            lbl: lbl.to_string(),
            expr,
            mode,
            terminate: None,
        }));
    }

    pub fn stack_empty(&mut self) {
        self.emit(Stmt::StackEmpty);
    }

    /// Establish use counts on shared definitions and check that every
    /// jump targets a label in this body. Must run before lowering.
    pub fn resolve(&self, pool: &mut ExprPool) {
        let mut labels: HashMap<&str, ()> = HashMap::new();
        for s in &self.body {
            if let Stmt::Label(name) = s {
                labels.insert(name.as_str(), ());
            }
        }

        fn count(pool: &mut ExprPool, id: ExprId) {
            let (kind_is_def, kind_is_ref, args) = {
                let e = pool.get(id);
                (
                    matches!(e.kind, ExprKind::SharedDef),
                    matches!(e.kind, ExprKind::SharedRef),
                    e.args.clone(),
                )
            };
            if kind_is_def {
                let arg = args[0];
                let a = pool.get_mut(arg);
                a.total_uses = 1;
                a.curr_uses = 0;
                a.ir_curr_uses = 0;
                count(pool, arg);
                return;
            }
            if kind_is_ref {
                let a = pool.get_mut(args[0]);
                assert!(a.total_uses >= 1, "shared ref before def");
                a.total_uses += 1;
                return;
            }
            for a in args {
                count(pool, a);
            }
        }

        for s in &self.body {
            match s {
                Stmt::Expr(e) => count(pool, *e),
                Stmt::Jmp(j) => {
                    assert!(labels.contains_key(j.lbl.as_str()), "missing label: {}", j.lbl);
                    if let Some(e) = j.expr {
                        count(pool, e);
                    }
                }
                _ => {}
            }
        }
    }
}

/// Target knobs that shape the generated assembly.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    /// Stack alignment in words; 0 or 1 disables alignment padding.
    pub stack_align: i64,
    pub runtime_is_arm: bool,
    pub inline_conversions: bool,
    pub skip_class_check: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            stack_align: 0,
            runtime_is_arm: false,
            inline_conversions: false,
            skip_class_check: false,
        }
    }
}

/// Whole-program aggregate handed to the lowering: procedures, globals,
/// literal tables and the shared helper cache.
#[derive(Debug, Default)]
pub struct Binary {
    pub pool: ExprPool,
    pub procs: Vec<Procedure>,
    pub globals: Vec<Cell>,
    /// String value to label, insertion order preserved for emission.
    pub strings: Vec<(String, String)>,
    /// Helper body to label; bodies are emitted once after all procedures.
    pub code_helpers: Vec<(String, String)>,
    pub lbl_no: u32,
    pub breakpoints: bool,
    pub target: TargetConfig,
}

impl Binary {
    pub fn new(target: TargetConfig) -> Self {
        Self {
            target,
            ..Self::default()
        }
    }

    pub fn mk_global(&mut self, name: &str, bit_size: BitSize) -> Cell {
        let mut c = Cell::new(self.globals.len() as i64 * 4, CellKind::Global, name);
        c.bit_size = bit_size;
        self.globals.push(c.clone());
        c
    }

    pub fn num_global_words(&self) -> i64 {
        self.globals.len() as i64
    }

    /// Intern a string literal, returning its label.
    pub fn emit_string(&mut self, s: &str) -> String {
        if let Some((_, lbl)) = self.strings.iter().find(|(v, _)| v == s) {
            return lbl.clone();
        }
        let lbl = format!("_str{}", self.strings.len());
        self.strings.push((s.to_string(), lbl.clone()));
        lbl
    }

    pub fn add_proc(&mut self, mut proc: Procedure) -> usize {
        let idx = self.procs.len();
        proc.seq_no = idx + 1;
        self.procs.push(proc);
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_use_counting_counts_def_plus_refs() {
        let mut bin = Binary::new(TargetConfig::default());
        let mut p = Procedure::new("_start", "start", 1);
        let call = bin.pool.rtcall("foo::bar", vec![]);
        let shared = bin.pool.shared(call);
        let def = bin.pool.shared_def(call);
        let r2 = bin.pool.shared(shared);
        let add = bin.pool.rtcall("thumb::adds", vec![shared, r2]);
        p.emit_expr(def);
        p.emit_expr(add);
        p.resolve(&mut bin.pool);
        assert_eq!(bin.pool.get(call).total_uses, 3);
        assert_eq!(bin.pool.get(call).curr_uses, 0);
    }

    #[test]
    fn purity_classification() {
        let mut pool = ExprPool::new();
        let n = pool.numlit(4);
        let cell = Cell::new(0, CellKind::Local, "x");
        let cr = pool.cellref(&cell);
        let call = pool.rtcall("foo", vec![n]);
        assert!(pool.is_pure(n));
        assert!(pool.is_pure(cr));
        assert!(!pool.is_stateless(cr));
        assert!(!pool.is_pure(call));
        assert!(pool.can_update_cells(call));
        assert!(!pool.can_update_cells(cr));
    }

    #[test]
    #[should_panic(expected = "missing label")]
    fn resolve_rejects_dangling_jump() {
        let mut pool = ExprPool::new();
        let mut p = Procedure::new("_f", "f", 1);
        p.emit_jmp(".nowhere", None, JmpMode::Always);
        p.resolve(&mut pool);
    }

    #[test]
    fn string_interning_dedups() {
        let mut bin = Binary::new(TargetConfig::default());
        let a = bin.emit_string("hello");
        let b = bin.emit_string("world");
        let c = bin.emit_string("hello");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(bin.strings.len(), 2);
    }
}

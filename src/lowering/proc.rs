// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Lowers one IR procedure to Thumb assembly text.
//!
//! The lowering keeps a virtual expression stack mirroring what the
//! generated code pushes at runtime. Shared expressions are pushed once
//! by their definition and loaded stack-relative by each reference; the
//! use counters on the pool nodes say when a slot is dead.

use std::collections::HashMap;
use std::mem;

use crate::asm::file::AsmFile;
use crate::error::{AsmError, AsmErrorKind};
use crate::ir::{
    Binary, BitSize, Cell, CellInfo, CellKind, CheckKind, ClassDesc, ExprId, ExprKind, Jmp,
    JmpMode, ProcCallInfo, ProcCallTarget, ProcDebugInfo, Stmt,
};

use super::asmline;
use super::snippets::{AssemblerSnippets, BitSizeInfo};

// 4 header words, 4 memory management methods, toString
const FIRST_METHOD_OFFSET: i64 = 9;

// special constants are encoded as (v << 2) | 2
const TAGGED_FALSE: i64 = 10;
const TAGGED_TRUE: i64 = 66;

// class numbers of the runtime's built-in vtables
const BUILTIN_REF_ACTION: u16 = 4;

fn builtin_class(class_no: u16) -> ClassDesc {
    ClassDesc {
        id: format!("builtin{class_no}"),
        class_no,
        last_subtype_no: class_no,
    }
}

fn bit_size_info(b: BitSize) -> BitSizeInfo {
    let size = b.size_in_bytes();
    let imm_limit = match size {
        1 => 32,
        2 => 64,
        _ => 128,
    };
    BitSizeInfo {
        size,
        needs_sign_ext: b.needs_sign_ext(),
        imm_limit,
    }
}

struct RtArg {
    idx: usize,
    expr: ExprId,
    is_simple: bool,
    is_ref: bool,
    conv: Option<String>,
}

pub struct ProcLowerer<'a> {
    t: &'a dyn AssemblerSnippets,
    bin: &'a mut Binary,
    proc_idx: usize,
    label: String,
    full_name: String,
    is_root: bool,
    used_as_value: bool,
    class_check: Option<ClassDesc>,
    num_args: usize,
    num_locals: usize,
    body: Vec<Stmt>,

    out: String,
    expr_stack: Vec<ExprId>,
    calls: Vec<ProcCallInfo>,
    // real stack size is this plus the expression stack depth
    base_stack_size: i64,
    labelled_helpers: HashMap<String, String>,
    label_stacks: HashMap<String, i64>,
}

impl<'a> ProcLowerer<'a> {
    pub fn lower(
        t: &'a dyn AssemblerSnippets,
        bin: &'a mut Binary,
        proc_idx: usize,
    ) -> Result<String, AsmError> {
        let proc = &bin.procs[proc_idx];
        let mut me = Self {
            t,
            label: proc.label.clone(),
            full_name: proc.full_name.clone(),
            is_root: proc.is_root,
            used_as_value: proc.used_as_value,
            class_check: proc.class_check.clone(),
            num_args: proc.args.len(),
            num_locals: proc.locals.len(),
            body: proc.body.clone(),
            bin,
            proc_idx,
            out: String::new(),
            expr_stack: Vec::new(),
            calls: Vec::new(),
            base_stack_size: 0,
            labelled_helpers: HashMap::new(),
            label_stacks: HashMap::new(),
        };
        me.work()?;
        let calls = mem::take(&mut me.calls);
        me.bin.procs[proc_idx].calls = calls;
        Ok(mem::take(&mut me.out))
    }

    fn write(&mut self, s: &str) {
        self.out.push_str(&asmline(s));
    }

    fn redirect<F: FnOnce(&mut Self)>(&mut self, f: F) -> String {
        let prev = mem::take(&mut self.out);
        f(self);
        mem::replace(&mut self.out, prev)
    }

    fn stack_size(&self) -> i64 {
        self.base_stack_size + self.expr_stack.len() as i64
    }

    fn stack_alignment_needed(&self, offset: i64) -> i64 {
        let align = self.bin.target.stack_align;
        if align <= 1 {
            return 0;
        }
        let npush = align - ((self.stack_size() + offset) & (align - 1));
        if npush == align {
            0
        } else {
            npush
        }
    }

    fn work(&mut self) -> Result<(), AsmError> {
        self.write(&format!("\n;\n; Function {}\n;\n", self.full_name));

        let base = self.label.clone();
        self.write(&format!(".object {} {:?}", base, self.full_name));
        self.write(&format!("{base}_pre:"));

        self.emit_lambda_wrapper(self.is_root)?;

        self.write(".section code");
        self.write(&format!("{base}:"));

        if let Some(cls) = self.class_check.clone() {
            if !self.bin.target.skip_class_check {
                self.write("mov r7, lr");
                self.write("ldr r0, [sp, #0]");
                self.emit_instance_of(&cls, CheckKind::Validate);
                self.write("mov lr, r7");
            }
        }

        self.write(&format!(
            "\n{base}_nochk:\n    @stackmark func\n    @stackmark args\n"
        ));

        if self.bin.breakpoints {
            let s = self.t.debugger_proc(&format!("{base}_bkpt"));
            self.write(&s);
        }

        self.base_stack_size = 1; // push {lr}
        let numlocals = self.num_locals as i64;

        self.write("push {lr}");
        self.write(".locals:\n");

        let setup = self.t.proc_setup(numlocals);
        self.write(&setup);
        self.base_stack_size += numlocals;

        self.write("@stackmark locals");
        self.write(&format!("{base}_locals:"));

        let body = mem::take(&mut self.body);
        for s in &body {
            match s {
                Stmt::Expr(e) => self.emit_expr(*e),
                Stmt::StackEmpty => {
                    assert!(self.expr_stack.is_empty(), "stack should be empty");
                    self.write("@stackempty locals");
                }
                Stmt::Jmp(j) => self.emit_jmp(j),
                Stmt::Label(name) => {
                    self.write(&format!("{name}:"));
                    self.validate_jmp_stack(name, 0);
                }
                Stmt::Comment(c) => self.write(&format!("; {c}")),
                Stmt::Breakpoint(bi) => {
                    if self.bin.breakpoints {
                        let lbl = format!("__brkp_{}", bi.id);
                        let s = if bi.is_debugger_stmt {
                            self.t.debugger_stmt(&lbl)
                        } else {
                            self.t.debugger_bkpt(&lbl)
                        };
                        self.write(&s);
                    }
                }
            }
        }

        assert!(numlocals < 127);
        if numlocals > 0 {
            let s = self.t.pop_locals(numlocals);
            self.write(&s);
        }

        self.write(&format!("{base}_end:"));
        let ret = self.t.proc_return();
        self.write(&ret);
        self.write("@stackempty func");
        self.write("@stackempty args");
        self.write("; endfun");
        Ok(())
    }

    fn mk_lbl(&mut self, root: &str) -> String {
        let mut l = format!("{root}{}", self.bin.lbl_no);
        self.bin.lbl_no += 1;
        if !l.starts_with('_') {
            l = format!(".{l}");
        }
        l
    }

    fn terminate(&mut self, expr: ExprId) -> i64 {
        let e = self.bin.pool.get(expr);
        assert!(matches!(e.kind, ExprKind::SharedRef));
        let arg = e.args[0];
        let a = self.bin.pool.get(arg);
        assert!(a.curr_uses != a.total_uses);
        // the terminated expression must sit on top
        assert!(self.expr_stack.first() == Some(&arg), "term at top");

        // pretend it is popped and simulate what clear_stack would do
        let mut num_entries = 1usize;
        while num_entries < self.expr_stack.len() {
            let ee = self.bin.pool.get(self.expr_stack[num_entries]);
            if ee.curr_uses != ee.total_uses {
                break;
            }
            num_entries += 1;
        }
        self.write(&format!("@dummystack {num_entries}"));
        let s = self.t.pop_locals(num_entries as i64);
        self.write(&s);
        num_entries as i64
    }

    fn validate_jmp_stack(&mut self, lbl: &str, off: i64) {
        let curr = self.expr_stack.len() as i64 - off;
        match self.label_stacks.get(lbl) {
            None => {
                self.label_stacks.insert(lbl.to_string(), curr);
            }
            Some(&prev) => {
                assert!(prev == curr, "stack misaligned at: {lbl}");
            }
        }
    }

    fn emit_jmp(&mut self, jmp: &Jmp) {
        let mut term_off = 0;
        if jmp.mode == JmpMode::Always {
            if let Some(e) = jmp.expr {
                self.emit_expr(e);
            }
            if let Some(t) = jmp.terminate {
                term_off = self.terminate(t);
            }
            let s = self.t.unconditional_branch(&jmp.lbl);
            self.write(&format!("{s} ; with expression"));
        } else {
            let lbl = self.mk_lbl("jmpz");
            let expr = match jmp.expr {
                Some(e) => e,
                None => unreachable!("conditional jump without expression"),
            };

            self.emit_expr(expr);

            // comparison runtime calls leave the flags set already
            let sets_flags = matches!(&self.bin.pool.get(expr).kind,
                ExprKind::RuntimeCall(n) if n == "thumb::subs" || n.starts_with("_cmp_"));
            if !sets_flags {
                let s = self.t.cmp_zero("r0");
                self.write(&s);
            }

            if jmp.mode == JmpMode::IfNotZero {
                // skip the following 'b'; beq itself has a very short range
                let s = self.t.beq(&lbl);
                self.write(&s);
            } else {
                let s = self.t.bne(&lbl);
                self.write(&s);
            }

            if let Some(t) = jmp.terminate {
                term_off = self.terminate(t);
            }

            let s = self.t.unconditional_branch(&jmp.lbl);
            self.write(&s);
            self.write(&format!("{lbl}:"));
        }

        let target = jmp.lbl.clone();
        self.validate_jmp_stack(&target, term_off);
    }

    fn clear_stack(&mut self, fast: bool) {
        let mut num_entries = 0i64;
        while let Some(&top) = self.expr_stack.first() {
            let e = self.bin.pool.get(top);
            if e.curr_uses != e.total_uses {
                break;
            }
            num_entries += 1;
            self.expr_stack.remove(0);
        }
        if num_entries > 0 {
            let s = self.t.pop_locals(num_entries);
            self.write(&s);
        }
        if !fast {
            let to_clear: Vec<ExprId> = self
                .expr_stack
                .iter()
                .copied()
                .filter(|&id| {
                    let e = self.bin.pool.get(id);
                    e.curr_uses == e.total_uses && e.ir_curr_uses != -1
                })
                .collect();
            if !to_clear.is_empty() {
                // r0-r3 may carry call arguments, r7 is free as temp
                let s = self.t.reg_gets_imm("r7", 0);
                self.write(&s);
                for a in to_clear {
                    self.bin.pool.get_mut(a).ir_curr_uses = -1;
                    let s = self.load_from_expr_stack("r7", a, 0, true);
                    self.write(&s);
                }
            }
        }
    }

    fn emit_expr_into(&mut self, e: ExprId, reg: &str) {
        let kind = self.bin.pool.get(e).kind.clone();
        match kind {
            ExprKind::NumberLiteral(v) => {
                let s = self.t.emit_int(v, reg);
                self.write(&s);
            }
            ExprKind::PointerLiteral(lbl) => {
                let s = self.t.load_ptr_full(&lbl, reg);
                self.write(&s);
            }
            ExprKind::SharedRef => {
                let arg = self.bin.pool.get(e).args[0];
                {
                    let a = self.bin.pool.get_mut(arg);
                    assert!(a.curr_uses > 0); // not the first use
                    assert!(a.curr_uses < a.total_uses);
                    a.curr_uses += 1;
                }
                let idx = match self.expr_stack.iter().position(|&x| x == arg) {
                    Some(i) => i,
                    None => unreachable!("shared expression not on stack"),
                };
                let a = self.bin.pool.get(arg);
                if idx == 0 && a.total_uses == a.curr_uses {
                    let s = self.t.pop_fixed(&[reg]);
                    self.write(&format!("{s} ; tmpref @{}", self.expr_stack.len()));
                    self.expr_stack.remove(0);
                    self.clear_stack(false);
                } else {
                    let s = self
                        .t
                        .load_reg_src_off(reg, "sp", &idx.to_string(), true, false, None);
                    self.write(&format!("{s} ; tmpref @{}", self.expr_stack.len() - idx));
                }
            }
            ExprKind::CellRef(cell) => {
                if cell.is_global() {
                    let inf = bit_size_info(cell.bit_size);
                    let mut off = format!("#{}", cell.index);
                    if inf.needs_sign_ext || cell.index >= inf.imm_limit {
                        let s = self.t.emit_int(cell.index, reg);
                        self.write(&s);
                        off = reg.to_string();
                    }
                    let s = self.t.load_reg_src_off("r7", "r6", "#0", false, false, None);
                    self.write(&s);
                    let s = self
                        .t
                        .load_reg_src_off(reg, "r7", &off, false, false, Some(&inf));
                    self.write(&s);
                } else {
                    let (src, imm, word) = self.cellref(&cell);
                    let s = self.t.load_reg_src_off(reg, &src, &imm, word, false, None);
                    self.write(&s);
                }
            }
            _ => unreachable!("expression cannot target a register directly"),
        }
    }

    // result lands in r0
    fn emit_expr(&mut self, e: ExprId) {
        let kind = self.bin.pool.get(e).kind.clone();
        match kind {
            ExprKind::JmpValue => self.write("; jmp value (already in r0)"),
            ExprKind::Nop => {
                // breakpoints need distinct addresses
                let s = self.t.nop();
                self.write(&s);
            }
            ExprKind::FieldAccess(_) => {
                let arg = self.bin.pool.get(e).args[0];
                self.emit_expr(arg);
                self.emit_field_access(e, false);
            }
            ExprKind::Store => {
                let (trg, src) = {
                    let a = &self.bin.pool.get(e).args;
                    (a[0], a[1])
                };
                self.emit_store(trg, src);
            }
            ExprKind::RuntimeCall(_) => self.emit_rt_call(e, None),
            ExprKind::ProcCall(_) => self.emit_proc_call(e),
            ExprKind::SharedDef => self.emit_shared_def(e),
            ExprKind::Sequence => {
                let args = self.bin.pool.get(e).args.clone();
                for a in args {
                    self.emit_expr(a);
                }
                self.clear_stack(false);
            }
            ExprKind::InstanceOf(cls, tp) => {
                let arg = self.bin.pool.get(e).args[0];
                self.emit_expr(arg);
                self.emit_instance_of(&cls, tp);
            }
            _ => self.emit_expr_into(e, "r0"),
        }
    }

    fn emit_field_access(&mut self, e: ExprId, store: bool) {
        let info = match &self.bin.pool.get(e).kind {
            ExprKind::FieldAccess(i) => i.clone(),
            _ => unreachable!("not a field access"),
        };
        let off = info.idx * 4 + 4;
        let mut xoff = format!("#{off}");
        if off > 124 {
            let s = self.t.emit_int(off, "r3");
            self.write(&s);
            xoff = "r3".to_string();
        }
        if store {
            self.write(&format!("str r1, [r0, {xoff}]"));
        } else {
            self.write(&format!("ldr r0, [r0, {xoff}]"));
        }
    }

    fn write_fail_branch(&mut self) {
        self.write(".fail:");
        self.write("mov r1, lr");
        let s = self.t.call_lbl("pxt::failedCast", false, 0);
        self.write(&s);
    }

    fn check_subtype(&mut self, cls: &ClassDesc, fail_lbl: &str, r2: &str) {
        if cls.class_no == 0 {
            self.write(&format!("b {fail_lbl} ; always fails; class never instantiated"));
            return;
        }
        self.write(&format!("ldrh {r2}, [r3, #8]"));
        self.write(&format!("cmp {r2}, #{}", cls.class_no));
        if cls.class_no == cls.last_subtype_no {
            // different class
            self.write(&format!("bne {fail_lbl}"));
        } else {
            self.write(&format!("blt {fail_lbl}"));
            self.write(&format!("cmp {r2}, #{}", cls.last_subtype_no));
            self.write(&format!("bgt {fail_lbl}"));
        }
    }

    // keeps r0 and r1, clobbers r2, leaves the vtable in r3
    fn load_vtable(&mut self, r2: &str, taglbl: &str, nulllbl: &str) {
        self.write(&format!("lsls {r2}, r0, #30"));
        self.write(&format!("bne {taglbl}")); // tagged
        self.write("cmp r0, #0");
        self.write(&format!("beq {nulllbl}")); // null
        self.write("ldr r3, [r0, #0]");
        self.write("; vtable in R3");
    }

    fn emit_instance_of(&mut self, cls: &ClassDesc, tp: CheckKind) {
        let suffix = match tp {
            CheckKind::Bool => "bool",
            CheckKind::Validate => "validate",
        };
        let lbl = format!("inst_{}_{}", cls.id, suffix);
        let cls = cls.clone();
        self.emit_labelled_helper(&lbl, move |me| {
            me.load_vtable("r2", ".fail", ".fail");
            me.check_subtype(&cls, ".fail", "r2");
            match tp {
                CheckKind::Bool => {
                    me.write(&format!("movs r0, #{TAGGED_TRUE}"));
                    me.write("bx lr");
                    me.write(".fail:");
                    me.write(&format!("movs r0, #{TAGGED_FALSE}"));
                    me.write("bx lr");
                }
                CheckKind::Validate => {
                    me.write("bx lr");
                    me.write_fail_branch();
                }
            }
        });
    }

    fn emit_shared_def(&mut self, e: ExprId) {
        let arg = self.bin.pool.get(e).args[0];
        let total = {
            let a = self.bin.pool.get_mut(arg);
            assert!(a.total_uses >= 1);
            assert!(a.curr_uses == 0);
            a.curr_uses = 1;
            a.total_uses
        };
        if total == 1 {
            self.emit_expr(arg);
        } else {
            self.emit_expr(arg);
            self.expr_stack.insert(0, arg);
            let s = self.t.push_local("r0");
            self.write(&format!("{s}; tmpstore @{}", self.expr_stack.len()));
        }
    }

    fn clear_args(&mut self, non_refs: &[ExprId], refs: &[ExprId]) {
        for &r in non_refs.iter().chain(refs.iter()) {
            let e = self.bin.pool.get_mut(r);
            assert!(
                e.curr_uses == 0 && e.total_uses == 1,
                "wrong uses: {} {}",
                e.curr_uses,
                e.total_uses
            );
            e.curr_uses = 1;
        }
        self.clear_stack(false);
    }

    fn emit_rt_call(&mut self, top: ExprId, field_store: Option<ExprId>) {
        let (name, args, mask) = {
            let e = self.bin.pool.get(top);
            let name = match &e.kind {
                ExprKind::RuntimeCall(n) => n.clone(),
                _ => unreachable!("not a runtime call"),
            };
            (name, e.args.clone(), e.mask.clone().unwrap_or_default())
        };

        let mut all: Vec<RtArg> = args
            .iter()
            .enumerate()
            .map(|(i, &a)| RtArg {
                idx: i,
                expr: a,
                is_simple: self.bin.pool.is_literal(a),
                is_ref: mask.ref_mask & (1 << i) != 0,
                conv: mask
                    .conversions
                    .iter()
                    .find(|c| c.arg_idx == i)
                    .map(|c| c.method.clone()),
            })
            .collect();

        assert!(all.len() <= 4);

        let mut seen_update = false;
        for i in (0..all.len()).rev() {
            if self.bin.pool.is_pure(all[i].expr) {
                if !all[i].is_simple
                    && !all[i].is_ref
                    && (!seen_update || self.bin.pool.is_stateless(all[i].expr))
                {
                    all[i].is_simple = true;
                }
            } else {
                seen_update = true;
            }
        }

        // conversions may apply even to literals
        for a in all.iter_mut() {
            if a.conv.is_some() {
                a.is_simple = false;
            }
        }

        let mut complex: Vec<usize> = all
            .iter()
            .enumerate()
            .filter(|(_, a)| !a.is_simple)
            .map(|(i, _)| i)
            .collect();

        if complex
            .iter()
            .all(|&i| self.bin.pool.is_pure(all[i].expr) && !all[i].is_ref && all[i].conv.is_none())
        {
            for &i in &complex {
                all[i].is_simple = true;
            }
            complex.clear();
        }

        let mut clear_stack = true;

        if complex.len() == 1
            && all[complex[0]].conv.is_none()
            && !all[complex[0]].is_ref
        {
            let cidx = all[complex[0]].idx;
            let cexpr = all[complex[0]].expr;
            self.emit_expr(cexpr);
            if cidx != 0 {
                let s = self.t.mov(&format!("r{cidx}"), "r0");
                self.write(&s);
            }
            clear_stack = false;
        } else {
            for &i in &complex {
                let ex = all[i].expr;
                self.push_arg(ex);
            }

            self.align_expr_stack(0);

            let conv_args: Vec<usize> = complex
                .iter()
                .copied()
                .filter(|&i| all[i].conv.is_some())
                .collect();
            if !conv_args.is_empty() {
                let inline = self.bin.target.inline_conversions;
                let stack_aligned = self.t.stack_aligned();
                let conv = self.redirect(|me| {
                    let mut off: i64 = if inline {
                        0
                    } else if stack_aligned {
                        2
                    } else {
                        1
                    };
                    for &i in &conv_args {
                        let s = me.load_from_expr_stack("r0", all[i].expr, off, false);
                        me.write(&s);
                        let method = all[i].conv.clone().unwrap_or_default();
                        me.aligned_call(&method, "", off, false);
                        let s = me.t.push_fixed(&["r0"]);
                        me.write(&s);
                        off += 1;
                    }
                    for &i in conv_args.iter().rev() {
                        off -= 1;
                        let reg = format!("r{}", all[i].idx);
                        let s = me.t.pop_fixed(&[reg.as_str()]);
                        me.write(&s);
                    }
                    for &i in &complex {
                        if all[i].conv.is_none() {
                            let reg = format!("r{}", all[i].idx);
                            let s = me.load_from_expr_stack(&reg, all[i].expr, off, false);
                            me.write(&s);
                        }
                    }
                });
                if inline {
                    self.write(&conv);
                } else {
                    let body = format!(
                        "{}\n{}{}",
                        self.t.helper_prologue(),
                        conv,
                        self.t.helper_epilogue()
                    );
                    self.emit_helper(&body, "conv");
                }
            } else {
                // not really worth a helper; some of this gets peep-holed away
                for &i in &complex {
                    let reg = format!("r{}", all[i].idx);
                    let s = self.load_from_expr_stack(&reg, all[i].expr, 0, false);
                    self.write(&s);
                }
            }
        }

        for i in 0..all.len() {
            if all[i].is_simple {
                let ex = all[i].expr;
                let reg = format!("r{}", all[i].idx);
                self.emit_expr_into(ex, &reg);
            }
        }

        match field_store {
            Some(trg) => self.emit_field_access(trg, true),
            None => {
                if let Some(op) = name.strip_prefix("thumb::") {
                    let s = self.t.rt_call(op, "r0", "r1");
                    self.write(&s);
                } else if name != "langsupp::ignore" {
                    self.aligned_call(&name, "", 0, true);
                }
            }
        }

        if clear_stack {
            let non_refs: Vec<ExprId> = complex
                .iter()
                .filter(|&&i| !all[i].is_ref)
                .map(|&i| all[i].expr)
                .collect();
            let refs: Vec<ExprId> = complex
                .iter()
                .filter(|&&i| all[i].is_ref)
                .map(|&i| all[i].expr)
                .collect();
            self.clear_args(&non_refs, &refs);
        }
    }

    fn aligned_call(&mut self, name: &str, cmt: &str, off: i64, save_stack: bool) {
        let save = save_stack && !(name.starts_with("_cmp_") || name.starts_with("_pxt_"));
        let s = self.t.call_lbl(name, save, self.stack_alignment_needed(off));
        self.write(&format!("{s}{cmt}"));
    }

    fn emit_labelled_helper<F: FnOnce(&mut Self)>(&mut self, lbl: &str, generate: F) {
        if let Some(cached) = self.labelled_helpers.get(lbl).cloned() {
            let s = self.t.call_lbl(&cached, false, 0);
            self.write(&s);
        } else {
            let outp = self.redirect(generate);
            self.emit_helper(&outp, lbl);
            if let Some((_, actual)) = self.bin.code_helpers.iter().find(|(b, _)| *b == outp) {
                self.labelled_helpers
                    .insert(lbl.to_string(), actual.clone());
            }
        }
    }

    fn emit_helper(&mut self, asm: &str, base: &str) {
        let lbl = match self.bin.code_helpers.iter().find(|(b, _)| b == asm) {
            Some((_, l)) => l.clone(),
            None => {
                let l = format!("_{base}_{}", self.bin.code_helpers.len());
                self.bin.code_helpers.push((asm.to_string(), l.clone()));
                l
            }
        };
        let s = self.t.call_lbl(&lbl, false, 0);
        self.write(&s);
    }

    fn push_to_expr_stack(&mut self, a: ExprId) {
        let e = self.bin.pool.get_mut(a);
        e.total_uses = 1;
        e.curr_uses = 0;
        self.expr_stack.insert(0, a);
    }

    fn push_arg(&mut self, a: ExprId) {
        self.clear_stack(true);
        self.emit_expr(a);
        self.clear_stack(true);
        let s = self.t.push_local("r0");
        self.write(&format!("{s} ; proc-arg"));
        self.push_to_expr_stack(a);
    }

    fn load_from_expr_stack(&mut self, r: &str, a: ExprId, off: i64, store: bool) -> String {
        let idx = match self.expr_stack.iter().position(|&x| x == a) {
            Some(i) => i as i64,
            None => unreachable!("expression not on stack"),
        };
        let s = self
            .t
            .load_reg_src_off(r, "sp", &(idx + off).to_string(), true, store, None);
        format!("{s} ; estack\n")
    }

    fn push_dummy(&mut self) {
        let dummy = self.bin.pool.numlit(0);
        let e = self.bin.pool.get_mut(dummy);
        e.total_uses = 1;
        e.curr_uses = 1;
        self.expr_stack.insert(0, dummy);
    }

    fn align_expr_stack(&mut self, numargs: i64) {
        let inter_align = self.stack_alignment_needed(numargs);
        for _ in 0..inter_align {
            // r5 is safe to push on the gc-scanned stack
            self.write("push {r5} ; align");
            self.push_dummy();
        }
    }

    fn emit_proc_call(&mut self, top: ExprId) {
        let (target, args) = {
            let e = self.bin.pool.get(top);
            let t = match &e.kind {
                ExprKind::ProcCall(t) => t.clone(),
                _ => unreachable!("not a procedure call"),
            };
            (t, e.args.clone())
        };
        let is_lambda = matches!(target, ProcCallTarget::Lambda);

        let mut complex: Vec<ExprId> = Vec::new();
        let mut seen_update = false;
        for &c in args.iter().rev() {
            if self.bin.pool.is_pure(c) {
                if !seen_update || self.bin.pool.is_stateless(c) {
                    continue;
                }
            } else {
                seen_update = true;
            }
            complex.push(c);
        }
        complex.reverse();

        let mut the_one: Option<ExprId> = None;
        let mut the_one_reg = "";
        if complex.len() <= 1 {
            // with at most one complex argument nothing needs re-pushing
            if let Some(&a0) = complex.first() {
                the_one = Some(a0);
                self.clear_stack(true);
                self.emit_expr(a0);
                if args.last() == Some(&a0) {
                    the_one_reg = "r0";
                } else {
                    the_one_reg = "r3";
                    let s = self.t.mov("r3", "r0");
                    self.write(&s);
                }
            }
            complex.clear();
        } else {
            for &a in &complex.clone() {
                self.push_arg(a);
            }
        }

        self.align_expr_stack(args.len() as i64);

        // r7 can be clobbered while loading globals, leave it out
        const REGS: [&str; 4] = ["r1", "r2", "r3", "r4"];
        let mut reg_list: Option<Vec<&'static str>> = Some(REGS.to_vec());
        let mut reg_exprs: Vec<ExprId> = Vec::new();

        if !complex.is_empty() {
            let mut max_depth: i64 = -1;
            for &c in &complex {
                if let Some(i) = self.expr_stack.iter().position(|&x| x == c) {
                    max_depth = max_depth.max(i as i64);
                }
            }
            let max_depth = (max_depth + 1) as usize;
            if max_depth <= REGS.len() {
                let regs: Vec<&'static str> = REGS[..max_depth].to_vec();
                let s = self.t.pop_fixed(&regs);
                self.write(&s);
                reg_exprs = self.expr_stack.drain(..max_depth).collect();

                // re-push whatever is not an argument
                let mut push_list: Vec<&'static str> = Vec::new();
                for i in (0..max_depth).rev() {
                    if !complex.contains(&reg_exprs[i]) {
                        push_list.push(regs[i]);
                        self.expr_stack.insert(0, reg_exprs[i]);
                    }
                }
                if !push_list.is_empty() {
                    let s = self.t.push_fixed(&push_list);
                    self.write(&s);
                }
                reg_list = Some(regs);
            } else {
                reg_list = None;
                let s = self.t.reg_gets_imm("r7", 0);
                self.write(&s);
            }
        }

        let mut args_to_push: Vec<ExprId> = args.iter().rev().copied().collect();
        // the lambda object itself lands deepest on the stack
        if is_lambda {
            if let Some(last) = args_to_push.pop() {
                args_to_push.insert(0, last);
            }
        }

        for &a in &args_to_push {
            if complex.contains(&a) {
                if let Some(regs) = &reg_list {
                    let i = match reg_exprs.iter().position(|&x| x == a) {
                        Some(i) => i,
                        None => unreachable!("complex argument missing from registers"),
                    };
                    let s = self.t.push_fixed(&[regs[i]]);
                    self.write(&s);
                } else {
                    let s = self.load_from_expr_stack("r0", a, 0, false);
                    self.write(&s);
                    let s = self.t.push_local("r0");
                    self.write(&format!("{s} ; re-push"));
                    let s = self.load_from_expr_stack("r7", a, 1, true);
                    self.write(&s);
                    let idx = match self.expr_stack.iter().position(|&x| x == a) {
                        Some(i) => i,
                        None => unreachable!("argument missing from stack"),
                    };
                    let the_null = self.bin.pool.numlit(0);
                    {
                        let n = self.bin.pool.get_mut(the_null);
                        n.curr_uses = 1;
                        n.total_uses = 1;
                    }
                    self.expr_stack[idx] = the_null;
                }
                self.expr_stack.insert(0, a);
            } else if Some(a) == the_one {
                let s = self.t.push_local(the_one_reg);
                self.write(&format!("{s} ; the one arg"));
                self.push_to_expr_stack(a);
            } else {
                self.push_arg(a);
            }
        }

        let lbl = self.mk_lbl("_proccall");
        let mut proc_index = -1;

        match &target {
            ProcCallTarget::Lambda => {
                let numargs = args.len() - 1;
                let s = self.load_from_expr_stack("r0", args[0], 0, false);
                self.write(&s);
                self.emit_labelled_helper(&format!("lambda_call{numargs}"), |me| {
                    me.lambda_call(numargs);
                    me.write_fail_branch();
                });
                self.write(&format!("{lbl}:"));
            }
            ProcCallTarget::Iface { index, is_set } => {
                if *is_set {
                    assert!(args.len() == 2);
                }
                self.emit_iface_call(*index, *is_set);
                self.write(&format!("{lbl}:"));
            }
            ProcCallTarget::Virtual { index, class } => {
                self.emit_class_call(*index, class.clone(), false);
                self.write(&format!("{lbl}:"));
            }
            ProcCallTarget::Static { proc, is_this } => {
                proc_index = self.bin.procs[*proc].seq_no as i32;
                let plabel = self.bin.procs[*proc].label.clone();
                let suffix = if *is_this { "_nochk" } else { "" };
                let s = self.t.call_lbl(&format!("{plabel}{suffix}"), false, 0);
                self.write(&s);
                self.write(&format!("{lbl}:"));
            }
        }

        self.calls.push(ProcCallInfo {
            proc_index,
            call_label: lbl,
            addr: 0,
            stack: 0,
        });

        // the callee may overwrite arguments on the stack, treat them all
        // as refs; the lambda expression itself is exempt
        if is_lambda && self.bin.pool.is_stateless(args[0]) {
            self.clear_args(&args[..1], &args[1..]);
        } else {
            self.clear_args(&[], &args);
        }
    }

    fn emit_class_call(&mut self, index: i64, class: ClassDesc, is_this: bool) {
        let eff = (index + FIRST_METHOD_OFFSET) * 4;
        let s = self.t.emit_int(eff, "r1");
        self.write(&s);

        let mut lbl = format!("classCall_{}", class.id);
        if is_this {
            lbl.push_str("_this");
        }
        let skip_check = self.bin.target.skip_class_check;
        self.emit_labelled_helper(&lbl, move |me| {
            me.write("ldr r0, [sp, #0] ; ld-this");
            me.load_vtable("r2", ".fail", ".fail");
            if !skip_check && !is_this {
                me.check_subtype(&class, ".fail", "r2");
            }
            me.write("ldr r1, [r3, r1] ; ld-method");
            me.write("bx r1 ; keep lr from caller");
            me.write_fail_branch();
        });
    }

    fn emit_iface_call(&mut self, index: i64, is_set: bool) {
        let s = self.t.emit_int(index, "r1");
        self.write(&s);
        let lbl = format!("iface_call{}", if is_set { "_set" } else { "" });
        let map_method = if is_set { "pxt::mapSet" } else { "pxt::mapGet" };
        self.emit_labelled_helper(&lbl, |me| {
            let body = me.t.vcall(map_method, is_set);
            me.write(&body);
        });
    }

    fn lambda_call(&mut self, numargs: usize) {
        self.write("; lambda call");
        self.load_vtable("r2", ".fail", ".fail");
        if !self.bin.target.skip_class_check {
            self.check_subtype(&builtin_class(BUILTIN_REF_ACTION), ".fail", "r2");
        }

        // functions without captures skip the r5 shuffle below
        self.write(&format!("movs r4, #{numargs}"));
        self.write("ldrh r1, [r0, #4]");
        self.write("cmp r1, #0");
        self.write("bne .pushR5");
        self.write("ldr r1, [r0, #8]");
        self.write("bx r1 ; keep lr from the caller");
        self.write(".pushR5:");
        self.write("sub sp, #8");

        // move arguments two slots up
        for i in 0..numargs {
            self.write(&format!("ldr r1, [sp, #4*{}]", i + 2));
            self.write(&format!("str r1, [sp, #4*{i}]"));
        }

        // save lr and r5 (outer lambda ctx) in the freed slots
        self.write(&format!("str r5, [sp, #4*{numargs}]"));
        self.write("mov r1, lr");
        self.write(&format!("str r1, [sp, #4*{}]", numargs + 1));
        self.write("mov r5, r0");
        self.write("ldr r7, [r5, #8]");
        self.write("blx r7 ; exec actual lambda");
        self.write(&format!(
            "ldr r4, [sp, #4*{}] ; restore what was in LR",
            numargs + 1
        ));
        self.write(&format!("ldr r5, [sp, #4*{numargs}] ; restore lambda ctx"));

        // move arguments back where they were
        for i in 0..numargs {
            self.write(&format!("ldr r1, [sp, #4*{i}]"));
            self.write(&format!("str r1, [sp, #4*{}]", i + 2));
        }

        self.write("add sp, #8");
        self.write("bx r4");
        self.write("; end lambda call");
    }

    fn emit_store(&mut self, trg: ExprId, src: ExprId) {
        let kind = self.bin.pool.get(trg).kind.clone();
        match kind {
            ExprKind::CellRef(cell) => {
                self.emit_expr(src);
                if cell.is_global() {
                    let inf = bit_size_info(cell.bit_size);
                    let mut off = format!("#{}", cell.index);
                    if cell.index >= inf.imm_limit {
                        let s = self.t.emit_int(cell.index, "r1");
                        self.write(&s);
                        off = "r1".to_string();
                    }
                    let s = self.t.load_reg_src_off("r7", "r6", "#0", false, false, None);
                    self.write(&s);
                    let s = self
                        .t
                        .load_reg_src_off("r0", "r7", &off, false, true, Some(&inf));
                    self.write(&s);
                } else {
                    let (reg, imm, word) = self.cellref(&cell);
                    let s = self.t.load_reg_src_off("r0", &reg, &imm, word, true, None);
                    self.write(&s);
                }
            }
            ExprKind::FieldAccess(_) => {
                let arg0 = self.bin.pool.get(trg).args[0];
                let dummy = self.bin.pool.rtcall("dummy", vec![arg0, src]);
                self.emit_rt_call(dummy, Some(trg));
            }
            _ => unreachable!("bad store target"),
        }
    }

    fn cellref(&self, cell: &Cell) -> (String, String, bool) {
        match cell.kind {
            CellKind::Global => unreachable!("globals are addressed through r6"),
            CellKind::Capture => {
                let idx = cell.index + 3;
                assert!((0..32).contains(&idx));
                ("r5".to_string(), idx.to_string(), true)
            }
            CellKind::Arg => ("sp".to_string(), format!("args@{}", cell.index), false),
            CellKind::Local => ("sp".to_string(), format!("locals@{}", cell.index), false),
        }
    }

    fn emit_lambda_wrapper(&mut self, is_main: bool) -> Result<(), AsmError> {
        self.write("");
        self.write(".section code");
        self.write(".balign 4");

        if is_main {
            self.used_as_value = true;
            self.bin.procs[self.proc_idx].used_as_value = true;
        }
        if !self.used_as_value {
            return Ok(());
        }

        let base = self.label.clone();
        self.write(&format!("{base}_Lit:"));
        let hdr = self.t.obj_header("pxt::RefAction_vtable");
        self.write(&hdr);
        self.write(".short 0, 0 ; no captured vars");
        self.write(&format!(".word {base}_args@fn"));
        self.write(&format!("{base}_args:"));

        let numargs = self.num_args;
        if numargs == 0 {
            return Ok(());
        }
        if numargs > 3 {
            return Err(AsmError::new(
                AsmErrorKind::Lowering,
                "only up to three parameters supported in lambdas",
                Some(&self.full_name),
            ));
        }

        self.write(&format!("cmp r4, #{numargs}"));
        self.write(&format!("bge {base}_nochk"));

        let needs_align = self.stack_alignment_needed(numargs as i64 + 1) != 0;
        let numpush = if needs_align { numargs + 2 } else { numargs + 1 };

        self.write("push {lr}");

        self.emit_labelled_helper(&format!("expand_args_{numargs}"), |me| {
            me.write("movs r0, #0");
            me.write("movs r1, #0");
            if needs_align {
                me.write("push {r0}");
            }
            for i in (1..=numargs).rev() {
                if i != numargs {
                    me.write(&format!("cmp r4, #{i}"));
                    me.write(&format!("blt .zero{i}"));
                    me.write(&format!("ldr r0, [sp, #{}*4]", numpush - 1));
                    me.write(&format!("str r1, [sp, #{}*4] ; clear existing", numpush - 1));
                    me.write(&format!(".zero{i}:"));
                }
                me.write("push {r0}");
            }
            me.write("bx lr");
        });

        self.write(&format!("bl {base}_nochk"));

        let stack_size = numargs + usize::from(needs_align);
        self.write(&format!("@dummystack {stack_size}"));
        self.write(&format!("add sp, #4*{stack_size}"));
        self.write("pop {pc}");
        Ok(())
    }
}

/// Resolve addresses and stack depths recorded during lowering against
/// the assembled label table.
pub fn finalize_debug_info(bin: &mut Binary, f: &mut AsmFile) {
    let labels = f.get_labels().clone();
    let look = |name: &str| labels.get(name).copied().unwrap_or(0);

    for i in 0..bin.procs.len() {
        let base = bin.procs[i].label.clone();
        let seq = bin.procs[i].seq_no;

        let locals: Vec<CellInfo> = if seq == 1 {
            bin.globals.iter().map(|c| c.debug_info()).collect()
        } else {
            bin.procs[i].locals.iter().map(|c| c.debug_info()).collect()
        };
        let args: Vec<CellInfo> = bin.procs[i].args.iter().map(|c| c.debug_info()).collect();

        let locals_mark = f
            .stack_at_label
            .get(&format!("{base}_locals"))
            .copied()
            .unwrap_or(0);

        for ci in &mut bin.procs[i].calls {
            ci.addr = look(&ci.call_label);
            ci.stack = f.stack_at_label.get(&ci.call_label).copied().unwrap_or(0);
        }

        if bin.breakpoints {
            // breakpoint stops must observe exactly the locals frame
            for s in &bin.procs[i].body {
                if let Stmt::Breakpoint(bi) = s {
                    let off = f
                        .stack_at_label
                        .get(&format!("__brkp_{}", bi.id))
                        .copied()
                        .unwrap_or(-1);
                    assert!(
                        off == locals_mark,
                        "breakpoint offset doesn't match: {off} != {locals_mark}"
                    );
                }
            }
        }

        let calls = bin.procs[i].calls.clone();
        bin.procs[i].debug_info = Some(ProcDebugInfo {
            name: bin.procs[i].full_name.clone(),
            idx: seq,
            locals,
            args,
            code_start_loc: look(&format!("{base}_locals")),
            code_end_loc: look(&format!("{base}_end")),
            bkpt_loc: look(&format!("{base}_bkpt")),
            locals_mark,
            size: look(&format!("{base}_end")) + 2 - look(&format!("{base}_pre")),
            calls,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BitSize, Procedure, TargetConfig};
    use crate::lowering::thumb::ThumbSnippets;

    fn lower_proc(mut bin: Binary, proc: Procedure) -> (String, Binary) {
        let idx = bin.add_proc(proc);
        let mut pool = std::mem::take(&mut bin.pool);
        bin.procs[idx].resolve(&mut pool);
        bin.pool = pool;
        let t = ThumbSnippets::new(bin.target.clone());
        let out = match ProcLowerer::lower(&t, &mut bin, idx) {
            Ok(s) => s,
            Err(e) => panic!("lowering failed: {e}"),
        };
        (out, bin)
    }

    #[test]
    fn simple_proc_frames_and_returns() {
        let mut bin = Binary::new(TargetConfig::default());
        let g = bin.mk_global("counter", BitSize::None);
        let mut p = Procedure::new("_main", "main", 0);
        let trg = bin.pool.cellref(&g);
        let one = bin.pool.numlit(1);
        let st = bin.pool.store(trg, one);
        p.emit_expr(st);
        p.stack_empty();
        let (out, _) = lower_proc(bin, p);

        assert!(out.contains("; Function main"));
        assert!(out.contains("_main:"));
        assert!(out.contains("push {lr}"));
        assert!(out.contains("movs r0, #1"));
        // global store goes through the globals pointer in r6
        assert!(out.contains("ldr r7, [r6, #0]"));
        assert!(out.contains("str r0, [r7, #0]"));
        assert!(out.contains("_main_end:"));
        assert!(out.contains("; endfun"));
    }

    #[test]
    fn shared_expression_is_stored_and_reloaded() {
        let mut bin = Binary::new(TargetConfig::default());
        let mut p = Procedure::new("_f", "f", 0);
        let call = bin.pool.rtcall("pxt::mkSomething", vec![]);
        let r1 = bin.pool.shared(call);
        let r2 = bin.pool.shared(r1);
        let def = bin.pool.shared_def(call);
        let add = bin.pool.rtcall("thumb::adds", vec![r1, r2]);
        p.emit_expr(def);
        p.emit_expr(add);
        p.stack_empty();
        let (out, _) = lower_proc(bin, p);

        assert!(out.contains("; tmpstore @1"));
        assert!(out.contains("; tmpref @1"));
        // second ref is the last use on top of stack, popped directly
        assert!(out.contains("pop {r1}"));
        assert!(out.contains("adds r0, r1"));
    }

    #[test]
    fn lambda_wrapper_rejects_too_many_parameters() {
        let mut bin = Binary::new(TargetConfig::default());
        let mut p = Procedure::new("_big", "big", 0);
        p.used_as_value = true;
        for name in ["a", "b", "c", "d"] {
            p.mk_arg(name);
        }
        p.stack_empty();
        let idx = bin.add_proc(p);
        let t = ThumbSnippets::new(bin.target.clone());
        let err = match ProcLowerer::lower(&t, &mut bin, idx) {
            Ok(_) => panic!("expected lowering error"),
            Err(e) => e,
        };
        assert!(err
            .message()
            .contains("only up to three parameters supported in lambdas"));
    }

    #[test]
    fn labelled_helpers_are_emitted_once() {
        let mut bin = Binary::new(TargetConfig::default());
        let cls = ClassDesc {
            id: "C7".to_string(),
            class_no: 12,
            last_subtype_no: 14,
        };
        let mut p = Procedure::new("_g", "g", 0);
        let a = bin.pool.numlit(0);
        let i1 = bin
            .pool
            .alloc(ExprKind::InstanceOf(cls.clone(), CheckKind::Bool), vec![a]);
        let b = bin.pool.numlit(0);
        let i2 = bin.pool.alloc(ExprKind::InstanceOf(cls, CheckKind::Bool), vec![b]);
        p.emit_expr(i1);
        p.emit_expr(i2);
        p.stack_empty();
        let (out, bin) = lower_proc(bin, p);

        assert_eq!(bin.code_helpers.len(), 1);
        let (body, lbl) = &bin.code_helpers[0];
        assert!(lbl.starts_with("_inst_C7_bool_"));
        assert!(body.contains("cmp r2, #12"));
        assert!(body.contains("cmp r2, #14"));
        // both sites call the same helper
        assert_eq!(out.matches(&format!("bl {lbl}")).count(), 2);
    }

    #[test]
    fn static_call_records_call_site() {
        let mut bin = Binary::new(TargetConfig::default());
        let callee = Procedure::new("_leaf", "leaf", 0);
        let callee_idx = bin.add_proc(callee);
        let mut p = Procedure::new("_caller", "caller", 0);
        let call = bin.pool.proc_call(
            ProcCallTarget::Static {
                proc: callee_idx,
                is_this: false,
            },
            vec![],
        );
        p.emit_expr(call);
        p.stack_empty();

        let idx = bin.add_proc(p);
        let mut pool = std::mem::take(&mut bin.pool);
        bin.procs[idx].resolve(&mut pool);
        bin.pool = pool;
        let t = ThumbSnippets::new(bin.target.clone());
        let out = match ProcLowerer::lower(&t, &mut bin, idx) {
            Ok(s) => s,
            Err(e) => panic!("lowering failed: {e}"),
        };

        assert!(out.contains("bl _leaf"));
        assert_eq!(bin.procs[idx].calls.len(), 1);
        assert_eq!(bin.procs[idx].calls[0].proc_index, 1);
        assert!(bin.procs[idx].calls[0].call_label.starts_with("_proccall"));
    }

    #[test]
    fn conditional_jump_emits_compare_and_skip() {
        let mut bin = Binary::new(TargetConfig::default());
        let mut p = Procedure::new("_j", "j", 0);
        let cond = bin.pool.numlit(0);
        p.emit_jmp(".done", Some(cond), JmpMode::IfZero);
        p.emit(Stmt::Label(".done".to_string()));
        p.stack_empty();
        let (out, _) = lower_proc(bin, p);

        assert!(out.contains("cmp r0, #0"));
        assert!(out.contains("bne .jmpz0"));
        assert!(out.contains("bb .done"));
        assert!(out.contains(".jmpz0:"));
    }
}

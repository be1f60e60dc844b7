// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Instruction-set seam between the IR lowering and a concrete target.
//!
//! The lowering talks about virtual registers with ARM-ish roles: r0 is
//! the current value, r0-r3 carry runtime-call arguments, r5 holds the
//! lambda capture context, r6 the globals pointer, r4 and r7 are scratch.
//! A snippets implementation renders those operations as target assembly.

/// Width and addressing limits for sized global loads and stores.
#[derive(Debug, Clone, Copy)]
pub struct BitSizeInfo {
    pub size: i64,
    pub needs_sign_ext: bool,
    /// Highest byte offset encodable as an immediate for this width.
    pub imm_limit: i64,
}

pub trait AssemblerSnippets {
    fn stack_aligned(&self) -> bool {
        false
    }

    fn push_lr(&self) -> String;
    fn pop_pc(&self) -> String;

    fn nop(&self) -> String;
    fn reg_gets_imm(&self, reg: &str, imm: i64) -> String;
    /// Allocate and zero-initialize `numlocals` stack slots.
    fn proc_setup(&self, numlocals: i64) -> String;
    fn push_fixed(&self, regs: &[&str]) -> String;
    fn push_local(&self, reg: &str) -> String;
    fn pop_fixed(&self, regs: &[&str]) -> String;
    fn pop_locals(&self, n: i64) -> String;
    fn proc_return(&self) -> String;

    fn debugger_stmt(&self, lbl: &str) -> String;
    fn debugger_bkpt(&self, lbl: &str) -> String;
    fn debugger_proc(&self, lbl: &str) -> String;

    fn unconditional_branch(&self, lbl: &str) -> String;
    fn beq(&self, lbl: &str) -> String;
    fn bne(&self, lbl: &str) -> String;
    fn cmp(&self, reg1: &str, reg2: &str) -> String;
    fn cmp_zero(&self, reg: &str) -> String;

    /// Load or store `reg` at `[src, off]`. `word` scales the offset by
    /// the word size; `inf` narrows the access width.
    fn load_reg_src_off(
        &self,
        reg: &str,
        src: &str,
        off: &str,
        word: bool,
        store: bool,
        inf: Option<&BitSizeInfo>,
    ) -> String;

    /// Two-operand ALU op by mnemonic, e.g. `adds r0, r1`.
    fn rt_call(&self, name: &str, r0: &str, r1: &str) -> String;
    /// Call a label. `save_stack` and `align` are hints; a target that
    /// keeps alignment through its prologue may ignore them.
    fn call_lbl(&self, lbl: &str, save_stack: bool, align: i64) -> String;
    fn call_reg(&self, reg: &str) -> String;

    fn helper_prologue(&self) -> String;
    fn helper_epilogue(&self) -> String;

    /// Load the full address of `lbl` into `reg` (literal-pool load).
    fn load_ptr_full(&self, lbl: &str, reg: &str) -> String;
    /// Synthesize the immediate `v` into `reg`.
    fn emit_int(&self, v: i64, reg: &str) -> String;
    fn mov(&self, dst: &str, src: &str) -> String;

    /// Interface dispatch body: `this` on the stack, member index in r1.
    fn vcall(&self, map_method: &str, is_set: bool) -> String;

    fn obj_header(&self, vt: &str) -> String {
        format!(".word {vt}")
    }

    /// Render one interned string literal with its length header.
    fn string_literal(&self, lbl: &str, s: &str) -> String {
        format!(
            "\n.balign 4\n{lbl}meta: .short 0xffff, {}\n{lbl}: .string {}\n",
            s.len(),
            asm_string_literal(s)
        )
    }
}

/// Quote a string for a `.string` directive, escaping the characters the
/// assembler's scanner understands.
pub fn asm_string_literal(s: &str) -> String {
    let mut r = String::from("\"");
    for &b in s.as_bytes() {
        let c = b as char;
        match c {
            '\\' | '"' => {
                r.push('\\');
                r.push(c);
            }
            '\n' => r.push_str("\\n"),
            _ if b <= 0xf => r.push_str(&format!("\\x0{b:x}")),
            _ if b < 32 || b > 127 => r.push_str(&format!("\\x{b:x}")),
            _ => r.push(c),
        }
    }
    r.push('"');
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_literal_escaping() {
        assert_eq!(asm_string_literal("hi"), "\"hi\"");
        assert_eq!(asm_string_literal("a\"b\\c"), "\"a\\\"b\\\\c\"");
        assert_eq!(asm_string_literal("x\ny"), "\"x\\ny\"");
        assert_eq!(asm_string_literal("\u{1}"), "\"\\x01\"");
        assert_eq!(asm_string_literal("\u{1f}"), "\"\\x1f\"");
    }
}

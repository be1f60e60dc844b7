// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Generic assembler framework: encoder tables, line parsing and the
//! multi-pass driver. A target supplies a [`Processor`] implementation
//! with its concrete instruction set and peephole rules.

pub mod cli;
pub mod encoder;
pub mod file;
pub mod line;

pub use encoder::{EmitResult, Encoder, EncoderKind, Instruction, ProcessorCore};
pub use file::{AsmFile, InlineError};
pub use line::{Line, LineKind, PeepCounts};

/// A three-instruction rewrite window handed to [`Processor::peephole`].
/// Rules only ever mutate lines inside the window.
pub struct PeepWindow<'w, 'a> {
    pub ln: &'w mut Line<'a>,
    pub next: &'w mut Line<'a>,
    pub next2: Option<&'w mut Line<'a>>,
    pub counts: &'w mut PeepCounts,
}

/// Target-specific half of the assembler: encoders, instruction table,
/// register names, label addressing and local rewrite rules.
pub trait Processor {
    fn core(&self) -> &ProcessorCore;

    fn word_size(&self) -> i64;

    fn register_no(&self, _actual: &str) -> Option<i64> {
        None
    }

    fn is32bit(&self, _instr: &Instruction) -> bool {
        false
    }

    fn emit32(&self, _opcode: u32, _v: i64, actual: &str) -> EmitResult {
        encoder::emit_err("no 32-bit instructions", actual)
    }

    fn post_process_rel_address(&self, _f: &AsmFile, v: i64) -> i64 {
        v
    }

    fn post_process_abs_address(&self, _f: &AsmFile, v: i64) -> i64 {
        v
    }

    fn peephole(&self, _w: PeepWindow) {}

    fn get_address_from_label(&self, _f: &AsmFile, _s: &str, _word_aligned: bool) -> Option<i64> {
        None
    }

    fn is_pop(&self, _opcode: u32) -> bool {
        false
    }

    fn is_push(&self, _opcode: u32) -> bool {
        false
    }

    fn is_add_sp(&self, _opcode: u32) -> bool {
        false
    }

    fn is_sub_sp(&self, _opcode: u32) -> bool {
        false
    }

    fn expand_ldlit(&self, _f: &mut AsmFile) {}

    fn compute_stack_offset(&self, _kind: &str, offset: i64) -> i64 {
        offset
    }

    fn to_fn_ptr(&self, v: i64, _base_off: i64, _lbl: &str) -> i64 {
        v
    }
}

/// Conformance-test helpers shared by processor test suites.
#[cfg(test)]
pub mod testing {
    use super::*;

    /// Assemble `asm` and require at least one error.
    pub fn expect_error(ei: &dyn Processor, asm: &str) {
        let mut f = AsmFile::new(ei);
        f.emit(asm);
        assert!(!f.errors.is_empty(), "expecting error for: {asm}");
    }

    /// `disasm` carries expected opcodes as leading hex words, in the
    /// style of a disassembly listing; strip them, assemble the rest and
    /// compare buffers.
    pub fn expect(ei: &dyn Processor, disasm: &str) {
        let mut exp: Vec<u16> = Vec::new();
        let mut asm = String::new();
        for line in disasm.lines() {
            let trimmed = line.trim_start();
            let hexlen = trimmed
                .bytes()
                .take_while(|b| b.is_ascii_hexdigit())
                .count();
            if (hexlen == 4 || hexlen == 8)
                && trimmed
                    .as_bytes()
                    .get(hexlen)
                    .map(|b| b.is_ascii_whitespace())
                    .unwrap_or(true)
            {
                exp.push(u16::from_str_radix(&trimmed[..4], 16).unwrap());
                if hexlen == 8 {
                    exp.push(u16::from_str_radix(&trimmed[4..8], 16).unwrap());
                }
                asm.push_str(&trimmed[hexlen..]);
            } else {
                asm.push_str(line);
            }
            asm.push('\n');
        }

        let mut f = AsmFile::new(ei);
        f.panic_on_error = true;
        f.disable_peephole = true;
        f.emit(&asm);
        assert!(f.errors.is_empty(), "not expecting errors for: {asm}");

        assert_eq!(
            f.buf, exp,
            "wrong buffer content for:\n{asm}\nexp: {exp:04x?}\ngot: {:04x?}",
            f.buf
        );
    }
}

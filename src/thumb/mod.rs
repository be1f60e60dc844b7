// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Thumb (ARMv6-M) processor: instruction table, 32-bit branch encoding,
//! literal-pool placement and the peephole rules run by the driver.

mod table;

use crate::asm::encoder::{emit_err, EmitResult, Encoder, Instruction};
use crate::asm::{AsmFile, Line, LineKind, PeepWindow, Processor, ProcessorCore};

/// Runtime helpers with a `_pushR0` variant that leaves r0 pushed on
/// return, plus offset-specialized forms named `<helper>_<byteoff>`.
const RT_CALL_PUSH_R0_VARIANTS: &[(&str, &str)] = &[
    ("_pxt_incr", "_pxt_incr_pushR0"),
    ("_pxt_decr", "_pxt_decr_pushR0"),
];

fn push_r0_variant(name: &str) -> Option<&'static str> {
    RT_CALL_PUSH_R0_VARIANTS
        .iter()
        .find(|&&(base, _)| base == name)
        .map(|&(_, variant)| variant)
}

/// Helpers that accept an sp-relative load folded into their name.
fn takes_sp_offset_suffix(name: &str) -> bool {
    RT_CALL_PUSH_R0_VARIANTS
        .iter()
        .any(|&(base, variant)| name == base || name == variant)
}

pub struct ThumbProcessor {
    core: ProcessorCore,
    /// Target runtime is ARM C++; mangled symbols then point at ARM-state
    /// functions and must not get the Thumb bit.
    pub runtime_is_arm: bool,
}

impl Default for ThumbProcessor {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ThumbProcessor {
    pub fn new(runtime_is_arm: bool) -> Self {
        Self {
            core: table::build_core(),
            runtime_is_arm,
        }
    }
}

impl Processor for ThumbProcessor {
    fn core(&self) -> &ProcessorCore {
        &self.core
    }

    fn word_size(&self) -> i64 {
        4
    }

    fn register_no(&self, actual: &str) -> Option<i64> {
        table::register_no(actual)
    }

    fn is32bit(&self, instr: &Instruction) -> bool {
        instr.name == "bl" || instr.name == "bb"
    }

    fn emit32(&self, _opcode: u32, v: i64, actual: &str) -> EmitResult {
        let mut v = v;
        let is_blx = v & 1 != 0;
        if is_blx {
            v = (v + 1) & !3;
        }
        // off is in instructions, not bytes; range is +-2M instructions
        let off = v >> 1;
        if !(-2 * 1024 * 1024 < off && off < 2 * 1024 * 1024) {
            return emit_err("jump out of range", actual);
        }
        let imm11 = (off & 0x7ff) as u32;
        let imm10 = ((off >> 11) & 0x3ff) as u32;
        EmitResult::Emitted {
            stack: 0,
            opcode: if off < 0 { 0xf400 | imm10 } else { 0xf000 | imm10 },
            opcode2: Some(if is_blx { 0xe800 | imm11 } else { 0xf800 | imm11 }),
            num_args: vec![v],
            label_name: Some(actual.to_string()),
        }
    }

    fn post_process_abs_address(&self, f: &AsmFile, v: i64) -> i64 {
        // Absolute code addresses carry the Thumb state bit; we are always
        // in Thumb state ourselves, so the stored bit signals ARM state.
        let v = v ^ 1;
        v - f.base_offset
    }

    fn get_address_from_label(&self, f: &AsmFile, s: &str, word_aligned: bool) -> Option<i64> {
        let l = f.lookup_label(s)?;
        let mut pc = f.location() as i64 + 4;
        if word_aligned {
            pc &= !3;
        }
        Some(l - pc)
    }

    fn is_pop(&self, opcode: u32) -> bool {
        opcode == 0xbc00
    }

    fn is_push(&self, opcode: u32) -> bool {
        opcode == 0xb400
    }

    fn is_add_sp(&self, opcode: u32) -> bool {
        opcode == 0xb000
    }

    fn is_sub_sp(&self, opcode: u32) -> bool {
        opcode == 0xb080
    }

    fn to_fn_ptr(&self, v: i64, base_off: i64, lbl: &str) -> i64 {
        if self.runtime_is_arm && lbl.contains("::") {
            (v + base_off) & !1
        } else {
            (v + base_off) | 1
        }
    }

    /// Rewrite `ldlit` pseudo-instructions into pc-relative loads and
    /// place the pooled literals after an unconditional control transfer,
    /// or behind a fresh jump when none is close enough.
    fn expand_ldlit(&self, f: &mut AsmFile) {
        struct Pool {
            after: usize,
            texts: Vec<String>,
            scope: String,
            line_no: u32,
        }

        let mut pools: Vec<Pool> = Vec::new();
        let mut next_good_spot: Option<usize> = None;
        let mut needs_jump_over = false;
        let mut values: Vec<(String, String)> = Vec::new();
        let mut seq = 1u32;

        for i in 0..f.lines.len() {
            let is_ldlit = f.lines[i].kind == LineKind::Instruction && f.lines[i].op() == "ldlit";
            if is_ldlit {
                if next_good_spot.is_none() {
                    // leave some slack below the 1020-byte pc-relative limit
                    let limit = f.lines[i].location + 900;
                    let mut j = i + 1;
                    while j < f.lines.len() && f.lines[j].location <= limit {
                        let op = f.lines[j].op();
                        if op == "b"
                            || op == "bb"
                            || (op == "pop" && f.lines[j].words.get(2).map(String::as_str) == Some("pc"))
                        {
                            next_good_spot = Some(j);
                        }
                        j += 1;
                    }
                    if next_good_spot.is_some() {
                        needs_jump_over = false;
                    } else {
                        needs_jump_over = true;
                        while j > i + 1 {
                            j -= 1;
                            if f.lines[j].kind == LineKind::Instruction {
                                next_good_spot = Some(j);
                                break;
                            }
                        }
                    }
                }
                let reg = f.lines[i].words[1].clone();
                let v = f.lines[i].words[3].clone();
                let lbl = match values.iter().find(|(val, _)| *val == v) {
                    Some((_, lbl)) => lbl.clone(),
                    None => {
                        seq += 1;
                        let lbl = format!("_ldlit_{seq}");
                        values.push((v, lbl.clone()));
                        lbl
                    }
                };
                let mut counts = f.peep;
                let t = format!("ldr {reg}, {lbl}");
                f.lines[i].update(&t, &mut counts);
                f.peep = counts;
            }
            if next_good_spot == Some(i) {
                next_good_spot = None;
                seq += 1;
                let jmplbl = format!("_jmpwords_{seq}");
                let mut texts: Vec<String> = Vec::new();
                if needs_jump_over {
                    texts.push(format!("bb {jmplbl}"));
                }
                texts.push(".balign 4".to_string());
                for (v, lbl) in values.drain(..) {
                    texts.push(format!("{lbl}: .word {v}"));
                }
                if needs_jump_over {
                    texts.push(format!("{jmplbl}:"));
                }
                pools.push(Pool {
                    after: i,
                    texts,
                    scope: f.lines[i].scope.clone(),
                    line_no: f.lines[i].line_no,
                });
            }
        }

        for pool in pools.into_iter().rev() {
            let mut built: Vec<Line> = Vec::new();
            for t in &pool.texts {
                f.build_line(t, &mut built);
            }
            for l in &mut built {
                l.scope = pool.scope.clone();
                l.line_no = pool.line_no;
            }
            let tail = f.lines.split_off(pool.after + 1);
            f.lines.extend(built);
            f.lines.extend(tail);
        }
    }

    fn peephole(&self, w: PeepWindow) {
        let PeepWindow {
            ln,
            next,
            next2,
            counts,
        } = w;

        let lb11 = self.core.encoder("$lb11");
        let lb = self.core.encoder("$lb");

        // The +-8 slack absorbs size drift from .balign directives that
        // literal-pool placement inserts between passes.
        let fits = |enc: &Encoder, l: &Line| {
            enc.encode(l.num_args[0] + 8).is_some()
                && enc.encode(l.num_args[0] - 8).is_some()
                && enc.encode(l.num_args[0]).is_some()
        };

        let lnop = ln.op().to_string();
        let nextop = next.op().to_string();

        let mut is_skip_branch = false;
        if lnop == "bne" || lnop == "beq" {
            if nextop == "b" && ln.num_args[0] == 0 {
                is_skip_branch = true;
            }
            if nextop == "bb" && ln.num_args[0] == 2 {
                is_skip_branch = true;
            }
        }

        let bl_variant = if lnop == "bl" {
            push_r0_variant(&ln.words[1])
        } else {
            None
        };

        if lnop == "bb" && fits(lb11, ln) {
            // bb .somewhere -> b .somewhere (when it reaches)
            let t = format!("b {}", ln.words[1]);
            ln.update(&t, counts);
        } else if lnop == "b" && ln.num_args[0] == -2 {
            // branch to the very next instruction
            ln.update("", counts);
        } else if lnop == "bne" && is_skip_branch && fits(lb, next) {
            // bne .next; b .somewhere; .next: -> beq .somewhere
            let t = format!("beq {}", next.words[1]);
            ln.update(&t, counts);
            next.update("", counts);
        } else if lnop == "beq" && is_skip_branch && fits(lb, next) {
            // beq .next; b .somewhere; .next: -> bne .somewhere
            let t = format!("bne {}", next.words[1]);
            ln.update(&t, counts);
            next.update("", counts);
        } else if lnop == "push"
            && ln.num_args[0] == 0x4000
            && nextop == "push"
            && next.num_args[0] & 0x4000 == 0
        {
            // push {lr}; push {X, ...} -> push {lr, X, ...}
            let t = next.text.replacen('{', "{lr, ", 1);
            ln.update(&t, counts);
            next.update("", counts);
        } else if lnop == "pop" && nextop == "pop" && next.num_args[0] == 0x8000 {
            // pop {X, ...}; pop {pc} -> pop {X, ..., pc}
            let t = ln.text.replacen('}', ", pc}", 1);
            ln.update(&t, counts);
            next.update("", counts);
        } else if lnop == "push" && nextop == "pop" && ln.num_args[0] == next.num_args[0] {
            // push {X}; pop {X} -> nothing
            debug_assert!(ln.num_args[0] > 0);
            ln.update("", counts);
            next.update("", counts);
        } else if lnop == "push" && nextop == "pop" && ln.words.len() == 4 && next.words.len() == 4
        {
            // push {rX}; pop {rY} -> mov rY, rX
            debug_assert_eq!(ln.words[1], "{");
            let t = format!("mov {}, {}", next.words[2], ln.words[2]);
            ln.update(&t, counts);
            next.update("", counts);
        } else if ln.op_ext() == "movs $r5, $i0"
            && next.op_ext() == "mov $r2, $r3"
            && next.num_args[0] <= 7
            && ln.num_args[0] == next.num_args[1]
            && next2
                .as_deref()
                .map_or(false, |l| clobbers_reg(l, ln.num_args[0]))
        {
            // movs rX, #V; mov rY, rX; clobber rX -> movs rY, #V
            let t = format!("movs r{}, #{}", next.num_args[0], ln.num_args[1]);
            ln.update(&t, counts);
            next.update("", counts);
        } else if lnop == "pop"
            && single_reg(ln) >= 0
            && nextop == "push"
            && single_reg(ln) == single_reg(next)
        {
            // pop {rX}; push {rX} -> ldr rX, [sp, #0]
            let t = format!("ldr r{}, [sp, #0]", single_reg(ln));
            ln.update(&t, counts);
            next.update("", counts);
        } else if lnop == "push"
            && next.op_ext() == "ldr $r5, [sp, $i1]"
            && single_reg(ln) == next.num_args[0]
            && next.num_args[1] == 0
        {
            // push {rX}; ldr rX, [sp, #0] -> push {rX}
            next.update("", counts);
        } else if bl_variant.is_some() && nextop == "push" && single_reg(next) == 0 {
            // bl helper; push {r0} -> bl helper_pushR0
            if let Some(variant) = bl_variant {
                let t = format!("bl {variant}");
                ln.update(&t, counts);
                next.update("@dummystack 1", counts);
            }
        } else if lnop == "ldr"
            && ln.op_ext() == "ldr $r5, [sp, $i1]"
            && nextop == "bl"
            && takes_sp_offset_suffix(&next.words[1])
            && ln.num_args[0] == 0
            && ln.num_args[1] <= 32
            && next2.as_deref().map_or(false, |l| l.op() != "push")
        {
            // ldr r0, [sp, #off]; bl helper -> bl helper_<off>
            let t = format!("bl {}_{}", next.words[1], ln.num_args[1]);
            ln.update(&t, counts);
            next.update("", counts);
        } else if lnop == "push"
            && single_reg(ln) >= 0
            && preserves_reg(next, single_reg(ln))
            && next2
                .as_deref()
                .map_or(false, |l| l.op() == "pop" && single_reg(l) == single_reg(ln))
        {
            // push {rX}; <preserves rX>; pop {rX} -> <preserves rX>
            ln.update("", counts);
            if let Some(n2) = next2 {
                n2.update("", counts);
            }
        }
    }
}

// True when the instruction writes neither r<n> nor memory.
fn preserves_reg(ln: &Line, n: i64) -> bool {
    ln.op_ext() == "movs $r5, $i0" && ln.num_args[0] != n
}

fn clobbers_reg(ln: &Line, n: i64) -> bool {
    ln.op() == "pop" && ln.num_args[0] & (1 << n) != 0
}

/// Index of the only register in a push/pop list, -1 when the list is
/// empty or holds more than one.
fn single_reg(ln: &Line) -> i64 {
    debug_assert!(ln.op() == "push" || ln.op() == "pop");
    let mut v = ln.num_args[0];
    let mut k = 0;
    let mut ret = -1;
    while v > 0 {
        if v & 1 != 0 {
            ret = if ret == -1 { k } else { -2 };
        }
        v >>= 1;
        k += 1;
    }
    if ret >= 0 {
        ret
    } else {
        -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::testing::{expect, expect_error};

    #[test]
    fn rejects_malformed_lines() {
        let ei = ThumbProcessor::default();
        expect_error(&ei, "lsl r0, r0, #8");
        expect_error(&ei, "push {pc,lr}");
        expect_error(&ei, "push {r17}");
        expect_error(&ei, "mov r0, r1 foo");
        expect_error(&ei, "movs r14, #100");
        expect_error(&ei, "push {r0");
        expect_error(&ei, "push lr,r0}");
        expect_error(&ei, "pop {lr,r0}");
        expect_error(&ei, "b #+11");
        expect_error(&ei, "b #+102400");
        expect_error(&ei, "bne undefined_label");
        expect_error(&ei, ".foobar");
    }

    #[test]
    fn assembles_basic_block_with_literals() {
        let ei = ThumbProcessor::default();
        expect(
            &ei,
            "0200      lsls    r0, r0, #8\n\
             b500      push    {lr}\n\
             2064      movs    r0, #100        ; 0x64\n\
             b401      push    {r0}\n\
             bc08      pop     {r3}\n\
             b501      push    {r0, lr}\n\
             bd20      pop {r5, pc}\n\
             bc01      pop {r0}\n\
             4770      bx      lr\n\
             0000      .balign 4\n\
             e6c0      .word   -72000\n\
             fffe\n",
        );
    }

    #[test]
    fn resolves_short_branches() {
        let ei = ThumbProcessor::default();
        expect(
            &ei,
            "4291      cmp     r1, r2\n\
             d100      bne     l6\n\
             e000      b       l8\n\
             1840  l6: adds    r0, r0, r1\n\
             4718  l8: bx      r3\n",
        );
    }

    #[test]
    fn resolves_stack_marks() {
        let ei = ThumbProcessor::default();
        expect(
            &ei,
            "          @stackmark base\n\
             b403      push    {r0, r1}\n\
                       @stackmark locals\n\
             9801      ldr     r0, [sp, locals@1]\n\
             b401      push    {r0}\n\
             9802      ldr     r0, [sp, locals@1]\n\
             bc01      pop     {r0}\n\
                       @stackempty locals\n\
             9901      ldr     r1, [sp, locals@1]\n\
             9102      str     r1, [sp, base@0]\n\
                       @stackempty locals\n\
             b002      add     sp, #8\n\
                       @stackempty base\n",
        );
    }

    #[test]
    fn evaluates_operand_products() {
        let ei = ThumbProcessor::default();
        expect(
            &ei,
            "b090      sub sp, #4*16\n\
             b010      add sp, #4*16\n",
        );
    }

    #[test]
    fn emits_nul_terminated_strings() {
        let ei = ThumbProcessor::default();
        expect(
            &ei,
            "6261      .string \"abc\"\n\
             0063      \n",
        );
        expect(
            &ei,
            "6261      .string \"abcde\"\n\
             6463      \n\
             0065      \n",
        );
    }

    #[test]
    fn encodes_representative_instructions() {
        let ei = ThumbProcessor::default();
        expect(
            &ei,
            "3042      adds r0, 0x42\n\
             1c0d      adds r5, r1, #0\n\
             d100      bne #0\n\
             2800      cmp r0, #0\n\
             6b28      ldr r0, [r5, #48]\n\
             0200      lsls r0, r0, #8\n\
             2063      movs r0, 0x63\n\
             4240      negs r0, r0\n\
             46c0      nop\n\
             b500      push {lr}\n\
             b401      push {r0}\n\
             b402      push {r1}\n\
             b404      push {r2}\n\
             b408      push {r3}\n\
             b520      push {r5, lr}\n\
             bd00      pop {pc}\n\
             bc01      pop {r0}\n\
             bc02      pop {r1}\n\
             bc04      pop {r2}\n\
             bc08      pop {r3}\n\
             bd20      pop {r5, pc}\n\
             9003      str r0, [sp, #4*3]\n",
        );
    }

    #[test]
    fn encodes_wide_branches() {
        let ei = ThumbProcessor::default();
        expect(&ei, "f001f800  bl #0x1000\n");
        expect(&ei, "f7fffffe  bl #-4\n");
        // odd target means blx, rounded to a word boundary
        expect(&ei, "f001e800  bl #0x1001\n");
        expect_error(&ei, "bl #0x400000");
    }

    #[test]
    fn relaxes_reachable_wide_branches() {
        let ei = ThumbProcessor::default();
        let mut f = AsmFile::new(&ei);
        f.emit("bb lbl\nlbl: bx lr\n");
        assert!(f.errors.is_empty(), "{:?}", f.errors);
        // bb -> b, then the offset-zero b is dropped entirely
        assert_eq!(f.buf, vec![0x4770]);
    }

    #[test]
    fn drops_matched_push_pop_pairs() {
        let ei = ThumbProcessor::default();
        let mut f = AsmFile::new(&ei);
        f.emit("push {r0, r1}\npop {r0, r1}\nbx lr\n");
        assert!(f.errors.is_empty(), "{:?}", f.errors);
        assert_eq!(f.buf, vec![0x4770]);
    }

    #[test]
    fn merges_lr_pushes_and_pc_pops() {
        let ei = ThumbProcessor::default();
        let mut f = AsmFile::new(&ei);
        f.emit("push {lr}\npush {r0}\nnop\npop {r0}\npop {pc}\n");
        assert!(f.errors.is_empty(), "{:?}", f.errors);
        assert_eq!(f.buf, vec![0xb501, 0x46c0, 0xbd01]);
    }

    #[test]
    fn ldlit_pools_after_existing_branch() {
        let ei = ThumbProcessor::default();
        let mut f = AsmFile::new(&ei);
        f.disable_peephole = true;
        f.emit("ldlit r0, 0x12345678\nbx lr\nb done\ndone:\n");
        assert!(f.errors.is_empty(), "{:?}", f.errors);
        assert_eq!(
            f.buf,
            vec![0x4801, 0x4770, 0xe002, 0x0000, 0x5678, 0x1234]
        );
    }

    #[test]
    fn ldlit_inserts_jump_over_pool_when_needed() {
        let ei = ThumbProcessor::default();
        let mut f = AsmFile::new(&ei);
        f.disable_peephole = true;
        f.emit("ldlit r0, 0x11\nnop\n");
        assert!(f.errors.is_empty(), "{:?}", f.errors);
        assert_eq!(
            f.buf,
            vec![0x4801, 0x46c0, 0xf000, 0xf802, 0x0011, 0x0000]
        );
    }

    #[test]
    fn ldlit_dedups_equal_values() {
        let ei = ThumbProcessor::default();
        let mut f = AsmFile::new(&ei);
        f.disable_peephole = true;
        f.emit("ldlit r0, 0x11\nldlit r1, 0x11\nnop\n");
        assert!(f.errors.is_empty(), "{:?}", f.errors);
        // one pooled word serves both loads
        assert_eq!(
            f.buf,
            vec![0x4802, 0x4902, 0x46c0, 0xf000, 0xf803, 0x0000, 0x0011, 0x0000]
        );
    }

    #[test]
    fn function_pointers_get_thumb_bit() {
        let arm = ThumbProcessor::new(true);
        let thumb = ThumbProcessor::new(false);
        assert_eq!(thumb.to_fn_ptr(0x100, 0x4000, "fn1"), 0x4101);
        assert_eq!(arm.to_fn_ptr(0x100, 0x4000, "fn1"), 0x4101);
        assert_eq!(arm.to_fn_ptr(0x100, 0x4000, "ns::helper"), 0x4100);
    }
}

// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Thumb rendering of the lowering snippets.

use crate::ir::TargetConfig;

use super::snippets::{AssemblerSnippets, BitSizeInfo};

pub struct ThumbSnippets {
    target: TargetConfig,
}

impl ThumbSnippets {
    pub fn new(target: TargetConfig) -> Self {
        Self { target }
    }
}

fn num_bytes(n: i64) -> u32 {
    let mut v = 0;
    let mut q = n;
    while q > 0 {
        v += 1;
        q >>= 8;
    }
    v.max(1)
}

impl AssemblerSnippets for ThumbSnippets {
    fn stack_aligned(&self) -> bool {
        self.target.stack_align > 1
    }

    fn push_lr(&self) -> String {
        if self.stack_aligned() {
            "push {lr, r3}  ; r3 for align".to_string()
        } else {
            "push {lr}".to_string()
        }
    }

    fn pop_pc(&self) -> String {
        if self.stack_aligned() {
            "pop {pc, r3}  ; r3 for align".to_string()
        } else {
            "pop {pc}".to_string()
        }
    }

    fn nop(&self) -> String {
        "nop".to_string()
    }

    fn reg_gets_imm(&self, reg: &str, imm: i64) -> String {
        format!("movs {reg}, #{imm}")
    }

    fn proc_setup(&self, numlocals: i64) -> String {
        let mut r = String::new();
        if numlocals > 0 {
            r.push_str("movs r0, #0\n");
            for _ in 0..numlocals {
                r.push_str("push {r0} ; loc\n");
            }
        }
        r
    }

    fn push_fixed(&self, regs: &[&str]) -> String {
        format!("push {{{}}}", regs.join(", "))
    }

    fn push_local(&self, reg: &str) -> String {
        format!("push {{{reg}}}")
    }

    fn pop_fixed(&self, regs: &[&str]) -> String {
        format!("pop {{{}}}", regs.join(", "))
    }

    fn pop_locals(&self, n: i64) -> String {
        format!("add sp, #4*{n} ; pop locals {n}")
    }

    fn proc_return(&self) -> String {
        "pop {pc}".to_string()
    }

    fn debugger_stmt(&self, lbl: &str) -> String {
        format!(
            "\n@stackempty locals\nldr r0, [r6, #0] ; debugger\nsubs r0, r0, #4  ; debugger\n{lbl}:\nldr r0, [r0, #0] ; debugger\n"
        )
    }

    fn debugger_bkpt(&self, lbl: &str) -> String {
        format!("\n@stackempty locals\nldr r0, [r6, #0] ; brk\n{lbl}:\nldr r0, [r0, #0] ; brk\n")
    }

    fn debugger_proc(&self, lbl: &str) -> String {
        format!("\nldr r0, [r6, #0]  ; brk-entry\nldr r0, [r0, #4]  ; brk-entry\n{lbl}:")
    }

    fn unconditional_branch(&self, lbl: &str) -> String {
        format!("bb {lbl}")
    }

    fn beq(&self, lbl: &str) -> String {
        format!("beq {lbl}")
    }

    fn bne(&self, lbl: &str) -> String {
        format!("bne {lbl}")
    }

    fn cmp(&self, reg1: &str, reg2: &str) -> String {
        format!("cmp {reg1}, {reg2}")
    }

    fn cmp_zero(&self, reg: &str) -> String {
        format!("cmp {reg}, #0")
    }

    fn load_reg_src_off(
        &self,
        reg: &str,
        src: &str,
        off: &str,
        word: bool,
        store: bool,
        inf: Option<&BitSizeInfo>,
    ) -> String {
        let off = if word {
            format!("#4*{off}")
        } else {
            off.to_string()
        };
        let mut st = "str";
        let mut ld = "ldr";
        if let Some(inf) = inf {
            if inf.imm_limit == 32 {
                st = "strb";
            } else if inf.imm_limit == 64 {
                st = "strh";
            }
            ld = if inf.needs_sign_ext {
                match st {
                    "strb" => "ldrsb",
                    "strh" => "ldrsh",
                    _ => "ldr",
                }
            } else {
                match st {
                    "strb" => "ldrb",
                    "strh" => "ldrh",
                    _ => "ldr",
                }
            };
        }
        if store {
            format!("{st} {reg}, [{src}, {off}]")
        } else {
            format!("{ld} {reg}, [{src}, {off}]")
        }
    }

    fn rt_call(&self, name: &str, r0: &str, r1: &str) -> String {
        format!("{name} {r0}, {r1}")
    }

    // Alignment padding is kept balanced by push_lr/pop_pc, so the align
    // hint needs no extra code on Thumb.
    fn call_lbl(&self, lbl: &str, _save_stack: bool, _align: i64) -> String {
        format!("bl {lbl}")
    }

    fn call_reg(&self, reg: &str) -> String {
        format!("blx {reg}")
    }

    fn helper_prologue(&self) -> String {
        self.push_lr()
    }

    fn helper_epilogue(&self) -> String {
        self.pop_pc()
    }

    fn load_ptr_full(&self, lbl: &str, reg: &str) -> String {
        format!("ldlit {reg}, {lbl}")
    }

    fn emit_int(&self, v: i64, reg: &str) -> String {
        let mut n = v;
        let is_neg = n < 0;
        if is_neg {
            n = -n;
        }

        // shift out low-order zeros when that shrinks the byte count
        let mut num_shift = 0;
        if n > 0xff {
            let mut shifted = n;
            while shifted & 1 == 0 {
                shifted >>= 1;
                num_shift += 1;
            }
            if num_bytes(shifted) < num_bytes(n) {
                n = shifted;
            } else {
                num_shift = 0;
            }
        }

        let mut result = String::new();
        let mut mov_written = false;
        let mut write_mov = |result: &mut String, mov_written: &mut bool, v: i64| {
            debug_assert!((0..=255).contains(&v));
            if *mov_written {
                if v != 0 {
                    result.push_str(&format!("adds {reg}, #{v}\n"));
                }
            } else {
                result.push_str(&format!("movs {reg}, #{v}\n"));
            }
            *mov_written = true;
        };
        let shift = |result: &mut String, v: u32| {
            result.push_str(&format!("lsls {reg}, {reg}, #{v}\n"));
        };

        let nb = num_bytes(n);
        for b in (0..nb).rev() {
            write_mov(&mut result, &mut mov_written, (n >> (8 * b)) & 0xff);
            if b > 0 {
                shift(&mut result, 8);
            }
        }

        if num_shift > 0 {
            shift(&mut result, num_shift);
        }

        if is_neg {
            result.push_str(&format!("negs {reg}, {reg}\n"));
        }

        // more than 3 instructions? take a literal-pool load instead
        if result.trim_end().lines().count() > 3 {
            return format!("ldlit {reg}, {v}\n");
        }

        result
    }

    fn mov(&self, dst: &str, src: &str) -> String {
        format!("mov {dst}, {src}")
    }

    fn vcall(&self, map_method: &str, is_set: bool) -> String {
        let this_off = if is_set { 4 } else { 0 };
        let objlit_val = if is_set { "ldr r2, [sp, #0]\n" } else { "" };
        format!(
            "\nldr r0, [sp, #{this_off}] ; ld-this\n\
             ldr r3, [r0, #0] ; ld-vtable\n\
             ldr r3, [r3, #4] ; iface table\n\
             cmp r3, #43 ; 43 marks a map rather than a record\n\
             beq .objlit\n\
             .nonlit:\n\
             lsls r1, r1, #2\n\
             ldr r0, [r3, r1] ; ld-method\n\
             bx r0\n\
             .objlit:\n\
             {objlit_val}{push_lr}\n\
             bl {map_method}\n\
             {pop_pc}\n",
            push_lr = self.push_lr(),
            pop_pc = self.pop_pc(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t() -> ThumbSnippets {
        ThumbSnippets::new(TargetConfig::default())
    }

    #[test]
    fn emit_int_small_values_are_single_movs() {
        assert_eq!(t().emit_int(0, "r0"), "movs r0, #0\n");
        assert_eq!(t().emit_int(255, "r1"), "movs r1, #255\n");
    }

    #[test]
    fn emit_int_two_byte_values_shift_and_add() {
        assert_eq!(
            t().emit_int(0x1234, "r0"),
            "movs r0, #18\nlsls r0, r0, #8\nadds r0, #52\n"
        );
    }

    #[test]
    fn emit_int_uses_trailing_zero_shift() {
        // 0x30000 = 3 << 16
        assert_eq!(
            t().emit_int(0x30000, "r2"),
            "movs r2, #3\nlsls r2, r2, #16\n"
        );
    }

    #[test]
    fn emit_int_negates_small_values() {
        assert_eq!(t().emit_int(-5, "r0"), "movs r0, #5\nnegs r0, r0\n");
    }

    #[test]
    fn emit_int_falls_back_to_literal_pool() {
        assert_eq!(t().emit_int(0x12345678, "r0"), "ldlit r0, 305419896\n");
        assert_eq!(t().emit_int(-0x12345, "r3"), "ldlit r3, -74565\n");
    }

    #[test]
    fn sized_loads_pick_narrow_mnemonics() {
        let byte = BitSizeInfo {
            size: 1,
            needs_sign_ext: true,
            imm_limit: 32,
        };
        assert_eq!(
            t().load_reg_src_off("r0", "r7", "r1", false, false, Some(&byte)),
            "ldrsb r0, [r7, r1]"
        );
        assert_eq!(
            t().load_reg_src_off("r0", "r7", "#2", false, true, Some(&byte)),
            "strb r0, [r7, #2]"
        );
        let half = BitSizeInfo {
            size: 2,
            needs_sign_ext: false,
            imm_limit: 64,
        };
        assert_eq!(
            t().load_reg_src_off("r0", "r7", "#2", false, false, Some(&half)),
            "ldrh r0, [r7, #2]"
        );
    }

    #[test]
    fn word_offsets_are_scaled() {
        assert_eq!(
            t().load_reg_src_off("r1", "sp", "3", true, false, None),
            "ldr r1, [sp, #4*3]"
        );
    }

    #[test]
    fn aligned_target_pairs_lr_with_r3() {
        let t = ThumbSnippets::new(TargetConfig {
            stack_align: 2,
            ..TargetConfig::default()
        });
        assert!(t.push_lr().starts_with("push {lr, r3}"));
        assert!(t.pop_pc().starts_with("pop {pc, r3}"));
    }
}

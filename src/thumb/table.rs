// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! ARMv6-M Thumb instruction table.
//!
//! Encodings follow the ARMv6-M Architecture Reference Manual (DDI 0419)
//! and the Thumb 16-bit quick reference card. Field encoders are named
//! after the bit groups they populate:
//!
//!   $r0 - bits 2:1:0          $i0 - bits 7-0
//!   $r1 - bits 5:4:3          $i1 - bits 7-0 * 4
//!   $r2 - bits 7:2:1:0        $i2 - bits 6-0 * 4
//!   $r3 - bits 6:5:4:3        $i3 - bits 8-6
//!   $r4 - bits 8:7:6          $i4 - bits 10-6
//!   $r5 - bits 10:9:8         $i5 - bits 10-6 * 4
//!                             $i6 - bits 10-6, 0 means 32
//!                             $i7 - bits 10-6 * 2

use crate::asm::encoder::{inrange, inrange_signed, EncodeFn, ProcessorCore};

fn enc_r0(v: i64) -> Option<u32> {
    inrange(7, v, v)
}

fn enc_r1(v: i64) -> Option<u32> {
    inrange(7, v, v << 3)
}

fn enc_r2(v: i64) -> Option<u32> {
    inrange(15, v, (v & 7) | ((v & 8) << 4))
}

fn enc_r3(v: i64) -> Option<u32> {
    inrange(15, v, v << 3)
}

fn enc_r4(v: i64) -> Option<u32> {
    inrange(7, v, v << 6)
}

fn enc_r5(v: i64) -> Option<u32> {
    inrange(7, v, v << 8)
}

// sets both the $r0 and $r1 fields (two-argument adds and subs)
fn enc_r01(v: i64) -> Option<u32> {
    inrange(7, v, v | v << 3)
}

fn enc_i0(v: i64) -> Option<u32> {
    inrange(255, v, v)
}

fn enc_i1(v: i64) -> Option<u32> {
    if v & 3 != 0 {
        return None;
    }
    inrange(255, v >> 2, v >> 2)
}

fn enc_i2(v: i64) -> Option<u32> {
    if v & 3 != 0 {
        return None;
    }
    inrange(127, v >> 2, v >> 2)
}

fn enc_i3(v: i64) -> Option<u32> {
    inrange(7, v, v << 6)
}

fn enc_i4(v: i64) -> Option<u32> {
    inrange(31, v, v << 6)
}

fn enc_i5(v: i64) -> Option<u32> {
    if v & 3 != 0 {
        return None;
    }
    inrange(31, v >> 2, (v >> 2) << 6)
}

fn enc_i6(v: i64) -> Option<u32> {
    match v {
        0 => None,
        32 => Some(0),
        _ => inrange(31, v, v << 6),
    }
}

fn enc_i7(v: i64) -> Option<u32> {
    if v & 1 != 0 {
        return None;
    }
    inrange(31, v >> 1, (v >> 1) << 6)
}

// literal-pool placeholder, rewritten before final emit
fn enc_i32(_v: i64) -> Option<u32> {
    Some(1)
}

fn enc_rl0(v: i64) -> Option<u32> {
    inrange(255, v, v)
}

fn enc_rl1(v: i64) -> Option<u32> {
    if v & 0x4000 != 0 {
        inrange(255, v & !0x4000, 0x100 | (v & 0xff))
    } else {
        inrange(255, v, v)
    }
}

fn enc_rl2(v: i64) -> Option<u32> {
    if v & 0x8000 != 0 {
        inrange(255, v & !0x8000, 0x100 | (v & 0xff))
    } else {
        inrange(255, v, v)
    }
}

fn enc_la(v: i64) -> Option<u32> {
    if v & 3 != 0 {
        return None;
    }
    inrange(255, v >> 2, v >> 2)
}

fn enc_lb(v: i64) -> Option<u32> {
    if v & 1 != 0 {
        return None;
    }
    inrange_signed(127, v >> 1, v >> 1)
}

fn enc_lb11(v: i64) -> Option<u32> {
    if v & 1 != 0 {
        return None;
    }
    inrange_signed(1023, v >> 1, v >> 1)
}

// (name, syntax hint, encoder, word-aligned pc base)
const ENCODERS: &[(&str, &str, EncodeFn, bool)] = &[
    ("$r0", "R0-7", enc_r0, false),
    ("$r1", "R0-7", enc_r1, false),
    ("$r2", "R0-15", enc_r2, false),
    ("$r3", "R0-15", enc_r3, false),
    ("$r4", "R0-7", enc_r4, false),
    ("$r5", "R0-7", enc_r5, false),
    ("$r01", "R0-7", enc_r01, false),
    ("$i0", "#0-255", enc_i0, false),
    ("$i1", "#0-1020", enc_i1, false),
    ("$i2", "#0-510", enc_i2, false),
    ("$i3", "#0-7", enc_i3, false),
    ("$i4", "#0-31", enc_i4, false),
    ("$i5", "#0-124", enc_i5, false),
    ("$i6", "#1-32", enc_i6, false),
    ("$i7", "#0-62", enc_i7, false),
    ("$i32", "#0-2^32", enc_i32, false),
    ("$rl0", "{R0-7,...}", enc_rl0, false),
    ("$rl1", "{LR,R0-7,...}", enc_rl1, false),
    ("$rl2", "{PC,R0-7,...}", enc_rl2, false),
    ("$la", "LABEL", enc_la, true),
    ("$lb", "LABEL", enc_lb, false),
    ("$lb11", "LABEL", enc_lb11, false),
];

#[derive(Clone, Copy)]
enum Variant {
    Narrow,
    // eligible for cross-procedure sharing
    Shared,
    // 32-bit encoding, handled by emit32
    Wide,
}

use Variant::{Narrow, Shared, Wide};

/// Instruction patterns in resolution order: the first pattern under a
/// mnemonic whose encoders all accept wins.
const INSTRUCTIONS: &[(&str, u16, u16, Variant)] = &[
    ("adcs  $r0, $r1", 0x4140, 0xffc0, Narrow),
    ("add   $r2, $r3", 0x4400, 0xff00, Narrow),
    ("add   $r5, pc, $i1", 0xa000, 0xf800, Narrow),
    ("add   $r5, sp, $i1", 0xa800, 0xf800, Narrow),
    ("add   sp, $i2", 0xb000, 0xff80, Shared),
    ("adds  $r0, $r1, $i3", 0x1c00, 0xfe00, Narrow),
    ("adds  $r0, $r1, $r4", 0x1800, 0xfe00, Narrow),
    ("adds  $r01, $r4", 0x1800, 0xfe00, Narrow),
    ("adds  $r5, $i0", 0x3000, 0xf800, Narrow),
    ("adr   $r5, $la", 0xa000, 0xf800, Narrow),
    ("ands  $r0, $r1", 0x4000, 0xffc0, Narrow),
    ("asrs  $r0, $r1", 0x4100, 0xffc0, Narrow),
    ("asrs  $r0, $r1, $i6", 0x1000, 0xf800, Narrow),
    ("bics  $r0, $r1", 0x4380, 0xffc0, Narrow),
    ("bkpt  $i0", 0xbe00, 0xff00, Narrow),
    ("blx   $r3", 0x4780, 0xff87, Narrow),
    ("bx    $r3", 0x4700, 0xff80, Narrow),
    ("cmn   $r0, $r1", 0x42c0, 0xffc0, Narrow),
    ("cmp   $r0, $r1", 0x4280, 0xffc0, Narrow),
    ("cmp   $r2, $r3", 0x4500, 0xff00, Narrow),
    ("cmp   $r5, $i0", 0x2800, 0xf800, Narrow),
    ("eors  $r0, $r1", 0x4040, 0xffc0, Narrow),
    ("ldmia $r5!, $rl0", 0xc800, 0xf800, Narrow),
    ("ldmia $r5, $rl0", 0xc800, 0xf800, Narrow),
    // used for debugger breakpoints, must stay in place
    ("ldr   $r0, [$r1, $i5]", 0x6800, 0xf800, Narrow),
    ("ldr   $r0, [$r1, $r4]", 0x5800, 0xfe00, Narrow),
    ("ldr   $r5, [pc, $i1]", 0x4800, 0xf800, Narrow),
    ("ldr   $r5, $la", 0x4800, 0xf800, Narrow),
    ("ldr   $r5, [sp, $i1]", 0x9800, 0xf800, Shared),
    ("ldr   $r5, [sp]", 0x9800, 0xf800, Shared),
    ("ldrb  $r0, [$r1, $i4]", 0x7800, 0xf800, Narrow),
    ("ldrb  $r0, [$r1, $r4]", 0x5c00, 0xfe00, Narrow),
    ("ldrh  $r0, [$r1, $i7]", 0x8800, 0xf800, Narrow),
    ("ldrh  $r0, [$r1, $r4]", 0x5a00, 0xfe00, Narrow),
    ("ldrsb $r0, [$r1, $r4]", 0x5600, 0xfe00, Narrow),
    ("ldrsh $r0, [$r1, $r4]", 0x5e00, 0xfe00, Narrow),
    ("lsls  $r0, $r1", 0x4080, 0xffc0, Narrow),
    ("lsls  $r0, $r1, $i4", 0x0000, 0xf800, Narrow),
    ("lsrs  $r0, $r1", 0x40c0, 0xffc0, Narrow),
    ("lsrs  $r0, $r1, $i6", 0x0800, 0xf800, Narrow),
    ("mov   $r2, $r3", 0x4600, 0xff00, Narrow),
    ("movs  $r0, $r1", 0x0000, 0xffc0, Narrow),
    ("movs  $r5, $i0", 0x2000, 0xf800, Narrow),
    ("muls  $r0, $r1", 0x4340, 0xffc0, Narrow),
    ("mvns  $r0, $r1", 0x43c0, 0xffc0, Narrow),
    ("negs  $r0, $r1", 0x4240, 0xffc0, Narrow),
    // mov r8, r8 as gcc emits it
    ("nop", 0x46c0, 0xffff, Narrow),
    ("orrs  $r0, $r1", 0x4300, 0xffc0, Narrow),
    ("pop   $rl2", 0xbc00, 0xfe00, Narrow),
    ("push  $rl1", 0xb400, 0xfe00, Narrow),
    ("rev   $r0, $r1", 0xba00, 0xffc0, Narrow),
    ("rev16 $r0, $r1", 0xba40, 0xffc0, Narrow),
    ("revsh $r0, $r1", 0xbac0, 0xffc0, Narrow),
    ("rors  $r0, $r1", 0x41c0, 0xffc0, Narrow),
    ("sbcs  $r0, $r1", 0x4180, 0xffc0, Narrow),
    ("sev", 0xbf40, 0xffff, Narrow),
    ("stm   $r5!, $rl0", 0xc000, 0xf800, Narrow),
    // aliases for stm
    ("stmia $r5!, $rl0", 0xc000, 0xf800, Narrow),
    ("stmea $r5!, $rl0", 0xc000, 0xf800, Narrow),
    ("str   $r0, [$r1, $i5]", 0x6000, 0xf800, Shared),
    ("str   $r0, [$r1]", 0x6000, 0xf800, Shared),
    ("str   $r0, [$r1, $r4]", 0x5000, 0xfe00, Narrow),
    ("str   $r5, [sp, $i1]", 0x9000, 0xf800, Shared),
    ("str   $r5, [sp]", 0x9000, 0xf800, Shared),
    ("strb  $r0, [$r1, $i4]", 0x7000, 0xf800, Narrow),
    ("strb  $r0, [$r1, $r4]", 0x5400, 0xfe00, Narrow),
    ("strh  $r0, [$r1, $i7]", 0x8000, 0xf800, Narrow),
    ("strh  $r0, [$r1, $r4]", 0x5200, 0xfe00, Narrow),
    ("sub   sp, $i2", 0xb080, 0xff80, Narrow),
    ("subs  $r0, $r1, $i3", 0x1e00, 0xfe00, Narrow),
    ("subs  $r0, $r1, $r4", 0x1a00, 0xfe00, Narrow),
    ("subs  $r01, $r4", 0x1a00, 0xfe00, Narrow),
    ("subs  $r5, $i0", 0x3800, 0xf800, Narrow),
    ("svc   $i0", 0xdf00, 0xff00, Narrow),
    ("sxtb  $r0, $r1", 0xb240, 0xffc0, Narrow),
    ("sxth  $r0, $r1", 0xb200, 0xffc0, Narrow),
    ("tst   $r0, $r1", 0x4200, 0xffc0, Narrow),
    ("udf   $i0", 0xde00, 0xff00, Narrow),
    ("uxtb  $r0, $r1", 0xb2c0, 0xffc0, Narrow),
    ("uxth  $r0, $r1", 0xb280, 0xffc0, Narrow),
    ("wfe", 0xbf20, 0xffff, Narrow),
    ("wfi", 0xbf30, 0xffff, Narrow),
    ("yield", 0xbf10, 0xffff, Narrow),
    ("cpsid i", 0xb672, 0xffff, Narrow),
    ("cpsie i", 0xb662, 0xffff, Narrow),
    ("beq   $lb", 0xd000, 0xff00, Narrow),
    ("bne   $lb", 0xd100, 0xff00, Narrow),
    ("bcs   $lb", 0xd200, 0xff00, Narrow),
    ("bcc   $lb", 0xd300, 0xff00, Narrow),
    ("bmi   $lb", 0xd400, 0xff00, Narrow),
    ("bpl   $lb", 0xd500, 0xff00, Narrow),
    ("bvs   $lb", 0xd600, 0xff00, Narrow),
    ("bvc   $lb", 0xd700, 0xff00, Narrow),
    ("bhi   $lb", 0xd800, 0xff00, Narrow),
    ("bls   $lb", 0xd900, 0xff00, Narrow),
    ("bge   $lb", 0xda00, 0xff00, Narrow),
    ("blt   $lb", 0xdb00, 0xff00, Narrow),
    ("bgt   $lb", 0xdc00, 0xff00, Narrow),
    ("ble   $lb", 0xdd00, 0xff00, Narrow),
    // cs / cc
    ("bhs   $lb", 0xd200, 0xff00, Narrow),
    ("blo   $lb", 0xd300, 0xff00, Narrow),
    ("b     $lb11", 0xe000, 0xf800, Narrow),
    ("bal   $lb11", 0xe000, 0xf800, Narrow),
    // 32-bit; bb starts as b and widens to bl-style encoding when needed
    ("bl    $lb", 0xf000, 0xf800, Wide),
    ("bb    $lb", 0xe000, 0xf800, Wide),
    // emitted as a pc-relative ldr once the literal pool is placed
    ("ldlit $r5, $i32", 0x4800, 0xf800, Narrow),
];

pub(super) fn build_core() -> ProcessorCore {
    let mut core = ProcessorCore::new();
    for &(name, pretty, encode, word_aligned) in ENCODERS {
        core.add_enc_aligned(name, pretty, encode, word_aligned);
    }
    for &(syntax, opcode, mask, variant) in INSTRUCTIONS {
        match variant {
            Narrow => core.add_inst(syntax, opcode as u32, mask as u32),
            Shared => core.add_inst_shared(syntax, opcode as u32, mask as u32),
            Wide => core.add_inst32(syntax, opcode as u32, mask as u32),
        }
    }
    core
}

pub(super) fn register_no(name: &str) -> Option<i64> {
    let lower = name.to_ascii_lowercase();
    Some(match lower.as_str() {
        "r0" => 0,
        "r1" => 1,
        "r2" => 2,
        "r3" => 3,
        "r4" => 4,
        "r5" => 5,
        "r6" => 6,
        "r7" => 7,
        "r8" => 8,
        "r9" => 9,
        "r10" => 10,
        "r11" => 11,
        "r12" => 12,
        "sp" | "r13" => 13,
        "lr" | "r14" => 14,
        "pc" | "r15" => 15,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_encoders_reject_misaligned_values() {
        assert_eq!(enc_i1(4), Some(1));
        assert_eq!(enc_i1(2), None);
        assert_eq!(enc_i1(-4), None);
        assert_eq!(enc_i5(48), Some(12 << 6));
        assert_eq!(enc_i5(49), None);
        assert_eq!(enc_i7(62), Some(31 << 6));
        assert_eq!(enc_i7(63), None);
    }

    #[test]
    fn shift_count_32_encodes_as_zero() {
        assert_eq!(enc_i6(0), None);
        assert_eq!(enc_i6(32), Some(0));
        assert_eq!(enc_i6(5), Some(5 << 6));
    }

    #[test]
    fn register_lists_fold_lr_and_pc() {
        assert_eq!(enc_rl1(0x4000 | 0x01), Some(0x101));
        assert_eq!(enc_rl1(0x03), Some(0x03));
        assert_eq!(enc_rl2(0x8000 | 0x20), Some(0x120));
        // pc in a push list is invalid
        assert_eq!(enc_rl1(0x8000), None);
    }

    #[test]
    fn branch_offsets_are_halfword_signed() {
        assert_eq!(enc_lb(0), Some(0));
        assert_eq!(enc_lb(-2), Some(0xff));
        assert_eq!(enc_lb(254), Some(127));
        assert_eq!(enc_lb(256), None);
        assert_eq!(enc_lb(3), None);
        assert_eq!(enc_lb11(-2046), Some(0x400 | 0x1));
        assert_eq!(enc_lb11(2048), None);
    }

    #[test]
    fn register_names_cover_aliases() {
        assert_eq!(register_no("r7"), Some(7));
        assert_eq!(register_no("SP"), Some(13));
        assert_eq!(register_no("lr"), Some(14));
        assert_eq!(register_no("r15"), Some(15));
        assert_eq!(register_no("r17"), None);
        assert_eq!(register_no("foo"), None);
    }
}

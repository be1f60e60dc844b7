// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Operand encoders and instruction patterns.
//!
//! An [`Instruction`] is an instruction class with meta-variables (`$r0`,
//! `$i5`, `$lb`, ...) that are substituted from an actual line of assembly.
//! Several instructions may share one mnemonic; the first pattern whose
//! operand encoders all succeed wins. Encoders return `None` on range
//! violations so the driver can distinguish "bad operand" from "this
//! variant doesn't apply".

use std::collections::HashMap;

/// Maps an operand value to its encoded bit pattern, `None` when the
/// value is out of range or mis-aligned for the field.
pub type EncodeFn = fn(i64) -> Option<u32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    Register,
    Immediate,
    RegList,
    Label,
}

/// A named operand-field descriptor.
pub struct Encoder {
    pub name: &'static str,
    pub pretty: &'static str,
    pub encode: EncodeFn,
    pub kind: EncoderKind,
    pub is_word_aligned: bool,
}

impl Encoder {
    pub fn encode(&self, v: i64) -> Option<u32> {
        (self.encode)(v)
    }
}

/// Range check for unsigned fields; `e` is the pre-positioned bit pattern.
pub fn inrange(max: i64, v: i64, e: i64) -> Option<u32> {
    if v < 0 || v > max {
        return None;
    }
    Some(e as u32)
}

/// Range check for signed fields; masks `e` to the field width.
pub fn inrange_signed(max: i64, v: i64, e: i64) -> Option<u32> {
    if v < -(max + 1) || v > max {
        return None;
    }
    let mask = (max << 1) | 1;
    Some((e & mask) as u32)
}

/// One registered instruction pattern.
pub struct Instruction {
    pub name: String,
    /// Operand tokens of the syntax template, mnemonic excluded.
    pub args: Vec<String>,
    /// Template with encoder names replaced by their human-readable hints.
    pub friendly: String,
    /// Whitespace-normalized syntax template, used as pattern identity.
    pub code: String,
    pub opcode: u32,
    pub mask: u32,
    pub is32bit: bool,
    pub can_be_shared: bool,
}

/// Result of encoding one line against one instruction pattern.
pub enum EmitResult {
    Emitted {
        stack: i32,
        opcode: u32,
        opcode2: Option<u32>,
        num_args: Vec<i64>,
        label_name: Option<String>,
    },
    Error {
        message: String,
        error_at: String,
    },
}

pub fn emit_err(message: &str, tok: &str) -> EmitResult {
    EmitResult::Error {
        message: message.to_string(),
        error_at: tok.to_string(),
    }
}

/// Encoder and instruction registries shared by every processor.
#[derive(Default)]
pub struct ProcessorCore {
    pub encoders: HashMap<&'static str, Encoder>,
    pub instructions: HashMap<String, Vec<Instruction>>,
}

impl ProcessorCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_enc(&mut self, name: &'static str, pretty: &'static str, encode: EncodeFn) {
        self.add_enc_aligned(name, pretty, encode, false)
    }

    pub fn add_enc_aligned(
        &mut self,
        name: &'static str,
        pretty: &'static str,
        encode: EncodeFn,
        is_word_aligned: bool,
    ) {
        let kind = if name.starts_with("$rl") {
            EncoderKind::RegList
        } else if name.starts_with("$r") {
            EncoderKind::Register
        } else if name.starts_with("$i") {
            EncoderKind::Immediate
        } else {
            EncoderKind::Label
        };
        self.encoders.insert(
            name,
            Encoder {
                name,
                pretty,
                encode,
                kind,
                is_word_aligned,
            },
        );
    }

    pub fn add_inst(&mut self, format: &str, opcode: u32, mask: u32) {
        self.add_inst_full(format, opcode, mask, false, false)
    }

    pub fn add_inst_shared(&mut self, format: &str, opcode: u32, mask: u32) {
        self.add_inst_full(format, opcode, mask, false, true)
    }

    pub fn add_inst32(&mut self, format: &str, opcode: u32, mask: u32) {
        self.add_inst_full(format, opcode, mask, true, false)
    }

    fn add_inst_full(
        &mut self,
        format: &str,
        opcode: u32,
        mask: u32,
        is32bit: bool,
        can_be_shared: bool,
    ) {
        debug_assert_eq!(opcode & mask, opcode, "opcode bits outside mask: {format}");

        let code = format.split_whitespace().collect::<Vec<_>>().join(" ");
        let friendly = self.friendly_fmt(&code);

        let words = super::line::tokenize(format).unwrap_or_default();
        let name = words[0].clone();
        let args = words[1..].to_vec();

        self.instructions
            .entry(name.clone())
            .or_default()
            .push(Instruction {
                name,
                args,
                friendly,
                code,
                opcode,
                mask,
                is32bit,
                can_be_shared,
            });
    }

    /// Replace every `$name` meta-variable with its encoder's syntax hint.
    fn friendly_fmt(&self, code: &str) -> String {
        let mut out = String::new();
        let bytes = code.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'$' {
                let mut j = i + 1;
                while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
                    j += 1;
                }
                let name = &code[i..j];
                match self.encoders.get(name) {
                    Some(enc) => out.push_str(enc.pretty),
                    None => out.push_str(name),
                }
                i = j;
            } else {
                out.push(bytes[i] as char);
                i += 1;
            }
        }
        out
    }

    pub fn lookup(&self, mnemonic: &str) -> &[Instruction] {
        self.instructions
            .get(mnemonic)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn encoder(&self, name: &str) -> &Encoder {
        &self.encoders[name]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inrange_is_range_exact() {
        assert_eq!(inrange(7, 7, 7), Some(7));
        assert_eq!(inrange(7, 8, 8), None);
        assert_eq!(inrange(7, -1, -1), None);
    }

    #[test]
    fn inrange_signed_masks_field() {
        assert_eq!(inrange_signed(127, -1, -1), Some(0xff));
        assert_eq!(inrange_signed(127, 127, 127), Some(127));
        assert_eq!(inrange_signed(127, -128, -128), Some(0x80));
        assert_eq!(inrange_signed(127, 128, 128), None);
        assert_eq!(inrange_signed(127, -129, -129), None);
    }

    #[test]
    fn add_inst_splits_template_into_tokens() {
        let mut core = ProcessorCore::new();
        core.add_enc("$r0", "R0-7", |v| inrange(7, v, v));
        core.add_enc("$i0", "#0-255", |v| inrange(255, v, v));
        core.add_inst("adds  $r0, $i0", 0x3000, 0xf800);
        let ins = &core.lookup("adds")[0];
        assert_eq!(ins.args, vec!["$r0", ",", "$i0"]);
        assert_eq!(ins.code, "adds $r0, $i0");
        assert_eq!(ins.friendly, "adds R0-7, #0-255");
    }
}

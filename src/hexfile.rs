// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Intel HEX template patcher.
//!
//! A device template carries the runtime followed by a reserved
//! bytecode region starting at 0x3C000. [`HexTemplateContext::setup_for`]
//! scans the template once: it locates the jump record (a fixed 16-byte
//! signature), the bytecode boundary, and the embedded function table
//! that maps runtime function names to addresses. [`HexTemplateContext::patch_hex`]
//! then splices assembled code into a copy of the template.

use std::collections::HashMap;

use crate::error::{AsmError, AsmErrorKind};

/// Absolute address where the bytecode region of a template begins.
pub const BYTECODE_REGION: i64 = 0x3C000;

const JUMP_SIGNATURE: &str = "0108010842424242010801083ED8E98D";

/// A parsed template, ready to receive patched bytecode.
#[derive(Debug)]
pub struct HexTemplateContext {
    hex: Vec<String>,
    template_sha: String,
    jmp_start_addr: i64,
    jmp_start_idx: usize,
    bytecode_start_addr: i64,
    bytecode_start_idx: usize,
    func_info: HashMap<String, i64>,
}

impl HexTemplateContext {
    /// Scan `template` and resolve the addresses of `func_names` from
    /// the function table that follows the jump record. Names must be
    /// listed in table order.
    pub fn setup_for(
        template: &[String],
        template_sha: &str,
        func_names: &[String],
    ) -> Result<Self, AsmError> {
        let mut hex: Vec<String> = template.to_vec();

        let mut upper_addr: i64 = 0;
        let mut last_addr: i64 = 0;
        let mut last_idx: usize = 0;
        let mut bytecode_start_addr: i64 = 0;
        let mut bytecode_start_idx: usize = 0;
        let mut jmp_start_addr: i64 = 0;
        let mut jmp_start_idx: usize = 0;

        for i in 0..hex.len() {
            let line = hex[i].clone();
            if let Some(u) = ela_upper(&line) {
                upper_addr = u;
            }
            if let Some(lo) = data_record_addr(&line) {
                let new_addr = (upper_addr << 16) | lo;
                if bytecode_start_addr == 0 && new_addr >= BYTECODE_REGION {
                    // force the record before the boundary to a full
                    // 16-byte data record so the bytecode starts aligned
                    let mut bytes = parse_hex_bytes(&hex[last_idx])?;
                    if bytes.first() != Some(&0x10) {
                        bytes.pop();
                        bytes[0] = 0x10;
                        while bytes.len() < 20 {
                            bytes.push(0);
                        }
                        hex[last_idx] = hex_bytes(bytes.clone());
                    }
                    assert!(bytes[2] & 0xf == 0);

                    bytecode_start_addr = last_addr + 16;
                    bytecode_start_idx = last_idx + 1;
                }
                last_idx = i;
                last_addr = new_addr;
            }
            if is_jump_record(&line) {
                jmp_start_addr = last_addr;
                jmp_start_idx = i;
            }
        }

        if jmp_start_addr == 0 || bytecode_start_addr == 0 {
            return Err(AsmError::new(AsmErrorKind::Hex, "No hex start", None));
        }

        let mut func_info = HashMap::new();
        let mut names = func_names.iter();
        let mut pending = names.next();

        'table: for line in hex.iter().skip(jmp_start_idx + 1) {
            if !(line.starts_with(":10") && line.len() >= 25 && &line[7..9] == "00") {
                continue;
            }
            let mut s = &line[9..];
            while s.len() >= 8 {
                let name = match pending {
                    Some(n) => n,
                    None => break 'table,
                };
                let hexb = &s[..8];
                let value = i64::from_str_radix(&swap_bytes(hexb), 16).unwrap_or(0) & !1;
                if value == 0 {
                    return Err(AsmError::new(
                        AsmErrorKind::Hex,
                        &format!("No value for {name} / {hexb}"),
                        None,
                    ));
                }
                func_info.insert(name.clone(), value);
                pending = names.next();
                s = &s[8..];
            }
        }

        if pending.is_some() {
            return Err(AsmError::new(AsmErrorKind::Hex, "No hex end", None));
        }

        Ok(Self {
            hex,
            template_sha: template_sha.to_string(),
            jmp_start_addr,
            jmp_start_idx,
            bytecode_start_addr,
            bytecode_start_idx,
            func_info,
        })
    }

    pub fn bytecode_start_addr(&self) -> i64 {
        self.bytecode_start_addr
    }

    /// Address of `name` relative to the bytecode start, as seen by
    /// generated code.
    pub fn lookup_function_addr(&self, name: &str) -> Option<i64> {
        self.func_info
            .get(name)
            .map(|v| v - self.bytecode_start_addr)
    }

    /// First 16 hex digits of the template sha, zero-padded, uppercase.
    pub fn hex_template_hash(&self) -> String {
        let mut sha: String = self.template_sha.chars().take(16).collect();
        while sha.len() < 16 {
            sha.push('0');
        }
        sha.to_uppercase()
    }

    /// Splice `buf` into the template as 16-byte records starting at the
    /// bytecode boundary. The jump record is rewritten to the bytecode
    /// header. With `short_form` only the code region is returned.
    pub fn patch_hex(&self, num_globals: i64, buf: &[u16], short_form: bool) -> Vec<String> {
        assert!(buf.len() < 32000);

        let mut myhex: Vec<String> = self.hex[..self.bytecode_start_idx].to_vec();

        let mut hd: Vec<u16> = vec![
            0x4207,
            num_globals as u16,
            (self.bytecode_start_addr & 0xffff) as u16,
            ((self.bytecode_start_addr >> 16) & 0xffff) as u16,
        ];
        let hash = self.hex_template_hash();
        for i in 0..4 {
            let w = u16::from_str_radix(&swap_bytes(&hash[i * 4..i * 4 + 4]), 16).unwrap_or(0);
            hd.push(w);
        }
        let mut ptr = 0usize;
        myhex[self.jmp_start_idx] = hex_bytes(next_line(&hd, &mut ptr, self.jmp_start_addr));

        if short_form {
            myhex.clear();
        }

        let mut ptr = 0usize;
        let mut addr = self.bytecode_start_addr;
        let mut upper = (addr - 16) >> 16;
        while ptr < buf.len() {
            if (addr >> 16) != upper {
                upper = addr >> 16;
                myhex.push(hex_bytes(vec![
                    0x02,
                    0x00,
                    0x00,
                    0x04,
                    ((upper >> 8) & 0xff) as u8,
                    (upper & 0xff) as u8,
                ]));
            }
            myhex.push(hex_bytes(next_line(buf, &mut ptr, addr)));
            addr += 16;
        }

        if !short_form {
            myhex.extend_from_slice(&self.hex[self.bytecode_start_idx..]);
        }

        myhex
    }
}

/// One 16-byte data record starting at `addr`, pulling 8 halfwords from
/// `buf` (zero-padded past the end) in little-endian byte order.
fn next_line(buf: &[u16], ptr: &mut usize, addr: i64) -> Vec<u8> {
    let mut bytes = vec![0x10, ((addr >> 8) & 0xff) as u8, (addr & 0xff) as u8, 0x00];
    for _ in 0..8 {
        let v = buf.get(*ptr).copied().unwrap_or(0);
        bytes.push((v & 0xff) as u8);
        bytes.push((v >> 8) as u8);
        *ptr += 1;
    }
    bytes
}

/// Render one record, appending the two's-complement checksum.
pub fn hex_bytes(mut bytes: Vec<u8>) -> String {
    let chk: u32 = bytes.iter().map(|&b| b as u32).sum();
    bytes.push((chk.wrapping_neg() & 0xff) as u8);
    let mut r = String::from(":");
    for b in bytes {
        r.push_str(&format!("{b:02X}"));
    }
    r
}

/// Decode a record line (with or without the leading `:`) into bytes.
pub fn parse_hex_bytes(line: &str) -> Result<Vec<u8>, AsmError> {
    let s = line.strip_prefix(':').unwrap_or(line).trim();
    if s.len() % 2 != 0 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(AsmError::new(AsmErrorKind::Hex, "bad bytes", Some(line)));
    }
    Ok((0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap_or(0))
        .collect())
}

// words in the function table are stored little-endian
fn swap_bytes(s: &str) -> String {
    let b = s.as_bytes();
    let mut r = String::with_capacity(s.len());
    let mut i = b.len();
    while i >= 2 {
        i -= 2;
        r.push(b[i] as char);
        r.push(b[i + 1] as char);
    }
    r
}

fn ela_upper(line: &str) -> Option<i64> {
    let rest = line.strip_prefix(":02000004")?;
    if rest.len() < 4 {
        return None;
    }
    i64::from_str_radix(&rest[..4], 16).ok()
}

fn data_record_addr(line: &str) -> Option<i64> {
    if !line.starts_with(':') || line.len() < 9 || &line[7..9] != "00" {
        return None;
    }
    i64::from_str_radix(&line[3..7], 16).ok()
}

fn is_jump_record(line: &str) -> bool {
    line.starts_with(":10")
        && line.len() >= 9 + JUMP_SIGNATURE.len()
        && &line[7..9] == "00"
        && &line[9..9 + JUMP_SIGNATURE.len()] == JUMP_SIGNATURE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> Vec<String> {
        vec![
            ":020000040000FA".to_string(),
            // jump record at 0x0800
            ":100800000108010842424242010801083ED8E98D30".to_string(),
            // function table: 0x1235 and 0x5679 (Thumb bits set)
            ":1008100035120000795600000000000000000000C2".to_string(),
            ":020000040003F7".to_string(),
            // last runtime record, right below the bytecode region
            ":10BFF0000000000000000000000000000000000041".to_string(),
            ":10C00000FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF40".to_string(),
            ":00000001FF".to_string(),
        ]
    }

    fn names() -> Vec<String> {
        vec!["pxt::one".to_string(), "pxt::two".to_string()]
    }

    #[test]
    fn checksum_is_twos_complement() {
        assert_eq!(hex_bytes(vec![0x02, 0x00, 0x00, 0x04, 0x00, 0x00]), ":020000040000FA");
        assert_eq!(hex_bytes(vec![]), ":00");
    }

    #[test]
    fn parse_hex_bytes_round_trips_and_rejects_garbage() {
        assert_eq!(
            parse_hex_bytes(":020000040003F7").unwrap(),
            vec![0x02, 0x00, 0x00, 0x04, 0x00, 0x03, 0xF7]
        );
        assert!(parse_hex_bytes(":02xx").is_err());
        assert!(parse_hex_bytes(":020").is_err());
    }

    #[test]
    fn setup_finds_boundary_and_function_table() {
        let ctx = HexTemplateContext::setup_for(&template(), "0123456789abcdef", &names()).unwrap();
        assert_eq!(ctx.bytecode_start_addr(), 0x3C000);
        assert_eq!(ctx.jmp_start_addr, 0x800);
        assert_eq!(ctx.jmp_start_idx, 1);
        assert_eq!(ctx.bytecode_start_idx, 5);
        // Thumb bit cleared, relative to the bytecode start
        assert_eq!(ctx.lookup_function_addr("pxt::one"), Some(0x1234 - 0x3C000));
        assert_eq!(ctx.lookup_function_addr("pxt::two"), Some(0x5678 - 0x3C000));
        assert_eq!(ctx.lookup_function_addr("pxt::other"), None);
        assert_eq!(ctx.hex_template_hash(), "0123456789ABCDEF");
    }

    #[test]
    fn setup_rejects_template_without_jump_record() {
        let t = vec![":00000001FF".to_string()];
        let err = HexTemplateContext::setup_for(&t, "", &[]).unwrap_err();
        assert_eq!(err.message(), "No hex start");
    }

    #[test]
    fn setup_reports_missing_function_values() {
        let mut n = names();
        n.push("pxt::three".to_string());
        // third table slot is zero
        let err = HexTemplateContext::setup_for(&template(), "", &n).unwrap_err();
        assert!(err.message().starts_with("No value for pxt::three"));
    }

    #[test]
    fn short_form_patch_emits_only_code_records() {
        let ctx = HexTemplateContext::setup_for(&template(), "0123456789abcdef", &names()).unwrap();
        let out = ctx.patch_hex(3, &[0x1111, 0x2222], true);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], hex_bytes(vec![
            0x10, 0xC0, 0x00, 0x00, 0x11, 0x11, 0x22, 0x22, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ]));
    }

    #[test]
    fn full_patch_rewrites_jump_record_and_keeps_template_tail() {
        let ctx = HexTemplateContext::setup_for(&template(), "0123456789abcdef", &names()).unwrap();
        let out = ctx.patch_hex(3, &[0x1111], false);

        // header record: magic, globals, start address, template hash
        assert!(out[1].starts_with(":100800000742030000C003000123456789ABCDEF"));
        // template head and tail survive
        assert_eq!(out[0], template()[0]);
        assert_eq!(out.last().map(String::as_str), Some(":00000001FF"));
        // code record lands at the bytecode boundary
        assert!(out.iter().any(|l| l.starts_with(":10C000001111")));
    }

    #[test]
    fn boundary_record_is_widened_to_sixteen_bytes() {
        let mut t = template();
        // replace the last runtime record with a short 8-byte one
        t[4] = hex_bytes(vec![0x08, 0xBF, 0xF0, 0x00, 0, 0, 0, 0, 0, 0, 0, 0]);
        let ctx = HexTemplateContext::setup_for(&t, "", &names()).unwrap();
        assert_eq!(ctx.bytecode_start_addr(), 0x3C000);
        let out = ctx.patch_hex(0, &[0xABCD], false);
        assert_eq!(out[4], ":10BFF0000000000000000000000000000000000041");
    }
}

// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! IR-to-assembly lowering and the binary serialization driver.
//!
//! [`serialize`] renders a whole [`Binary`] into one assembly source:
//! a fixed metadata header, every procedure wrapped in a `@scope`
//! region, then shared helpers and interned string literals. The text
//! is consumed by [`assemble`], which runs the multi-pass assembler and
//! resolves debug info against the final label table.

pub mod proc;
pub mod snippets;
pub mod thumb;

use std::collections::HashMap;

use crate::asm::file::InlineError;
use crate::asm::AsmFile;
use crate::error::{AsmError, AsmErrorKind};
use crate::ir::Binary;
use crate::thumb::ThumbProcessor;

pub use proc::{finalize_debug_info, ProcLowerer};
pub use snippets::{asm_string_literal, AssemblerSnippets, BitSizeInfo};
pub use thumb::ThumbSnippets;

/// First record of every generated binary, used by the hex patcher to
/// locate the bytecode inside a template.
pub const MAGIC_NUMBER: &str = "708E3B92C615A841C49866C975EE5197";

/// Normalize one generated snippet to source-line form: instructions
/// get a fixed indent, labels and block comments stay in column zero.
pub fn asmline(s: &str) -> String {
    if !s.contains('\n') {
        let keep = s.starts_with(|c: char| c.is_whitespace())
            || s.starts_with(';')
            || s.ends_with(':');
        if keep || s.is_empty() {
            return format!("{s}\n");
        }
        return format!("    {s}\n");
    }

    let mut out = String::new();
    for l in s.lines() {
        let t = l.trim_start();
        if t.is_empty() || t.ends_with(':') || t.starts_with("; ") {
            out.push_str(t);
        } else {
            out.push_str("    ");
            out.push_str(t);
        }
        out.push('\n');
    }
    out
}

/// Lower every procedure and render the complete assembly source.
pub fn serialize(bin: &mut Binary, template_hash: &str) -> Result<String, AsmError> {
    let t = ThumbSnippets::new(bin.target.clone());

    let mut src = String::from("; start\n");
    src.push_str(&format!("    .hex {MAGIC_NUMBER} ; magic number\n"));
    src.push_str(&format!("    .hex {template_hash} ; hex template hash\n"));
    src.push_str("    .hex 0000000000000000 ; program hash\n");
    src.push_str("    .space 16 ; reserved\n");

    for i in 0..bin.procs.len() {
        let code = ProcLowerer::lower(&t, bin, i)?;
        let seq = bin.procs[i].seq_no;
        src.push_str(&format!("\n@scope user{seq}\n{code}@scope\n"));
    }
    src.push_str("_code_end:\n\n");

    for (body, lbl) in bin.code_helpers.clone() {
        src.push_str(&format!("    .section code\n{lbl}:\n{body}\n"));
    }
    src.push_str("_helpers_end:\n\n_js_end:\n");

    for (s, lbl) in bin.strings.clone() {
        src.push_str(&t.string_literal(&lbl, &s));
    }
    src.push_str("_literals_end:\n_program_end:\n");

    Ok(src)
}

/// Output of one assembler run over serialized code.
pub struct Assembled {
    /// Cleaned listing with the size-statistics header.
    pub source: String,
    /// Emitted machine code, one entry per halfword.
    pub buf: Vec<u16>,
    /// Label name to absolute address.
    pub labels: HashMap<String, i64>,
}

/// Assemble serialized code, fill in the binary's debug info and map
/// the first assembler error back to the originating function.
pub fn assemble(
    bin: &mut Binary,
    src: &str,
    flash_size: u32,
    lookup: Option<Box<dyn Fn(&str) -> Option<i64> + '_>>,
) -> Result<Assembled, AsmError> {
    let ei = ThumbProcessor::new(bin.target.runtime_is_arm);
    let mut f = AsmFile::new(&ei);
    f.lookup_external_label = lookup;
    f.emit(src);

    if let Some(e) = f.errors.first() {
        return Err(user_error(bin, e));
    }

    finalize_debug_info(bin, &mut f);

    let labels = f.get_labels().clone();
    let source = f.get_source(true, bin.procs.len(), flash_size);
    Ok(Assembled {
        source,
        buf: f.buf,
        labels,
    })
}

/// Errors raised inside a `user<N>` scope carry the sequence number of
/// the procedure whose generated code failed to assemble.
fn user_error(bin: &Binary, e: &InlineError) -> AsmError {
    let mut msg = e.message.clone();
    if let Some(rest) = e.scope.strip_prefix("user") {
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(n) = digits.parse::<usize>() {
            if let Some(p) = bin.procs.iter().find(|p| p.seq_no == n) {
                msg = format!("At function {}:\n{}", p.full_name, msg);
            }
        }
    }
    AsmError::new(AsmErrorKind::Assembler, &msg, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BitSize, Procedure, TargetConfig};

    #[test]
    fn asmline_indents_instructions_only() {
        assert_eq!(asmline("push {lr}"), "    push {lr}\n");
        assert_eq!(asmline("_main:"), "_main:\n");
        assert_eq!(asmline("; endfun"), "; endfun\n");
        assert_eq!(asmline("    @stackmark args"), "    @stackmark args\n");
    }

    #[test]
    fn asmline_reindents_multiline_snippets() {
        let out = asmline("movs r0, #0\n.fail:\n  bx lr\n");
        assert_eq!(out, "    movs r0, #0\n.fail:\n    bx lr\n");
    }

    fn tiny_binary() -> (Binary, usize) {
        let mut bin = Binary::new(TargetConfig::default());
        let g = bin.mk_global("g0", BitSize::None);
        let mut p = Procedure::new("_fn1", "fn1", 0);
        let trg = bin.pool.cellref(&g);
        let v = bin.pool.numlit(42);
        let st = bin.pool.store(trg, v);
        p.emit_expr(st);
        p.stack_empty();
        let idx = bin.add_proc(p);
        let mut pool = std::mem::take(&mut bin.pool);
        bin.procs[idx].resolve(&mut pool);
        bin.pool = pool;
        (bin, idx)
    }

    #[test]
    fn serialize_emits_header_and_scopes() {
        let (mut bin, _) = tiny_binary();
        let src = serialize(&mut bin, "0000000000000000").unwrap();
        assert!(src.starts_with("; start\n"));
        assert!(src.contains(MAGIC_NUMBER));
        assert!(src.contains("@scope user1"));
        assert!(src.contains("_code_end:"));
        assert!(src.contains("_program_end:"));
    }

    #[test]
    fn serialize_then_assemble_resolves_debug_info() {
        let (mut bin, idx) = tiny_binary();
        let src = serialize(&mut bin, "0000000000000000").unwrap();
        let out = assemble(&mut bin, &src, 0, None).unwrap();

        assert!(!out.buf.is_empty());
        assert!(out.labels.contains_key("_fn1"));
        assert!(out.source.contains("; generated code sizes"));

        let dbg = bin.procs[idx].debug_info.as_ref().unwrap();
        assert_eq!(dbg.idx, 1);
        assert!(dbg.size > 0);
        assert!(dbg.code_end_loc >= dbg.code_start_loc);
    }

    #[test]
    fn assembler_errors_name_the_function() {
        let (mut bin, _) = tiny_binary();
        let src = "@scope user1\n    bl .nowhere\n@scope\n";
        let err = match assemble(&mut bin, src, 0, None) {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert!(err.message().starts_with("At function fn1:"));
    }
}

// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! End-to-end pipeline: lower an IR binary to assembly, assemble it and
//! patch the machine code into a device template.

use thumbforge::hexfile::HexTemplateContext;
use thumbforge::ir::{BitSize, Binary, Procedure, TargetConfig};
use thumbforge::lowering::{assemble, serialize, MAGIC_NUMBER};

fn template() -> Vec<String> {
    vec![
        ":020000040000FA".to_string(),
        ":100800000108010842424242010801083ED8E98D30".to_string(),
        ":1008100035120000795600000000000000000000C2".to_string(),
        ":020000040003F7".to_string(),
        ":10BFF0000000000000000000000000000000000041".to_string(),
        ":10C00000FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF40".to_string(),
        ":00000001FF".to_string(),
    ]
}

fn sample_binary() -> Binary {
    let mut bin = Binary::new(TargetConfig::default());
    let g = bin.mk_global("counter", BitSize::None);
    let mut p = Procedure::new("_main", "main", 0);
    let trg = bin.pool.cellref(&g);
    let v = bin.pool.numlit(7);
    let st = bin.pool.store(trg, v);
    p.emit_expr(st);
    p.stack_empty();
    let idx = bin.add_proc(p);
    let mut pool = std::mem::take(&mut bin.pool);
    bin.procs[idx].resolve(&mut pool);
    bin.pool = pool;
    bin
}

#[test]
fn lower_assemble_and_patch_a_whole_program() {
    let names = vec!["core::one".to_string(), "core::two".to_string()];
    let ctx = HexTemplateContext::setup_for(&template(), "deadbeef01020304", &names).unwrap();
    assert_eq!(ctx.bytecode_start_addr(), 0x3C000);
    assert_eq!(
        ctx.lookup_function_addr("core::one"),
        Some(0x1234 - 0x3C000)
    );

    let mut bin = sample_binary();
    let src = serialize(&mut bin, &ctx.hex_template_hash()).unwrap();
    assert!(src.contains(MAGIC_NUMBER));
    assert!(src.contains("@scope user1"));

    let lookup = Box::new(|name: &str| ctx.lookup_function_addr(name));
    let out = assemble(&mut bin, &src, 0, Some(lookup)).unwrap();
    assert!(out.labels.contains_key("_main"));
    assert!(out.source.contains("; generated code sizes"));

    let hex = ctx.patch_hex(bin.num_global_words(), &out.buf, false);
    assert_eq!(hex[0], ":020000040000FA");
    assert!(
        hex[1].starts_with(":10080000"),
        "jump record must be replaced in place"
    );
    assert_eq!(hex.last().map(String::as_str), Some(":00000001FF"));
    assert!(
        hex.iter().any(|l| l.starts_with(":10C00000")),
        "code records land at the bytecode region"
    );

    let short = ctx.patch_hex(bin.num_global_words(), &out.buf, true);
    assert!(short.len() < hex.len());
    assert!(short.iter().all(|l| l != ":00000001FF"));
}

#[test]
fn debug_info_covers_every_procedure() {
    let mut bin = sample_binary();
    let src = serialize(&mut bin, "0000000000000000").unwrap();
    assemble(&mut bin, &src, 0, None).unwrap();

    for p in &bin.procs {
        let dbg = p.debug_info.as_ref().unwrap();
        assert_eq!(dbg.name, p.full_name);
        assert!(dbg.size > 0);
    }
}

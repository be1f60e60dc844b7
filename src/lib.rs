// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! thumbforge: an ARM Thumb assembler and compiler backend.
//!
//! The crate has two entry layers. The assembler layer ([`asm`] plus the
//! [`thumb`] target) turns assembly text into machine code through a
//! multi-pass driver with literal pools and peephole rewriting. The
//! compiler layer ([`ir`] and [`lowering`]) lowers an expression-tree IR
//! into that assembly dialect, one procedure at a time, and resolves
//! debug info against the final label table. [`hexfile`] patches the
//! resulting code into a device template in Intel HEX format.

pub mod asm;
pub mod error;
pub mod hexfile;
pub mod ir;
pub mod lowering;
pub mod report;
pub mod thumb;

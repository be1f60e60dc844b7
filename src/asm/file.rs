// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Multi-pass assembly driver.
//!
//! [`AsmFile`] parses source text into [`Line`]s and emits the binary
//! buffer. Labels and variable-width branches are resolved by repeated
//! passes: a labels pass, literal-pool expansion, a final emit, then
//! peephole passes re-running the emit until no line changes.

use std::collections::HashMap;

use super::encoder::{EmitResult, EncoderKind, Instruction};
use super::line::{tokenize, Line, LineKind, PeepCounts};
use super::Processor;

/// Upper bound on peephole fixpoint iterations; Thumb reach semantics do
/// not admit divergence, so hitting the cap with rewrites still pending
/// signals a driver bug.
pub const MAX_PEEP_PASSES: u32 = 5;

/// A structured error attached to one source line. `scope` threads the
/// originating high-level procedure (`user<N>`) so inline-assembly
/// failures can point back to a named user function.
#[derive(Debug, Clone)]
pub struct InlineError {
    pub scope: String,
    pub message: String,
    pub line: String,
    pub line_no: u32,
    pub coremsg: String,
    pub hints: String,
}

/// One assembly session: the ordered line list, label table, error list
/// and output buffer, driven by a target [`Processor`].
pub struct AsmFile<'a> {
    pub ei: &'a dyn Processor,
    pub base_offset: i64,
    pub final_emit: bool,
    pub really_final_emit: bool,
    pub check_stack: bool,
    pub inline_mode: bool,
    pub lookup_external_label: Option<Box<dyn Fn(&str) -> Option<i64> + 'a>>,
    pub lines: Vec<Line<'a>>,
    pub errors: Vec<InlineError>,
    pub buf: Vec<u16>,
    pub peep: PeepCounts,
    pub panic_on_error: bool,
    pub disable_peephole: bool,
    pub stack_at_label: HashMap<String, i32>,

    labels: HashMap<String, u32>,
    user_labels_cache: Option<HashMap<String, i64>>,
    stackpointers: HashMap<String, i32>,
    stack: i32,
    scope: String,
    scope_id: u32,
    curr_line_no: u32,
    real_curr_line_no: u32,
    curr_line_text: String,
    started: bool,
    stats: String,
}

impl<'a> AsmFile<'a> {
    pub fn new(ei: &'a dyn Processor) -> Self {
        Self {
            ei,
            base_offset: 0,
            final_emit: false,
            really_final_emit: false,
            check_stack: true,
            inline_mode: false,
            lookup_external_label: None,
            lines: Vec::new(),
            errors: Vec::new(),
            buf: Vec::new(),
            peep: PeepCounts::default(),
            panic_on_error: false,
            disable_peephole: false,
            stack_at_label: HashMap::new(),
            labels: HashMap::new(),
            user_labels_cache: None,
            stackpointers: HashMap::new(),
            stack: 0,
            scope: String::new(),
            scope_id: 0,
            curr_line_no: 0,
            real_curr_line_no: 0,
            curr_line_text: "<start>".to_string(),
            started: false,
            stats: String::new(),
        }
    }

    fn emit_short(&mut self, op: u32) {
        assert!(op <= 0xffff);
        self.buf.push(op as u16);
    }

    /// Byte offset of the next emitted opcode.
    pub fn location(&self) -> u32 {
        // one short (2 bytes) per buf slot
        (self.buf.len() * 2) as u32
    }

    pub fn pc(&self) -> i64 {
        self.location() as i64 + self.base_offset
    }

    /// Parse an "integer": literals, `*` products, `|1`/`+1`/`-1`
    /// suffixes, `>>` shifts, `label@hi/lo/fn` fragments and stack
    /// references `name@offset`.
    pub fn parse_one_int(&mut self, s: &str) -> Option<i64> {
        if s.is_empty() {
            return None;
        }

        // fast path
        if s.bytes().all(|b| b.is_ascii_digit()) {
            return s.parse::<i64>().ok();
        }

        let mut mul: i64 = 1;

        // left-to-right product chain
        let mut rest = s.to_string();
        while let Some(star) = rest.find('*') {
            let tmp = self.parse_one_int(&rest[..star])?;
            mul *= tmp;
            rest = rest[star + 1..].to_string();
        }
        let mut s: &str = &rest;

        if let Some(stripped) = s.strip_prefix('-') {
            mul *= -1;
            s = stripped;
        } else if let Some(stripped) = s.strip_prefix('+') {
            s = stripped;
        }

        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            return s.parse::<i64>().ok().map(|v| v * mul);
        }

        if let Some(head) = s.strip_suffix("|1") {
            return self.parse_one_int(head).map(|v| v | 1);
        }
        if let Some(head) = s.strip_suffix("-1") {
            return self.parse_one_int(head).map(|v| v - 1);
        }
        if let Some(head) = s.strip_suffix("+1") {
            return self.parse_one_int(head).map(|v| v + 1);
        }

        if let Some(shift_at) = s.rfind(">>") {
            let tail = &s[shift_at + 2..];
            if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) {
                let left = self.parse_one_int(&s[..shift_at])?;
                let mask = self.base_offset & !0xffffff;
                let left = left & !mask;
                return Some(left >> tail.parse::<u32>().ok()?);
            }
        }

        let mut v: Option<i64> = None;

        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            if !hex.is_empty() && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                v = i64::from_str_radix(hex, 16).ok();
            }
        } else if let Some(bin) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
            if !bin.is_empty() && bin.bytes().all(|b| b == b'0' || b == b'1') {
                v = i64::from_str_radix(bin, 2).ok();
            }
        }

        if s.contains('@') {
            if let Some((name, off)) = split_stack_ref(s) {
                if mul != 1 {
                    self.directive_error("multiplication not supported with saved stacks");
                }
                match self.stackpointers.get(name).copied() {
                    Some(sp) => {
                        let delta = (self.stack - sp) as i64 + off;
                        v = Some(
                            self.ei.word_size() * self.ei.compute_stack_offset(name, delta),
                        );
                    }
                    None => self.directive_error("saved stack not found"),
                }
            } else if let Some((lbl, selector)) = s.rsplit_once('@') {
                if matches!(selector, "hi" | "lo" | "fn") && self.looks_like_label(lbl) {
                    if let Some(addr) = self.lookup_label_direct(lbl) {
                        if selector == "fn" {
                            v = Some(self.ei.to_fn_ptr(addr, self.base_offset, lbl));
                        } else {
                            let half = addr >> 1;
                            if (0..=0xffff).contains(&half) {
                                v = Some(if selector == "hi" {
                                    (half >> 8) & 0xff
                                } else {
                                    half & 0xff
                                });
                            } else {
                                self.directive_error("@hi/lo out of range");
                            }
                        }
                    }
                }
            }
        }

        if v.is_none() && self.looks_like_label(s) {
            v = self.lookup_label_direct(s);
            if let Some(addr) = v {
                if self.ei.post_process_rel_address(self, 1) == 1 {
                    v = Some(addr + self.base_offset);
                }
            }
        }

        v.map(|v| v * mul)
    }

    fn looks_like_label(&self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        if lower == "pc" || lower == "sp" || lower == "lr" {
            return false;
        }
        let b = lower.as_bytes();
        if b.len() == 2 && b[0] == b'r' && b[1].is_ascii_digit() {
            return false;
        }
        let mut chars = name.bytes();
        match chars.next() {
            Some(c) if c == b'.' || c == b'_' || c.is_ascii_alphabetic() => {}
            _ => return false,
        }
        chars.all(|c| c == b'.' || c == b':' || c == b'_' || c == b'+' || c.is_ascii_alphanumeric())
    }

    fn scoped_name(&self, name: &str) -> String {
        if name.starts_with('.') && !self.scope.is_empty() {
            format!("{}${}", self.scope, name)
        } else {
            name.to_string()
        }
    }

    pub fn lookup_label(&self, name: &str) -> Option<i64> {
        let scoped = self.scoped_name(name);
        if let Some(&v) = self.labels.get(&scoped) {
            return Some(self.ei.post_process_rel_address(self, v as i64));
        }
        if let Some(ext) = &self.lookup_external_label {
            if let Some(v) = ext(name) {
                return Some(self.ei.post_process_abs_address(self, v));
            }
        }
        None
    }

    /// Like [`lookup_label`], but reports an error on the final pass and
    /// substitutes a placeholder on earlier passes.
    fn lookup_label_direct(&mut self, name: &str) -> Option<i64> {
        match self.lookup_label(name) {
            Some(v) => Some(v),
            None => {
                if self.final_emit {
                    self.directive_error(&format!("unknown label: {name}"));
                    None
                } else {
                    // any multi-byte value will do for sizing passes
                    Some(33333)
                }
            }
        }
    }

    fn align(&mut self, n: u32) {
        assert!(n == 2 || n == 4 || n == 8 || n == 16);
        while self.location() % n != 0 {
            self.emit_short(0);
        }
    }

    pub fn push_error(&mut self, msg: &str, hints: &str) {
        let err = InlineError {
            scope: self.scope.clone(),
            message: format!(
                "  -> Line {} ('{}'), error: {}\n{}",
                self.curr_line_no, self.curr_line_text, msg, hints
            ),
            line_no: self.curr_line_no,
            line: self.curr_line_text.clone(),
            coremsg: msg.to_string(),
            hints: hints.to_string(),
        };
        let message = err.message.clone();
        self.errors.push(err);
        if self.panic_on_error {
            panic!("{message}");
        }
    }

    fn directive_error(&mut self, msg: &str) {
        self.push_error(msg, "");
    }

    fn emit_string(&mut self, text: &str) {
        let parsed = extract_quoted(text).and_then(parse_string);
        match parsed {
            None => self.directive_error("expecting string"),
            Some(bytes) => {
                self.align(2);
                // trailing NUL included
                let mut padded = bytes;
                padded.push(0);
                if padded.len() % 2 != 0 {
                    padded.push(0);
                }
                for pair in padded.chunks(2) {
                    self.emit_short(((pair[1] as u32) << 8) | pair[0] as u32);
                }
            }
        }
    }

    fn parse_numbers(&mut self, words: &[String]) -> Vec<i64> {
        let mut words = &words[1..];
        let mut nums = Vec::new();
        loop {
            let first = words.first().cloned();
            match first.and_then(|w| self.parse_one_int(&w)) {
                None => {
                    let at = words.first().map(String::as_str).unwrap_or("");
                    self.directive_error(&format!("cannot parse number at '{at}'"));
                    break;
                }
                Some(n) => {
                    nums.push(n);
                    words = &words[1..];
                }
            }
            match words.first().map(String::as_str) {
                Some(",") => {
                    words = &words[1..];
                    if words.is_empty() {
                        break;
                    }
                }
                None => break,
                Some(other) => {
                    self.directive_error(&format!("expecting number, got '{other}'"));
                    break;
                }
            }
        }
        nums
    }

    fn emit_space(&mut self, words: &[String]) {
        let mut nums = self.parse_numbers(words);
        if nums.len() == 1 {
            nums.push(0);
        }
        if nums.len() != 2 {
            self.directive_error("expecting one or two numbers");
        } else if nums[0] % 2 != 0 {
            self.directive_error("only even space supported");
        } else {
            let f = (nums[1] & 0xff) as u32;
            let f = f | (f << 8);
            let mut i = 0;
            while i < nums[0] {
                self.emit_short(f);
                i += 2;
            }
        }
    }

    fn emit_bytes(&mut self, words: &[String]) {
        let mut nums = self.parse_numbers(words);
        if nums.len() % 2 != 0 {
            self.directive_error(".byte needs an even number of arguments");
            nums.push(0);
        }
        for pair in nums.chunks(2) {
            let (n0, n1) = (pair[0], pair[1]);
            if (0..=0xff).contains(&n0) && (0..=0xff).contains(&n1) {
                self.emit_short(((n1 as u32 & 0xff) << 8) | (n0 as u32 & 0xff));
            } else {
                self.directive_error("expecting uint8");
            }
        }
    }

    fn emit_hex(&mut self, words: &[String]) {
        for w in &words[1..] {
            if w == "," {
                continue;
            }
            if w.len() % 4 != 0 {
                self.directive_error(".hex needs an even number of bytes");
            } else if !w.bytes().all(|b| b.is_ascii_hexdigit()) {
                self.directive_error(".hex needs a hex number");
            } else {
                for i in (0..w.len()).step_by(4) {
                    let n = u32::from_str_radix(&w[i..i + 4], 16).unwrap_or(0);
                    let n = ((n & 0xff) << 8) | ((n >> 8) & 0xff);
                    self.emit_short(n);
                }
            }
        }
    }

    fn handle_directive(&mut self, idx: usize) {
        let words = self.lines[idx].words.clone();
        let text = self.lines[idx].text.clone();

        let one_arg = words.len() == 2;

        match words[0].as_str() {
            ".ascii" | ".asciz" | ".string" => self.emit_string(&text),
            ".align" => {
                if !one_arg {
                    self.directive_error("expecting one argument");
                }
                match words.get(1).cloned().and_then(|w| self.parse_one_int(&w)) {
                    Some(0) => {}
                    Some(n) if (1..=4).contains(&n) => self.align(1u32 << n as u32),
                    Some(_) => self
                        .directive_error("expecting 1, 2, 3 or 4 (for 2, 4, 8, or 16 byte alignment)"),
                    None => self.directive_error("expecting number"),
                }
            }
            ".balign" => {
                if !one_arg {
                    self.directive_error("expecting one argument");
                }
                match words.get(1).cloned().and_then(|w| self.parse_one_int(&w)) {
                    Some(1) => {}
                    Some(n) if n == 2 || n == 4 || n == 8 || n == 16 => self.align(n as u32),
                    Some(_) => self.directive_error("expecting 2, 4, 8, or 16"),
                    None => self.directive_error("expecting number"),
                }
            }
            ".p2align" => {
                if !one_arg {
                    self.directive_error("expecting one argument");
                }
                match words.get(1).cloned().and_then(|w| self.parse_one_int(&w)) {
                    Some(n) if (1..=4).contains(&n) => self.align(1u32 << n as u32),
                    _ => self.directive_error("expecting number"),
                }
            }
            ".byte" => self.emit_bytes(&words),
            ".hex" => self.emit_hex(&words),
            ".hword" | ".short" | ".2bytes" => {
                for n in self.parse_numbers(&words) {
                    // negative numbers allowed
                    if (-0x8000..=0xffff).contains(&n) {
                        self.emit_short((n & 0xffff) as u32);
                    } else {
                        self.directive_error("expecting int16");
                    }
                }
            }
            ".word" | ".4bytes" | ".long" => {
                for n in self.parse_numbers(&words) {
                    if (-0x8000_0000..=0xffff_ffff).contains(&n) {
                        self.emit_short((n & 0xffff) as u32);
                        self.emit_short(((n >> 16) & 0xffff) as u32);
                    } else {
                        self.directive_error("expecting int32");
                    }
                }
            }
            ".skip" | ".space" => self.emit_space(&words),
            ".startaddr" => {
                if self.location() != 0 {
                    self.directive_error(
                        ".startaddr can be only be specified at the beginning of the file",
                    );
                }
                if !one_arg {
                    self.directive_error("expecting one argument");
                }
                if let Some(v) = words.get(1).cloned().and_then(|w| self.parse_one_int(&w)) {
                    self.base_offset = v;
                }
            }
            // Usage:
            //   push {...}
            //   @stackmark locals   ; locals := sp
            //   ldr r0, [sp, locals@3] ; load local number 3
            //   @stackempty locals  ; expect the marked depth here
            "@stackmark" => {
                if !one_arg {
                    self.directive_error("expecting one argument");
                } else {
                    self.stackpointers.insert(words[1].clone(), self.stack);
                }
            }
            "@stackempty" => {
                if self.check_stack {
                    match words.get(1).and_then(|w| self.stackpointers.get(w)) {
                        None => self.directive_error("no such saved stack"),
                        Some(&mark) if mark != self.stack => {
                            self.directive_error("stack mismatch")
                        }
                        Some(_) => {}
                    }
                }
            }
            "@scope" => {
                self.scope = words.get(1).cloned().unwrap_or_default();
                self.curr_line_no = if self.scope.is_empty() {
                    self.real_curr_line_no
                } else {
                    0
                };
            }
            ".syntax" | "@nostackcheck" => self.check_stack = false,
            "@dummystack" => {
                if !one_arg {
                    self.directive_error("expecting one argument");
                }
                if let Some(n) = words.get(1).cloned().and_then(|w| self.parse_one_int(&w)) {
                    self.stack += n as i32;
                }
            }
            ".section" | ".global" | ".object" => {
                self.stackpointers.clear();
                self.stack = 0;
                self.scope = format!("$S{}", self.scope_id);
                self.scope_id += 1;
            }
            ".file" | ".text" | ".cpu" | ".fpu" | ".eabi_attribute" | ".code" | ".thumb_func"
            | ".type" | ".fnstart" | ".save" | ".size" | ".fnend" | ".pad" | ".globl"
            | ".local" | "@" => {}
            w if w.starts_with(".cfi_") => {}
            _ => self.directive_error("unknown directive"),
        }
    }

    /// Encode one line against one instruction pattern.
    fn instr_emit(&mut self, instr: &Instruction, tokens: &[String]) -> EmitResult {
        use super::encoder::emit_err;

        if tokens[0] != instr.name {
            return emit_err("opcode name doesn't match", "<name>");
        }
        let ei = self.ei;
        let mut r = instr.opcode;
        let mut j = 1usize;
        let mut stack: i32 = 0;
        let mut num_args: Vec<i64> = Vec::new();
        let mut label_name: Option<String> = None;
        let mut bit32_value: Option<i64> = None;
        let mut bit32_actual = String::new();

        for formal in &instr.args {
            let mut actual = tokens.get(j).cloned().unwrap_or_default();
            j += 1;
            if formal.starts_with('$') {
                let enc = ei.core().encoder(formal);
                let v: i64;
                match enc.kind {
                    EncoderKind::Register => {
                        match ei.register_no(&actual) {
                            None => return emit_err("expecting register name", &actual),
                            Some(no) => v = no,
                        }
                        if ei.is_push(instr.opcode) {
                            stack += 1;
                        } else if ei.is_pop(instr.opcode) {
                            stack -= 1;
                        }
                    }
                    EncoderKind::Immediate => {
                        let trimmed = actual.trim_start_matches('#').to_string();
                        match self.parse_one_int(&trimmed) {
                            None => return emit_err("expecting number", &trimmed),
                            Some(n) => {
                                v = n;
                                // explicit SP adjustment tracks stack depth
                                if ei.is_add_sp(instr.opcode) {
                                    stack = -((n / ei.word_size()) as i32);
                                } else if ei.is_sub_sp(instr.opcode) {
                                    stack = (n / ei.word_size()) as i32;
                                }
                            }
                        }
                    }
                    EncoderKind::RegList => {
                        if actual != "{" {
                            return emit_err("expecting {", &actual);
                        }
                        let mut bits: i64 = 0;
                        loop {
                            match tokens.get(j).map(String::as_str) {
                                Some("}") => break,
                                None => {
                                    let prev = tokens.get(j - 2).cloned().unwrap_or_default();
                                    return emit_err("expecting }", &prev);
                                }
                                Some(tok) => {
                                    let tok = tok.to_string();
                                    j += 1;
                                    let no = match ei.register_no(&tok) {
                                        None => {
                                            return emit_err("expecting register name", &tok)
                                        }
                                        Some(no) => no,
                                    };
                                    if bits & (1 << no) != 0 {
                                        return emit_err("duplicate register name", &tok);
                                    }
                                    bits |= 1 << no;
                                    if ei.is_push(instr.opcode) {
                                        stack += 1;
                                    } else if ei.is_pop(instr.opcode) {
                                        stack -= 1;
                                    }
                                    if tokens.get(j).map(String::as_str) == Some(",") {
                                        j += 1;
                                    }
                                }
                            }
                        }
                        j += 1; // skip closing brace
                        v = bits;
                    }
                    EncoderKind::Label => {
                        actual = actual.trim_start_matches('#').to_string();
                        if let Some(n) = parse_signed_decimal(&actual) {
                            v = n;
                            label_name = Some(format!("rel{n}"));
                        } else if let Some(n) = parse_hex_literal(&actual) {
                            v = n;
                            label_name = Some(format!("abs{n}"));
                        } else {
                            label_name = Some(actual.clone());
                            match ei.get_address_from_label(self, &actual, enc.is_word_aligned) {
                                Some(n) => v = n,
                                None => {
                                    if self.final_emit {
                                        return emit_err("unknown label", &actual);
                                    }
                                    // placeholder for sizing passes; must be
                                    // divisible by 4
                                    v = 8;
                                }
                            }
                        }
                        if ei.is32bit(instr) {
                            bit32_value = Some(v);
                            bit32_actual = actual;
                            continue;
                        }
                    }
                }

                num_args.push(v);

                match enc.encode(v) {
                    None => return emit_err("argument out of range or mis-aligned", &actual),
                    Some(bits) => {
                        assert_eq!(r & bits, 0);
                        r |= bits;
                    }
                }
            } else if *formal == actual {
                // punctuation matched
            } else {
                return emit_err(&format!("expecting {formal}"), &actual);
            }
        }

        if let Some(extra) = tokens.get(j) {
            return emit_err("trailing tokens", extra);
        }

        if ei.is32bit(instr) {
            return ei.emit32(r, bit32_value.unwrap_or(0), &bit32_actual);
        }

        EmitResult::Emitted {
            stack,
            opcode: r,
            opcode2: None,
            num_args,
            label_name,
        }
    }

    fn handle_one_instruction(&mut self, idx: usize, instr: &'a Instruction) -> bool {
        let tokens = self.lines[idx].words.clone();
        match self.instr_emit(instr, &tokens) {
            EmitResult::Error { .. } => false,
            EmitResult::Emitted {
                stack,
                opcode,
                opcode2,
                num_args,
                ..
            } => {
                self.stack += stack;
                if self.check_stack && self.stack < 0 {
                    self.push_error("stack underflow", "");
                }
                let location = self.location();
                self.emit_short(opcode);
                if let Some(op2) = opcode2 {
                    self.emit_short(op2);
                }
                let line = &mut self.lines[idx];
                line.location = location;
                line.opcode = opcode;
                line.stack = stack;
                line.instruction = Some(instr);
                line.num_args = num_args;
                true
            }
        }
    }

    fn handle_instruction(&mut self, idx: usize) {
        if let Some(instr) = self.lines[idx].instruction {
            if self.handle_one_instruction(idx, instr) {
                return;
            }
        }

        let ei = self.ei;
        if self.lines[idx].instruction.is_none() {
            let mnemonic = self.lines[idx].words[0].clone();
            let candidates: Vec<&'a Instruction> = ei.core().lookup(&mnemonic).iter().collect();
            for instr in candidates {
                if self.handle_one_instruction(idx, instr) {
                    return;
                }
            }
        }

        // build "Maybe:" hints from near-miss mnemonics
        let w0: String = self.lines[idx].words[0]
            .to_ascii_lowercase()
            .trim_end_matches('s')
            .chars()
            .filter(|c| c.is_ascii_lowercase())
            .collect();
        let with_s = format!("{w0}s");
        let possibilities: Vec<&'a Instruction> = ei
            .core()
            .lookup(&w0)
            .iter()
            .chain(ei.core().lookup(&with_s).iter())
            .collect();

        let tokens = self.lines[idx].words.clone();
        let mut hints = String::new();
        for instr in possibilities {
            if let EmitResult::Error { message, error_at } = self.instr_emit(instr, &tokens) {
                hints.push_str(&format!(
                    "   Maybe: {} ({} at '{}')\n",
                    instr.friendly, message, error_at
                ));
            }
        }

        self.push_error("assembly error", &hints);
    }

    /// Parse one source line (possibly a `label: rest` pair) into `lst`.
    pub fn build_line(&mut self, tx: &str, lst: &mut Vec<Line<'a>>) {
        let mut line = Line::new(tx.to_string());
        line.scope = self.scope.clone();
        line.line_no = self.curr_line_no;
        line.words = tokenize(tx).unwrap_or_default();

        let w0 = line.words.first().cloned().unwrap_or_default();

        if let Some(label) = parse_label_def(&w0) {
            line.kind = LineKind::Label;
            line.text = format!("{label}:");
            let rest: Vec<String> = line.words[1..].to_vec();
            line.words = vec![label.to_string()];
            lst.push(line);
            if rest.is_empty() {
                return;
            }
            let tail = match tx.find(':') {
                Some(pos) => tx[pos + 1..].to_string(),
                None => String::new(),
            };
            let mut cont = Line::new(tail);
            cont.scope = self.scope.clone();
            cont.line_no = self.curr_line_no;
            cont.words = rest;
            self.classify(&mut cont);
            let needs_scope = cont.kind == LineKind::Directive && cont.words[0] == "@scope";
            lst.push(cont);
            if needs_scope {
                let idx = lst.len() - 1;
                self.run_scope_directive(lst, idx);
            }
            return;
        }

        self.classify(&mut line);
        let needs_scope = line.kind == LineKind::Directive
            && line.words.first().map(String::as_str) == Some("@scope");
        lst.push(line);
        if needs_scope {
            let idx = lst.len() - 1;
            self.run_scope_directive(lst, idx);
        }
    }

    fn run_scope_directive(&mut self, lst: &mut [Line<'a>], idx: usize) {
        // @scope takes effect already while building lines, so the scope
        // is attached to everything that follows during parsing
        let words = &lst[idx].words;
        self.scope = words.get(1).cloned().unwrap_or_default();
        self.curr_line_no = if self.scope.is_empty() {
            self.real_curr_line_no
        } else {
            0
        };
    }

    fn classify(&self, line: &mut Line<'a>) {
        let w0 = line.words.first().cloned().unwrap_or_default();
        let c0 = w0.chars().next().unwrap_or(' ');
        if c0 == '.' || c0 == '@' {
            line.kind = LineKind::Directive;
        } else if line.words.is_empty() {
            line.kind = LineKind::Empty;
        } else {
            line.kind = LineKind::Instruction;
        }
    }

    fn prep_lines(&mut self, text: &str) {
        self.curr_line_no = 0;
        self.real_curr_line_no = 0;
        self.lines = Vec::new();

        let mut lines = Vec::new();
        for tx in text.split('\n') {
            let tx = tx.strip_suffix('\r').unwrap_or(tx);
            if self.errors.len() > 10 {
                break;
            }
            self.curr_line_no += 1;
            self.real_curr_line_no += 1;
            self.build_line(tx, &mut lines);
        }
        self.lines = lines;
    }

    fn iter_lines(&mut self) {
        self.stack = 0;
        self.buf = Vec::new();
        self.scope_id = 0;

        for idx in 0..self.lines.len() {
            if self.errors.len() > 10 {
                break;
            }

            self.curr_line_no = self.lines[idx].line_no;
            self.curr_line_text = self.lines[idx].text.clone();

            if self.lines[idx].words.is_empty() {
                continue;
            }

            match self.lines[idx].kind {
                LineKind::Label => {
                    let lblname = self.scoped_name(&self.lines[idx].words[0]);
                    if self.final_emit {
                        let curr = self.labels.get(&lblname).copied();
                        let curr = match curr {
                            Some(c) => c,
                            None => panic!("label vanished between passes: {lblname}"),
                        };
                        assert!(!self.errors.is_empty() || curr == self.location());
                        if self.really_final_emit {
                            self.stack_at_label.insert(lblname, self.stack);
                        }
                    } else if self.labels.contains_key(&lblname) {
                        self.directive_error("label redefinition");
                    } else if self.inline_mode && lblname.starts_with('_') {
                        self.directive_error(
                            "labels starting with '_' are reserved for the compiler",
                        );
                    } else {
                        self.labels.insert(lblname, self.location());
                    }
                    let loc = self.location();
                    self.lines[idx].location = loc;
                }
                LineKind::Directive => self.handle_directive(idx),
                LineKind::Instruction => self.handle_instruction(idx),
                LineKind::Empty => {}
            }
        }
    }

    /// Render the current line list back to text, with a size-statistics
    /// header. With `clean` set, rewrite trails and emptied lines are
    /// dropped.
    pub fn get_source(&self, clean: bool, num_stmts: usize, flash_size: u32) -> String {
        let mut len_prev: u32 = 0;
        let mut size = |lbl: &str| -> u32 {
            let curr = self.labels.get(lbl).copied().unwrap_or(len_prev);
            let sz = curr.saturating_sub(len_prev);
            len_prev = curr;
            sz
        };
        let len_total = self.location();
        let len_code = size("_code_end");
        let len_helpers = size("_helpers_end");
        let len_vtables = size("_vtables_end");
        let len_literals = size("_literals_end");
        let len_all_code = len_prev;
        let total_size = (len_total as i64 + self.base_offset) & 0xffffff;

        let flash_size = if flash_size == 0 { 128 * 1024 } else { flash_size };
        let num_stmts = num_stmts.max(1);

        let mut res = format!(
            "; generated code sizes (bytes): {} (incl. {} user, {} helpers, {} vtables, {} lits); src size {}\n",
            len_all_code,
            len_code,
            len_helpers,
            len_vtables,
            len_literals,
            len_total - len_all_code
        );
        res.push_str(&format!(
            "; assembly: {} lines; density: {:.2} bytes/stmt; ({} stmts)\n",
            self.lines.len(),
            len_code as f64 / num_stmts as f64,
            num_stmts
        ));
        res.push_str(&format!(
            "; total bytes: {} ({:.1}% of {:.1}k flash with {} free)\n",
            total_size,
            100.0 * total_size as f64 / flash_size as f64,
            flash_size as f64 / 1024.0,
            flash_size as i64 - total_size
        ));
        res.push_str(&self.stats);
        res.push_str("\n\n");

        for (i, ln) in self.lines.iter().enumerate() {
            let mut text = ln.text.clone();
            if clean {
                if ln.words.first().map(String::as_str) == Some("@stackempty")
                    && i > 0
                    && self.lines[i - 1].text == ln.text
                {
                    continue;
                }
                if let Some(pos) = text.find("; WAS:") {
                    text.truncate(pos);
                }
                if text.trim().is_empty() {
                    continue;
                }
            }
            res.push_str(&text);
            res.push('\n');
        }

        res
    }

    fn peep_hole(&mut self) {
        let my_indices: Vec<usize> = self
            .lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.kind != LineKind::Empty)
            .map(|(i, _)| i)
            .collect();

        for w in 0..my_indices.len() {
            let a = my_indices[w];
            // user-supplied assembly is left untouched
            if self.lines[a].scope.starts_with("user") {
                continue;
            }
            let Some(&b) = my_indices.get(w + 1) else {
                continue;
            };
            let c = my_indices.get(w + 2).copied();
            if self.lines[a].kind != LineKind::Instruction {
                continue;
            }

            let ei = self.ei;
            let (left, right) = self.lines.split_at_mut(b);
            let ln = &mut left[a];
            let (mid, rest) = right.split_at_mut(1);
            let next = &mut mid[0];
            let next2 = c.map(|ci| &mut rest[ci - b - 1]);
            ei.peephole(super::PeepWindow {
                ln,
                next,
                next2,
                counts: &mut self.peep,
            });
        }
    }

    fn clear_labels(&mut self) {
        self.labels.clear();
    }

    fn peep_pass(&mut self, really_final: bool) {
        if self.disable_peephole {
            return;
        }

        self.peep = PeepCounts::default();
        self.peep_hole();

        self.panic_on_error = true;
        self.final_emit = false;
        self.clear_labels();
        self.iter_lines();
        assert!(!self.check_stack || self.stack == 0);
        self.final_emit = true;
        self.really_final_emit = really_final || self.peep.ops == 0;
        self.iter_lines();

        self.stats.push_str(&format!(
            "; peep hole pass: {} instructions removed and {} updated\n",
            self.peep.del,
            self.peep.ops - self.peep.del
        ));
    }

    /// Label name → absolute address, for downstream debug info and the
    /// hex patcher.
    pub fn get_labels(&mut self) -> &HashMap<String, i64> {
        let base = self.base_offset;
        let labels = &self.labels;
        self.user_labels_cache.get_or_insert_with(|| {
            labels
                .iter()
                .map(|(k, &v)| (k.clone(), v as i64 + base))
                .collect()
        })
    }

    /// Run the full pass sequence over `text`.
    pub fn emit(&mut self, text: &str) {
        assert!(!self.started, "AsmFile::emit may only run once");
        self.started = true;

        self.prep_lines(text);

        if !self.errors.is_empty() {
            return;
        }

        self.clear_labels();
        self.iter_lines();

        if self.check_stack && self.stack != 0 {
            self.directive_error("stack misaligned at the end of the file");
        }

        if !self.errors.is_empty() {
            return;
        }

        let ei = self.ei;
        ei.expand_ldlit(self);
        self.clear_labels();
        self.iter_lines();

        self.final_emit = true;
        self.really_final_emit = self.disable_peephole;
        self.iter_lines();

        if !self.errors.is_empty() {
            return;
        }

        for _ in 0..MAX_PEEP_PASSES {
            self.peep_pass(false);
            if self.peep.ops == 0 {
                break;
            }
        }
    }
}

fn parse_label_def(w0: &str) -> Option<&str> {
    let head = w0.strip_suffix(':')?;
    if head.is_empty() {
        return None;
    }
    if head
        .bytes()
        .all(|b| b == b'.' || b == b'_' || b.is_ascii_alphanumeric())
    {
        Some(head)
    } else {
        None
    }
}

fn parse_signed_decimal(s: &str) -> Option<i64> {
    let body = s.strip_prefix(['+', '-']).unwrap_or(s);
    if body.is_empty() || !body.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<i64>().ok()
}

fn parse_hex_literal(s: &str) -> Option<i64> {
    let body = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    if body.is_empty() || !body.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    i64::from_str_radix(body, 16).ok()
}

fn split_stack_ref(s: &str) -> Option<(&str, i64)> {
    let (name, off) = s.split_once('@')?;
    if name.is_empty() || !name.bytes().all(|b| b == b'_' || b.is_ascii_alphanumeric()) {
        return None;
    }
    parse_signed_decimal(off).map(|n| (name, n))
}

fn extract_quoted(text: &str) -> Option<&str> {
    let start = text.find('"')?;
    let end = text.rfind('"')?;
    if end <= start {
        return None;
    }
    Some(&text[start + 1..end])
}

/// Unescape a C-style string literal body into bytes.
fn parse_string(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next()? {
            'n' => out.push(b'\n'),
            't' => out.push(b'\t'),
            'r' => out.push(b'\r'),
            '\\' => out.push(b'\\'),
            '"' => out.push(b'"'),
            '\'' => out.push(b'\''),
            '?' => out.push(b'?'),
            '0' | 'z' => out.push(0),
            'x' => {
                let hi = chars.next()?.to_digit(16)?;
                let lo = chars.next()?.to_digit(16)?;
                out.push(((hi << 4) | lo) as u8);
            }
            'u' => {
                let mut v: u32 = 0;
                for _ in 0..4 {
                    v = (v << 4) | chars.next()?.to_digit(16)?;
                }
                let ch = char::from_u32(v)?;
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
            _ => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_string_handles_escapes() {
        assert_eq!(parse_string("abc").unwrap(), b"abc");
        assert_eq!(parse_string("a\\nb").unwrap(), b"a\nb");
        assert_eq!(parse_string("\\x41\\0").unwrap(), &[0x41, 0][..]);
        assert!(parse_string("bad\\q").is_none());
    }

    #[test]
    fn label_defs_are_recognized() {
        assert_eq!(parse_label_def("loop:"), Some("loop"));
        assert_eq!(parse_label_def(".l1:"), Some(".l1"));
        assert_eq!(parse_label_def("loop"), None);
        assert_eq!(parse_label_def("a b:"), None);
    }

    #[test]
    fn stack_refs_are_recognized() {
        assert_eq!(split_stack_ref("locals@1"), Some(("locals", 1)));
        assert_eq!(split_stack_ref("base@-2"), Some(("base", -2)));
        assert_eq!(split_stack_ref("lbl@hi"), None);
    }
}

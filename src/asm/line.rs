// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Parsed assembly lines and the tokenizer feeding them.

use super::encoder::Instruction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Empty,
    Label,
    Directive,
    Instruction,
}

/// Counters for one peephole pass; `ops` also drives the fixpoint
/// termination test in the driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct PeepCounts {
    pub ops: u32,
    pub del: u32,
}

/// One line of assembly source. Mutated in place across passes: `update`
/// rewrites the line to a new rendering of the same logical instruction as
/// jump-distance estimates improve.
pub struct Line<'a> {
    pub text: String,
    pub kind: LineKind,
    pub line_no: u32,
    pub words: Vec<String>,
    pub scope: String,
    pub location: u32,
    pub instruction: Option<&'a Instruction>,
    pub num_args: Vec<i64>,
    pub opcode: u32,
    pub stack: i32,
}

impl<'a> Line<'a> {
    pub fn new(text: String) -> Self {
        Self {
            text,
            kind: LineKind::Empty,
            line_no: 0,
            words: Vec::new(),
            scope: String::new(),
            location: 0,
            instruction: None,
            num_args: Vec::new(),
            opcode: 0,
            stack: 0,
        }
    }

    /// Resolved pattern template, empty when the line has no instruction.
    pub fn op_ext(&self) -> &str {
        self.instruction.map(|i| i.code.as_str()).unwrap_or("")
    }

    /// Resolved mnemonic, empty when the line has no instruction.
    pub fn op(&self) -> &str {
        self.instruction.map(|i| i.name.as_str()).unwrap_or("")
    }

    /// Rewrite the line text, keeping the previous rendering as a
    /// `; WAS:` trail for the listing.
    pub fn update(&mut self, s: &str, counts: &mut PeepCounts) {
        counts.ops += 1;

        let s = s.trim_start();
        if s.is_empty() {
            counts.del += 1;
        }
        let mut text = String::from("    ");
        text.push_str(s);
        if !s.is_empty() {
            text.push_str("      ");
        }
        text.push_str("; WAS: ");
        text.push_str(self.text.trim());

        self.words = tokenize(&text).unwrap_or_default();
        self.text = text;
        self.instruction = None;
        self.num_args = Vec::new();
        if self.words.is_empty() {
            self.kind = LineKind::Empty;
        } else if self.words[0].starts_with('@') {
            self.kind = LineKind::Directive;
        }
    }
}

/// Split a source line into tokens. Brackets, braces, commas and `!` are
/// tokens of their own; `;` starts a comment running to end of line.
/// Returns `None` for a blank line.
pub fn tokenize(line: &str) -> Option<Vec<String>> {
    let mut words: Vec<String> = Vec::new();
    let mut w = String::new();
    for ch in line.chars() {
        match ch {
            '[' | ']' | '!' | '{' | '}' | ',' => {
                if !w.is_empty() {
                    words.push(std::mem::take(&mut w));
                }
                words.push(ch.to_string());
            }
            ' ' | '\t' | '\r' | '\n' => {
                if !w.is_empty() {
                    words.push(std::mem::take(&mut w));
                }
            }
            ';' => break,
            _ => w.push(ch),
        }
    }
    if !w.is_empty() {
        words.push(w);
    }
    if words.is_empty() {
        None
    } else {
        Some(words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_splits_punctuation() {
        assert_eq!(
            tokenize("ldr   r0, [sp, #4]").unwrap(),
            vec!["ldr", "r0", ",", "[", "sp", ",", "#4", "]"]
        );
        assert_eq!(
            tokenize("push {r0, lr}").unwrap(),
            vec!["push", "{", "r0", ",", "lr", "}"]
        );
    }

    #[test]
    fn tokenize_drops_comments_and_blank_lines() {
        assert_eq!(tokenize("  ; nothing here"), None);
        assert_eq!(tokenize("bx lr ; return").unwrap(), vec!["bx", "lr"]);
        assert_eq!(tokenize(""), None);
    }

    #[test]
    fn update_keeps_was_trail() {
        let mut counts = PeepCounts::default();
        let mut ln = Line::new("    bb .target".to_string());
        ln.words = tokenize(&ln.text).unwrap();
        ln.kind = LineKind::Instruction;
        ln.update("b .target", &mut counts);
        assert_eq!(counts.ops, 1);
        assert_eq!(counts.del, 0);
        assert!(ln.text.contains("; WAS: bb .target"));
        assert_eq!(ln.words, vec!["b", ".target"]);

        ln.update("", &mut counts);
        assert_eq!(counts.del, 1);
        assert_eq!(ln.kind, LineKind::Empty);
    }
}

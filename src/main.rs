// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

// CLI entrypoint for thumbforge.

use std::fs::OpenOptions;
use std::io::{self, Write};

use clap::Parser;
use serde_json::json;

use thumbforge::asm::cli::{run, validate_cli, Cli, DiagnosticsSinkConfig, OutputFormat};
use thumbforge::error::{Diagnostic, Severity};

struct DiagnosticsSink {
    writer: Option<Box<dyn Write>>,
}

impl DiagnosticsSink {
    fn from_config(config: &DiagnosticsSinkConfig) -> io::Result<Self> {
        match config {
            DiagnosticsSinkConfig::Disabled => Ok(Self { writer: None }),
            DiagnosticsSinkConfig::Stderr => Ok(Self {
                writer: Some(Box::new(io::stderr())),
            }),
            DiagnosticsSinkConfig::File { path, append } => {
                let mut opts = OpenOptions::new();
                opts.create(true).write(true);
                if *append {
                    opts.append(true);
                } else {
                    opts.truncate(true);
                }
                let file = opts.open(path)?;
                Ok(Self {
                    writer: Some(Box::new(file)),
                })
            }
        }
    }

    fn emit_line(&mut self, line: &str) {
        if let Some(writer) = &mut self.writer {
            let _ = writeln!(writer, "{line}");
        }
    }

    fn emit_diagnostics(
        &mut self,
        diagnostics: &[Diagnostic],
        source_lines: &[String],
        use_color: bool,
        format: OutputFormat,
    ) {
        for diag in diagnostics {
            self.emit_line(&format_diagnostic_line(
                diag,
                Some(source_lines),
                use_color,
                format,
            ));
        }
    }
}

fn severity_to_str(severity: Severity) -> &'static str {
    match severity {
        Severity::Warning => "warning",
        Severity::Error => "error",
    }
}

fn format_diagnostic_line(
    diag: &Diagnostic,
    source_lines: Option<&[String]>,
    use_color: bool,
    format: OutputFormat,
) -> String {
    if format == OutputFormat::Json {
        json!({
            "code": diag.code(),
            "severity": severity_to_str(diag.severity()),
            "message": diag.message(),
            "file": diag.file(),
            "line": diag.line(),
            "col_start": diag.column(),
            "notes": diag.notes(),
            "help": diag.help(),
        })
        .to_string()
    } else {
        diag.format_with_context(source_lines, use_color)
    }
}

fn with_fallback_file(diagnostics: Vec<Diagnostic>, fallback: Option<String>) -> Vec<Diagnostic> {
    diagnostics
        .into_iter()
        .map(|diag| {
            if diag.file().is_none() {
                diag.with_file(fallback.clone())
            } else {
                diag
            }
        })
        .collect()
}

fn main() {
    let cli = Cli::parse();
    let cli_config = match validate_cli(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    let mut sink = match DiagnosticsSink::from_config(&cli_config.diagnostics_sink) {
        Ok(sink) => sink,
        Err(err) => {
            eprintln!("Failed to open diagnostics sink: {err}");
            std::process::exit(1);
        }
    };

    let use_color = std::env::var("NO_COLOR").is_err();
    let fallback = Some(cli_config.input.to_string_lossy().to_string());
    match run(&cli_config) {
        Ok(report) => {
            if cli_config.quiet {
                return;
            }
            let diagnostics = with_fallback_file(report.diagnostics().to_vec(), fallback);
            sink.emit_diagnostics(
                &diagnostics,
                report.source_lines(),
                use_color,
                cli_config.output_format,
            );
        }
        Err(err) => {
            let diagnostics = with_fallback_file(err.diagnostics().to_vec(), fallback);
            sink.emit_diagnostics(
                &diagnostics,
                err.source_lines(),
                use_color,
                cli_config.output_format,
            );
            if cli_config.output_format != OutputFormat::Json
                && !matches!(cli_config.diagnostics_sink, DiagnosticsSinkConfig::Disabled)
            {
                sink.emit_line(&err.to_string());
            }
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thumbforge::error::{AsmError, AsmErrorKind};

    #[test]
    fn format_diagnostic_line_json_has_expected_keys_with_nulls() {
        let diag = Diagnostic::new(
            7,
            Severity::Error,
            AsmError::new(AsmErrorKind::Assembler, "boom", None),
        )
        .with_code("asm999");
        let line = format_diagnostic_line(&diag, None, false, OutputFormat::Json);
        let value: serde_json::Value = serde_json::from_str(&line).expect("valid json");
        assert_eq!(value["code"], "asm999");
        assert_eq!(value["severity"], "error");
        assert_eq!(value["message"], "boom");
        assert_eq!(value["line"], 7);
        assert!(value["file"].is_null());
        assert!(value["col_start"].is_null());
        assert!(value["notes"].is_array());
        assert!(value["help"].is_array());
    }
}

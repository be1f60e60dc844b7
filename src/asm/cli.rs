// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Command-line interface parsing, validation and the run pipeline.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgAction, Parser, ValueEnum};

use crate::asm::file::InlineError;
use crate::asm::AsmFile;
use crate::error::{
    AsmError, AsmErrorKind, AsmRunError, AsmRunReport, Diagnostic, Severity,
};
use crate::hexfile::HexTemplateContext;
use crate::thumb::ThumbProcessor;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const LONG_ABOUT: &str = "ARM Thumb assembler with Intel HEX template patching.

Outputs are opt-in: specify at least one of -l/--list, -x/--hex, or -b/--bin.
Output filenames may be omitted; the input base name is used with .lst, .hex
or .bin appended. -x requires --hex-template; the template provides the
addresses of runtime functions referenced by the source.";

#[derive(Parser, Debug)]
#[command(
    name = "thumbforge",
    version = VERSION,
    about = "ARM Thumb assembler and Intel HEX template patcher",
    long_about = LONG_ABOUT
)]
pub struct Cli {
    #[arg(value_name = "FILE", long_help = "Assembly source file.")]
    pub input: PathBuf,
    #[arg(
        long = "format",
        value_enum,
        default_value_t = OutputFormat::Text,
        long_help = "Select global CLI output format. text is default; json enables machine-readable diagnostics."
    )]
    pub format: OutputFormat,
    #[arg(
        short = 'q',
        long = "quiet",
        action = ArgAction::SetTrue,
        long_help = "Suppress diagnostic output for successful assembly runs."
    )]
    pub quiet: bool,
    #[arg(
        short = 'E',
        long = "error",
        value_name = "FILE",
        long_help = "Write diagnostics to FILE instead of stderr."
    )]
    pub error_file: Option<PathBuf>,
    #[arg(
        long = "error-append",
        action = ArgAction::SetTrue,
        requires = "error_file",
        long_help = "Append diagnostics to --error FILE instead of truncating it."
    )]
    pub error_append: bool,
    #[arg(
        long = "no-error",
        action = ArgAction::SetTrue,
        conflicts_with_all = ["error_file", "error_append"],
        long_help = "Disable all diagnostic output routing."
    )]
    pub no_error: bool,
    #[arg(
        short = 'l',
        long = "list",
        value_name = "FILE",
        num_args = 0..=1,
        default_missing_value = "",
        long_help = "Emit a listing file with rewrite trails cleaned and a size-statistics header. FILE is optional; when omitted, the input base is used and a .lst extension is added."
    )]
    pub list_name: Option<String>,
    #[arg(
        short = 'x',
        long = "hex",
        value_name = "FILE",
        num_args = 0..=1,
        default_missing_value = "",
        requires = "hex_template",
        long_help = "Emit an Intel HEX file by patching the code into --hex-template. FILE is optional; when omitted, the input base is used and a .hex extension is added."
    )]
    pub hex_name: Option<String>,
    #[arg(
        short = 'b',
        long = "bin",
        value_name = "FILE",
        num_args = 0..=1,
        default_missing_value = "",
        long_help = "Emit the raw code bytes, little-endian halfwords. FILE is optional; when omitted, the input base is used and a .bin extension is added."
    )]
    pub bin_name: Option<String>,
    #[arg(
        long = "hex-template",
        value_name = "FILE",
        long_help = "Device template in Intel HEX format: the runtime image with a reserved bytecode region and an embedded function table."
    )]
    pub hex_template: Option<PathBuf>,
    #[arg(
        long = "template-sha",
        value_name = "SHA",
        default_value = "",
        long_help = "Template identity hash; its first 16 hex digits are embedded in the patched output header."
    )]
    pub template_sha: String,
    #[arg(
        long = "functions",
        value_name = "FILE",
        requires = "hex_template",
        long_help = "Runtime function names, one per line in template table order. Referenced names resolve to addresses from the template."
    )]
    pub functions: Option<PathBuf>,
    #[arg(
        long = "short-form",
        action = ArgAction::SetTrue,
        long_help = "Emit only the patched code region instead of the whole template."
    )]
    pub short_form: bool,
    #[arg(
        short = 'g',
        long = "globals",
        value_name = "N",
        default_value_t = 0,
        long_help = "Number of global variable slots recorded in the bytecode header."
    )]
    pub globals: i64,
    #[arg(
        long = "arm",
        action = ArgAction::SetTrue,
        long_help = "Target a native ARM runtime; function pointers keep even addresses instead of the Thumb bit."
    )]
    pub runtime_is_arm: bool,
    #[arg(
        long = "flash-size",
        value_name = "BYTES",
        default_value_t = 0,
        long_help = "Flash size used by the listing statistics header. 0 selects the 128k default."
    )]
    pub flash_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticsSinkConfig {
    Stderr,
    File { path: PathBuf, append: bool },
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct CliConfig {
    pub input: PathBuf,
    pub list_path: Option<PathBuf>,
    pub hex_path: Option<PathBuf>,
    pub bin_path: Option<PathBuf>,
    pub hex_template: Option<PathBuf>,
    pub template_sha: String,
    pub functions: Option<PathBuf>,
    pub short_form: bool,
    pub globals: i64,
    pub runtime_is_arm: bool,
    pub flash_size: u32,
    pub quiet: bool,
    pub output_format: OutputFormat,
    pub diagnostics_sink: DiagnosticsSinkConfig,
}

fn cli_error(msg: &str) -> AsmRunError {
    AsmRunError::new(
        AsmError::new(AsmErrorKind::Cli, msg, None),
        Vec::new(),
        Vec::new(),
    )
}

fn resolve_output(name: &Option<String>, input: &Path, ext: &str) -> Option<PathBuf> {
    match name.as_deref() {
        None => None,
        Some("") => Some(input.with_extension(ext)),
        Some(n) => Some(PathBuf::from(n)),
    }
}

pub fn validate_cli(cli: &Cli) -> Result<CliConfig, AsmRunError> {
    if cli.list_name.is_none() && cli.hex_name.is_none() && cli.bin_name.is_none() {
        return Err(cli_error("No outputs requested; use -l, -x or -b"));
    }

    if cli.hex_name.is_some() && cli.hex_template.is_none() {
        return Err(cli_error("-x/--hex requires --hex-template"));
    }

    let diagnostics_sink = if cli.no_error {
        DiagnosticsSinkConfig::Disabled
    } else if let Some(path) = &cli.error_file {
        DiagnosticsSinkConfig::File {
            path: path.clone(),
            append: cli.error_append,
        }
    } else {
        DiagnosticsSinkConfig::Stderr
    };

    Ok(CliConfig {
        input: cli.input.clone(),
        list_path: resolve_output(&cli.list_name, &cli.input, "lst"),
        hex_path: resolve_output(&cli.hex_name, &cli.input, "hex"),
        bin_path: resolve_output(&cli.bin_name, &cli.input, "bin"),
        hex_template: cli.hex_template.clone(),
        template_sha: cli.template_sha.clone(),
        functions: cli.functions.clone(),
        short_form: cli.short_form,
        globals: cli.globals,
        runtime_is_arm: cli.runtime_is_arm,
        flash_size: cli.flash_size,
        quiet: cli.quiet,
        output_format: cli.format,
        diagnostics_sink,
    })
}

fn inline_error_diag(e: &InlineError) -> Diagnostic {
    let err = AsmError::new(AsmErrorKind::Assembler, &e.coremsg, None);
    let mut d = Diagnostic::new(e.line_no, Severity::Error, err).with_source(Some(e.line.clone()));
    for hint in e.hints.lines() {
        let hint = hint.trim();
        if !hint.is_empty() {
            d = d.with_note(hint);
        }
    }
    d
}

fn io_error(
    what: &str,
    err: &std::io::Error,
    source_lines: &Arc<Vec<String>>,
) -> AsmRunError {
    AsmRunError::new(
        AsmError::new(AsmErrorKind::Io, what, Some(&err.to_string())),
        Vec::new(),
        source_lines.clone(),
    )
}

/// Assemble the input and write the requested artifacts.
pub fn run(config: &CliConfig) -> Result<AsmRunReport, AsmRunError> {
    let empty: Arc<Vec<String>> = Arc::new(Vec::new());

    let text = fs::read_to_string(&config.input)
        .map_err(|e| io_error(&format!("cannot read {}", config.input.display()), &e, &empty))?;
    let source_lines: Arc<Vec<String>> = Arc::new(text.lines().map(str::to_string).collect());

    let template = match &config.hex_template {
        Some(path) => {
            let t = fs::read_to_string(path)
                .map_err(|e| io_error(&format!("cannot read {}", path.display()), &e, &source_lines))?;
            let lines: Vec<String> = t.lines().map(str::to_string).collect();
            let names: Vec<String> = match &config.functions {
                Some(fp) => fs::read_to_string(fp)
                    .map_err(|e| io_error(&format!("cannot read {}", fp.display()), &e, &source_lines))?
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string)
                    .collect(),
                None => Vec::new(),
            };
            let ctx = HexTemplateContext::setup_for(&lines, &config.template_sha, &names)
                .map_err(|e| AsmRunError::new(e, Vec::new(), source_lines.clone()))?;
            Some(ctx)
        }
        None => None,
    };

    let ei = ThumbProcessor::new(config.runtime_is_arm);
    let mut f = AsmFile::new(&ei);
    if let Some(ctx) = &template {
        f.lookup_external_label = Some(Box::new(move |name| ctx.lookup_function_addr(name)));
    }
    f.emit(&text);

    if !f.errors.is_empty() {
        let diagnostics: Vec<Diagnostic> = f.errors.iter().map(inline_error_diag).collect();
        let first = AsmError::new(AsmErrorKind::Assembler, &f.errors[0].message, None);
        return Err(AsmRunError::new(first, diagnostics, source_lines));
    }

    if let Some(path) = &config.list_path {
        let listing = f.get_source(true, 1, config.flash_size);
        fs::write(path, listing)
            .map_err(|e| io_error(&format!("cannot write {}", path.display()), &e, &source_lines))?;
    }

    if let Some(path) = &config.bin_path {
        let mut bytes = Vec::with_capacity(f.buf.len() * 2);
        for w in &f.buf {
            bytes.push((w & 0xff) as u8);
            bytes.push((w >> 8) as u8);
        }
        fs::write(path, bytes)
            .map_err(|e| io_error(&format!("cannot write {}", path.display()), &e, &source_lines))?;
    }

    if let Some(path) = &config.hex_path {
        if let Some(ctx) = &template {
            let mut out = ctx
                .patch_hex(config.globals, &f.buf, config.short_form)
                .join("\n");
            out.push('\n');
            fs::write(path, out)
                .map_err(|e| io_error(&format!("cannot write {}", path.display()), &e, &source_lines))?;
        }
    }

    Ok(AsmRunReport::new(Vec::new(), source_lines))
}

/// Validate and run in one step, as the binary entrypoint does.
pub fn run_with_cli(cli: &Cli) -> Result<AsmRunReport, AsmRunError> {
    let config = validate_cli(cli)?;
    run(&config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn create_temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("thumbforge-{tag}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_file(path: &PathBuf, content: &str) {
        fs::write(path, content).unwrap();
    }

    #[test]
    fn validate_cli_requires_an_output() {
        let cli = Cli::parse_from(["thumbforge", "prog.asm"]);
        let err = validate_cli(&cli).unwrap_err();
        assert!(err.to_string().contains("No outputs requested"));
    }

    #[test]
    fn validate_cli_resolves_default_output_names() {
        let cli = Cli::parse_from(["thumbforge", "prog.asm", "-l", "-b"]);
        let config = validate_cli(&cli).unwrap();
        assert_eq!(config.list_path, Some(PathBuf::from("prog.lst")));
        assert_eq!(config.bin_path, Some(PathBuf::from("prog.bin")));
        assert_eq!(config.hex_path, None);
        assert_eq!(config.diagnostics_sink, DiagnosticsSinkConfig::Stderr);
    }

    #[test]
    fn validate_cli_routes_diagnostics_to_file() {
        let cli = Cli::parse_from([
            "thumbforge", "prog.asm", "-l", "-E", "diag.txt", "--error-append",
        ]);
        let config = validate_cli(&cli).unwrap();
        assert_eq!(
            config.diagnostics_sink,
            DiagnosticsSinkConfig::File {
                path: PathBuf::from("diag.txt"),
                append: true
            }
        );
    }

    #[test]
    fn run_writes_listing_and_bin() {
        let dir = create_temp_dir("run-ok");
        let input = dir.join("ok.asm");
        let list = dir.join("ok.lst");
        let bin = dir.join("ok.bin");
        write_file(&input, "    movs r0, #1\n    bx lr\n");

        let cli = Cli::parse_from([
            "thumbforge",
            input.to_string_lossy().as_ref(),
            "-l",
            list.to_string_lossy().as_ref(),
            "-b",
            bin.to_string_lossy().as_ref(),
        ]);
        run_with_cli(&cli).expect("assembly should succeed");

        let listing = fs::read_to_string(&list).unwrap();
        assert!(listing.contains("; generated code sizes"));
        assert!(listing.contains("movs r0, #1"));

        let bytes = fs::read(&bin).unwrap();
        assert_eq!(bytes, vec![0x01, 0x20, 0x70, 0x47]);
    }

    #[test]
    fn run_reports_assembly_errors_as_diagnostics() {
        let dir = create_temp_dir("run-err");
        let input = dir.join("bad.asm");
        let list = dir.join("bad.lst");
        write_file(&input, "    bl .nowhere\n");

        let cli = Cli::parse_from([
            "thumbforge",
            input.to_string_lossy().as_ref(),
            "-l",
            list.to_string_lossy().as_ref(),
        ]);
        let err = match run_with_cli(&cli) {
            Ok(_) => panic!("assembly should fail for an unknown label"),
            Err(err) => err,
        };
        assert!(!err.diagnostics().is_empty());
        assert!(err.to_string().contains("unknown label"));
        assert!(!list.exists(), "listing must not be written on failure");
    }
}

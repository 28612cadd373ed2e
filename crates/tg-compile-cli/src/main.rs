//! tg-compile - compile a model with tinygrad, falling back to CPU on failure
//!
//! Three invocation forms are accepted:
//!
//! - `tg-compile BACKEND_FLAGS ONNX_PATH OUTPUT_PATH COMPILER_ROOT`
//! - `tg-compile COMPILER_ROOT ONNX_PATH OUTPUT_PATH` (flags from the environment)
//! - `tg-compile --tinygrad-dir DIR --onnx PATH --out PATH [--flags ..] [--cpu-flags ..]`
//!
//! Exit status is 0 on success (primary or fallback), otherwise the exit
//! code of the last attempt; 2 on usage errors, 127 when the compiler
//! cannot be launched.

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, Level};

use tg_compile_core::request::DEFAULT_INTERPRETER;
use tg_compile_core::{
    init_tracing, AttemptOutcome, AttemptReport, BaseEnvironment, CompileRequest, CompileResult,
    CompilerConfig, EnvironmentOverlay, FallbackCompiler, FallbackPolicy, TokioProcessRunner,
    DEFAULT_FALLBACK_FLAGS,
};

#[derive(Parser, Debug)]
#[command(name = "tg-compile")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Compile an ONNX model with tinygrad, retrying on CPU if the backend fails",
    long_about = None
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// tinygrad checkout containing examples/openpilot/compile3.py
    #[arg(long, value_name = "DIR")]
    tinygrad_dir: Option<PathBuf>,

    /// Model to compile
    #[arg(long, value_name = "PATH")]
    onnx: Option<PathBuf>,

    /// Compiled output path
    #[arg(long, value_name = "PATH")]
    out: Option<PathBuf>,

    /// Backend flags for the primary attempt, e.g. "GPU=1 BEAM=2"
    #[arg(long, value_name = "FLAGS")]
    flags: Option<String>,

    /// Backend flags for the fallback attempt
    #[arg(long, value_name = "FLAGS", default_value = DEFAULT_FALLBACK_FLAGS)]
    cpu_flags: String,

    /// Interpreter used to run the compile script
    #[arg(long, env = "TG_COMPILE_PYTHON", default_value = DEFAULT_INTERPRETER)]
    python: String,

    /// Kill an attempt after this many seconds (0 = no limit)
    #[arg(long, env = "TG_COMPILE_TIMEOUT_SECS", default_value_t = 0)]
    timeout_secs: u64,

    /// Do not retry when the primary flags already select CPU
    #[arg(long)]
    skip_fallback_when_cpu: bool,

    /// Stream compiler output instead of capturing it
    #[arg(long)]
    no_capture: bool,

    /// Write the compile result as JSON to this path
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// BACKEND_FLAGS ONNX_PATH OUTPUT_PATH COMPILER_ROOT, or COMPILER_ROOT ONNX_PATH OUTPUT_PATH
    #[arg(value_name = "ARGS")]
    positional: Vec<String>,
}

/// Where the primary backend flags came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagSource {
    Argument,
    Environment,
}

/// Inputs resolved from whichever form was used.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Resolved {
    compiler_root: PathBuf,
    onnx: PathBuf,
    out: PathBuf,
    flags: String,
    flag_source: FlagSource,
}

impl Cli {
    /// Resolve the three invocation forms into one set of inputs.
    fn resolve(&self) -> std::result::Result<Resolved, (ErrorKind, String)> {
        let named = self.tinygrad_dir.is_some() || self.onnx.is_some() || self.out.is_some();

        if named {
            if !self.positional.is_empty() {
                return Err((
                    ErrorKind::ArgumentConflict,
                    "positional arguments cannot be combined with --tinygrad-dir/--onnx/--out"
                        .to_string(),
                ));
            }
            let (Some(root), Some(onnx), Some(out)) = (&self.tinygrad_dir, &self.onnx, &self.out)
            else {
                return Err((
                    ErrorKind::MissingRequiredArgument,
                    "--tinygrad-dir, --onnx and --out are all required".to_string(),
                ));
            };
            return Ok(Resolved {
                compiler_root: root.clone(),
                onnx: onnx.clone(),
                out: out.clone(),
                flags: self.flags.clone().unwrap_or_default(),
                flag_source: FlagSource::Argument,
            });
        }

        if self.flags.is_some() {
            return Err((
                ErrorKind::ArgumentConflict,
                "--flags requires --tinygrad-dir, --onnx and --out".to_string(),
            ));
        }

        match self.positional.as_slice() {
            [flags, onnx, out, root] => Ok(Resolved {
                compiler_root: PathBuf::from(root),
                onnx: PathBuf::from(onnx),
                out: PathBuf::from(out),
                flags: flags.clone(),
                flag_source: FlagSource::Argument,
            }),
            [root, onnx, out] => Ok(Resolved {
                compiler_root: PathBuf::from(root),
                onnx: PathBuf::from(onnx),
                out: PathBuf::from(out),
                flags: String::new(),
                flag_source: FlagSource::Environment,
            }),
            _ => Err((
                ErrorKind::WrongNumberOfValues,
                format!(
                    "expected BACKEND_FLAGS ONNX_PATH OUTPUT_PATH COMPILER_ROOT or \
                     COMPILER_ROOT ONNX_PATH OUTPUT_PATH, got {} argument(s)",
                    self.positional.len()
                ),
            )),
        }
    }

    fn compiler_config(&self) -> CompilerConfig {
        CompilerConfig {
            interpreter: self.python.clone(),
            timeout_secs: self.timeout_secs,
            capture_output: !self.no_capture,
            fallback_policy: if self.skip_fallback_when_cpu {
                FallbackPolicy::SkipWhenCpu
            } else {
                FallbackPolicy::Always
            },
            ..CompilerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let resolved = match cli.resolve() {
        Ok(resolved) => resolved,
        Err((kind, message)) => Cli::command().error(kind, message).exit(),
    };

    match cmd_compile(&cli, resolved).await {
        Ok(code) => ExitCode::from(exit_status(code)),
        Err(e) => {
            eprintln!("[tg-fallback] error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn cmd_compile(cli: &Cli, resolved: Resolved) -> Result<i32> {
    if resolved.flag_source == FlagSource::Environment {
        debug!("Backend flags taken from the process environment");
    }

    let request = CompileRequest::new(
        resolved.compiler_root,
        resolved.onnx,
        resolved.out,
        EnvironmentOverlay::parse(&resolved.flags),
    )
    .with_fallback_overlay(EnvironmentOverlay::parse(&cli.cpu_flags));

    let compiler = FallbackCompiler::new(
        Arc::new(TokioProcessRunner::new()),
        BaseEnvironment::capture(),
        cli.compiler_config(),
    );

    let result = compiler.compile(&request).await;
    print_diagnostics(&result);

    if let Some(path) = &cli.report {
        write_report(path, &result)?;
    }

    Ok(result.exit_code)
}

/// Write per-attempt failure diagnostics to stderr.
fn print_diagnostics(result: &CompileResult) {
    for report in result.attempts.iter().filter(|r| !r.outcome.success()) {
        eprintln!(
            "[tg-fallback] {} compile failed with flags '{}': {}",
            report.attempt.name(),
            report.overlay,
            describe(report)
        );
        if let Some(stdout) = report.stdout.as_deref().filter(|s| !s.is_empty()) {
            eprint!("{}", stdout);
        }
        if let Some(stderr) = report.stderr.as_deref().filter(|s| !s.is_empty()) {
            eprint!("{}", stderr);
        }
    }

    if result.fallback_skipped {
        eprintln!("[tg-fallback] Primary flags already select CPU, not retrying.");
    } else if result.attempts.len() > 1 {
        if result.success() {
            eprintln!("[tg-fallback] CPU fallback succeeded.");
        } else {
            eprintln!(
                "[tg-fallback] CPU fallback also failed (rc={}).",
                result.exit_code
            );
        }
    }
}

fn describe(report: &AttemptReport) -> String {
    match &report.outcome {
        AttemptOutcome::Exited { exit_code } => format!("exit code {}", exit_code),
        AttemptOutcome::LaunchFailed { reason, .. } => format!("could not launch: {}", reason),
        AttemptOutcome::TimedOut { limit_secs, .. } => {
            format!("timed out after {}s", limit_secs)
        }
    }
}

fn write_report(path: &Path, result: &CompileResult) -> Result<()> {
    let json = serde_json::to_string_pretty(result).context("Failed to serialize compile result")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write report to {}", path.display()))?;
    Ok(())
}

/// Map an attempt exit code onto a process exit status, never turning a
/// failure into 0.
fn exit_status(code: i32) -> u8 {
    match u8::try_from(code) {
        Ok(status) => status,
        Err(_) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("tg-compile").chain(args.iter().copied()))
            .expect("parse failed")
    }

    #[test]
    fn test_form_a() {
        let resolved = parse(&["GPU=1 BEAM=2", "model.onnx", "model.pkl", "/x/tg"])
            .resolve()
            .expect("resolve");
        assert_eq!(resolved.flags, "GPU=1 BEAM=2");
        assert_eq!(resolved.compiler_root, PathBuf::from("/x/tg"));
        assert_eq!(resolved.onnx, PathBuf::from("model.onnx"));
        assert_eq!(resolved.out, PathBuf::from("model.pkl"));
        assert_eq!(resolved.flag_source, FlagSource::Argument);
    }

    #[test]
    fn test_form_b() {
        let resolved = parse(&["/x/tg", "model.onnx", "model.pkl"])
            .resolve()
            .expect("resolve");
        assert_eq!(resolved.compiler_root, PathBuf::from("/x/tg"));
        assert!(resolved.flags.is_empty());
        assert_eq!(resolved.flag_source, FlagSource::Environment);
    }

    #[test]
    fn test_form_c() {
        let cli = parse(&[
            "--tinygrad-dir",
            "/x/tg",
            "--onnx",
            "model.onnx",
            "--out",
            "model.pkl",
            "--flags",
            "QCOM=1",
            "--cpu-flags",
            "CPU=1 JIT=1",
        ]);
        let resolved = cli.resolve().expect("resolve");
        assert_eq!(resolved.flags, "QCOM=1");
        assert_eq!(cli.cpu_flags, "CPU=1 JIT=1");
    }

    #[test]
    fn test_form_c_defaults() {
        let cli = parse(&["--tinygrad-dir", "/x/tg", "--onnx", "m.onnx", "--out", "m.pkl"]);
        let resolved = cli.resolve().expect("resolve");
        assert!(resolved.flags.is_empty());
        assert_eq!(cli.cpu_flags, DEFAULT_FALLBACK_FLAGS);
    }

    #[test]
    fn test_form_c_missing_argument() {
        let err = parse(&["--tinygrad-dir", "/x/tg", "--onnx", "m.onnx"])
            .resolve()
            .unwrap_err();
        assert_eq!(err.0, ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_mixed_forms_rejected() {
        let err = parse(&["--tinygrad-dir", "/x/tg", "m.onnx"])
            .resolve()
            .unwrap_err();
        assert_eq!(err.0, ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_wrong_positional_count() {
        let err = parse(&["a", "b"]).resolve().unwrap_err();
        assert_eq!(err.0, ErrorKind::WrongNumberOfValues);
    }

    #[test]
    fn test_compiler_config() {
        let cli = parse(&[
            "--skip-fallback-when-cpu",
            "--no-capture",
            "--timeout-secs",
            "30",
            "--python",
            "python3.12",
            "/x/tg",
            "a",
            "b",
        ]);
        let config = cli.compiler_config();
        assert_eq!(config.fallback_policy, FallbackPolicy::SkipWhenCpu);
        assert!(!config.capture_output);
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.interpreter, "python3.12");
    }

    #[test]
    fn test_exit_status() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(127), 127);
        assert_eq!(exit_status(-1), 1);
        assert_eq!(exit_status(256), 1);
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }
}

//! Compile request and compiler configuration.

use crate::overlay::{is_truthy, EnvironmentOverlay};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Entry point script, relative to the compiler root.
pub const DEFAULT_ENTRY_POINT: &str = "examples/openpilot/compile3.py";

/// Interpreter used to run the entry point.
pub const DEFAULT_INTERPRETER: &str = "python3";

/// Whether a failed primary attempt is retried when it already ran on CPU.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Always retry with the fallback overlay.
    #[default]
    Always,

    /// Propagate the primary failure when the primary flags request CPU.
    SkipWhenCpu,
}

/// One compilation to perform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompileRequest {
    /// Directory containing the compiler sources and entry point.
    pub compiler_root: PathBuf,

    /// Model to compile, passed through verbatim.
    pub input_artifact: PathBuf,

    /// Where the compiler writes its output, passed through verbatim.
    pub output_artifact: PathBuf,

    /// Caller-supplied backend flags.
    pub primary_overlay: EnvironmentOverlay,

    /// Flags for the retry.
    pub fallback_overlay: EnvironmentOverlay,
}

impl CompileRequest {
    /// Create a request using the CPU fallback overlay.
    pub fn new(
        compiler_root: impl Into<PathBuf>,
        input_artifact: impl Into<PathBuf>,
        output_artifact: impl Into<PathBuf>,
        primary_overlay: EnvironmentOverlay,
    ) -> Self {
        Self {
            compiler_root: compiler_root.into(),
            input_artifact: input_artifact.into(),
            output_artifact: output_artifact.into(),
            primary_overlay,
            fallback_overlay: EnvironmentOverlay::cpu_fallback(),
        }
    }

    /// Replace the fallback overlay.
    pub fn with_fallback_overlay(mut self, overlay: EnvironmentOverlay) -> Self {
        self.fallback_overlay = overlay;
        self
    }

    /// Whether the primary attempt already targets CPU.
    ///
    /// The overlay decides when it sets `CPU`; otherwise the inherited
    /// value from `base_cpu` does.
    pub fn primary_requests_cpu(&self, base_cpu: Option<&str>) -> bool {
        self.primary_overlay
            .get("CPU")
            .or(base_cpu)
            .map(is_truthy)
            .unwrap_or(false)
    }
}

/// How the compiler subprocess is launched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompilerConfig {
    /// Interpreter program (looked up on `PATH`).
    pub interpreter: String,

    /// Entry point path relative to the compiler root.
    pub entry_point: PathBuf,

    /// Per-attempt timeout in seconds (0 = wait forever).
    pub timeout_secs: u64,

    /// Capture stdout/stderr instead of inheriting them.
    pub capture_output: bool,

    /// Retry behaviour after a failed primary attempt.
    pub fallback_policy: FallbackPolicy,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            interpreter: DEFAULT_INTERPRETER.to_string(),
            entry_point: PathBuf::from(DEFAULT_ENTRY_POINT),
            timeout_secs: 0,
            capture_output: true,
            fallback_policy: FallbackPolicy::Always,
        }
    }
}

impl CompilerConfig {
    /// Absolute location of the entry point under `compiler_root`.
    pub fn entry_point_in(&self, compiler_root: &Path) -> PathBuf {
        compiler_root.join(&self.entry_point)
    }
}

//! Subprocess execution for compile attempts.
//!
//! [`ProcessRunner`] is the seam between the fallback logic and the OS.
//! [`TokioProcessRunner`] spawns real processes; tests substitute
//! [`crate::fakes::ScriptedRunner`].

use crate::environment::EnvVars;
use crate::error::LaunchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

/// A fully assembled command: `program entry_point args...` under `env`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Interpreter or executable.
    pub program: String,

    /// Script run by `program`; must exist for the launch to succeed.
    pub entry_point: PathBuf,

    /// Positional arguments after the entry point.
    pub args: Vec<OsString>,

    /// Complete child environment. Nothing else is inherited.
    pub env: EnvVars,

    /// Timeout in seconds (0 = none).
    pub timeout_secs: u64,

    /// Pipe stdout/stderr back instead of inheriting them.
    pub capture_output: bool,
}

impl Invocation {
    /// Render as a shell-like command line for diagnostics.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.clone(), self.entry_point.display().to_string()];
        parts.extend(self.args.iter().map(|arg| arg.to_string_lossy().into_owned()));
        parts.join(" ")
    }
}

/// Result of a process that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutput {
    /// Exit code (-1 when terminated by a signal).
    pub exit_code: i32,

    /// Captured stdout, if capturing.
    pub stdout: Option<String>,

    /// Captured stderr, if capturing.
    pub stderr: Option<String>,

    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl ProcessOutput {
    /// Whether the process exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes an [`Invocation`] and waits for it to finish.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run to completion. `Err` means no exit status was obtained.
    async fn run(&self, invocation: &Invocation) -> Result<ProcessOutput, LaunchError>;
}

/// Runs invocations as real child processes via `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<ProcessOutput, LaunchError> {
        if !invocation.entry_point.is_file() {
            return Err(LaunchError::EntryPointNotFound {
                path: invocation.entry_point.clone(),
            });
        }

        let start = Instant::now();
        let (stdout, stderr) = if invocation.capture_output {
            (Stdio::piped(), Stdio::piped())
        } else {
            (Stdio::inherit(), Stdio::inherit())
        };

        debug!(command = %invocation.command_line(), "Spawning compiler");

        // The child is killed if the wait below is abandoned (timeout).
        let child = Command::new(&invocation.program)
            .arg(&invocation.entry_point)
            .args(&invocation.args)
            .env_clear()
            .envs(invocation.env.iter())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        let wait = child.wait_with_output();
        let waited = if invocation.timeout_secs > 0 {
            tokio::time::timeout(Duration::from_secs(invocation.timeout_secs), wait)
                .await
                .map_err(|_| LaunchError::Timeout {
                    limit_secs: invocation.timeout_secs,
                })?
        } else {
            wait.await
        };
        let output = waited.map_err(|source| LaunchError::Wait {
            program: invocation.program.clone(),
            source,
        })?;

        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = output.status.code().unwrap_or(-1);
        let (stdout, stderr) = if invocation.capture_output {
            (
                Some(String::from_utf8_lossy(&output.stdout).to_string()),
                Some(String::from_utf8_lossy(&output.stderr).to_string()),
            )
        } else {
            (None, None)
        };

        Ok(ProcessOutput {
            exit_code,
            stdout,
            stderr,
            duration_ms,
        })
    }
}

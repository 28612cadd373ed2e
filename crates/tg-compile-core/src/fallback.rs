//! Compile-with-fallback orchestration.
//!
//! A compile runs the entry point once with the caller's backend flags. If
//! that attempt does not exit 0 it is retried exactly once with the
//! fallback overlay, in an environment scrubbed of accelerator keys. The
//! result always reports which attempt produced the final status.

use crate::environment::{BaseEnvironment, EnvVars};
use crate::error::LaunchError;
use crate::overlay::EnvironmentOverlay;
use crate::request::{CompileRequest, CompilerConfig, FallbackPolicy};
use crate::runner::{Invocation, ProcessRunner};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Which attempt produced a status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Attempt {
    Primary,
    Fallback,
}

impl Attempt {
    pub fn name(&self) -> &'static str {
        match self {
            Attempt::Primary => "primary",
            Attempt::Fallback => "fallback",
        }
    }
}

/// How a single attempt ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The compiler ran and exited.
    Exited { exit_code: i32 },

    /// The entry point could not be launched.
    LaunchFailed { exit_code: i32, reason: String },

    /// The compiler was killed after exceeding its timeout.
    TimedOut { exit_code: i32, limit_secs: u64 },
}

impl AttemptOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            AttemptOutcome::Exited { exit_code }
            | AttemptOutcome::LaunchFailed { exit_code, .. }
            | AttemptOutcome::TimedOut { exit_code, .. } => *exit_code,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, AttemptOutcome::Exited { exit_code: 0 })
    }
}

/// Record of one attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptReport {
    pub attempt: Attempt,

    /// Backend flags the attempt ran with.
    pub overlay: EnvironmentOverlay,

    /// Command line, for diagnostics.
    pub command: String,

    pub outcome: AttemptOutcome,

    pub stdout: Option<String>,
    pub stderr: Option<String>,

    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Final result of a compile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompileResult {
    /// Correlates log lines and reports of one compile.
    pub invocation_id: Uuid,

    /// Exit code of the attempt that decided the result.
    pub exit_code: i32,

    /// The attempt that decided the result.
    pub attempt: Attempt,

    /// How that attempt ended.
    pub outcome: AttemptOutcome,

    /// Captured output of that attempt.
    pub stdout: Option<String>,
    pub stderr: Option<String>,

    /// Set when the primary failed but the policy declined to retry.
    pub fallback_skipped: bool,

    /// Every attempt, in order.
    pub attempts: Vec<AttemptReport>,
}

impl CompileResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Whether the deciding attempt failed to launch at all.
    pub fn launch_failed(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::LaunchFailed { .. })
    }

    /// Build a result decided by `deciding`, which is recorded after `earlier`.
    fn decided_by(
        invocation_id: Uuid,
        deciding: AttemptReport,
        earlier: Vec<AttemptReport>,
        skipped: bool,
    ) -> Self {
        let mut attempts = earlier;
        attempts.push(deciding.clone());
        CompileResult {
            invocation_id,
            exit_code: deciding.outcome.exit_code(),
            attempt: deciding.attempt,
            outcome: deciding.outcome,
            stdout: deciding.stdout,
            stderr: deciding.stderr,
            fallback_skipped: skipped,
            attempts,
        }
    }
}

/// Runs compile requests with a single CPU fallback retry.
pub struct FallbackCompiler {
    runner: Arc<dyn ProcessRunner>,
    base: BaseEnvironment,
    config: CompilerConfig,
}

impl FallbackCompiler {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        base: BaseEnvironment,
        config: CompilerConfig,
    ) -> Self {
        Self {
            runner,
            base,
            config,
        }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Compile `request`, retrying once with the fallback overlay on failure.
    ///
    /// Never fails: launch errors and timeouts are reported in the result.
    pub async fn compile(&self, request: &CompileRequest) -> CompileResult {
        let invocation_id = Uuid::new_v4();

        info!(
            invocation_id = %invocation_id,
            flags = %request.primary_overlay,
            input = %request.input_artifact.display(),
            output = %request.output_artifact.display(),
            "Compiling model"
        );

        let primary_env = self
            .base
            .primary_env(&request.compiler_root, &request.primary_overlay);
        let primary = self
            .run_attempt(Attempt::Primary, request, &request.primary_overlay, primary_env)
            .await;

        if primary.outcome.success() {
            info!(invocation_id = %invocation_id, "Compile succeeded");
            return CompileResult::decided_by(invocation_id, primary, Vec::new(), false);
        }

        if self.config.fallback_policy == FallbackPolicy::SkipWhenCpu
            && request.primary_requests_cpu(self.base.get("CPU"))
        {
            warn!(
                invocation_id = %invocation_id,
                flags = %request.primary_overlay,
                exit_code = primary.outcome.exit_code(),
                "Primary compile already targeted CPU, not retrying"
            );
            return CompileResult::decided_by(invocation_id, primary, Vec::new(), true);
        }

        warn!(
            invocation_id = %invocation_id,
            flags = %request.primary_overlay,
            fallback_flags = %request.fallback_overlay,
            exit_code = primary.outcome.exit_code(),
            "Primary compile failed, falling back to CPU"
        );

        let fallback_env = self
            .base
            .fallback_env(&request.compiler_root, &request.fallback_overlay);
        let fallback = self
            .run_attempt(Attempt::Fallback, request, &request.fallback_overlay, fallback_env)
            .await;

        if fallback.outcome.success() {
            info!(invocation_id = %invocation_id, "CPU fallback succeeded");
        } else {
            warn!(
                invocation_id = %invocation_id,
                exit_code = fallback.outcome.exit_code(),
                "CPU fallback also failed"
            );
        }

        CompileResult::decided_by(invocation_id, fallback, vec![primary], false)
    }

    fn invocation(&self, request: &CompileRequest, env: EnvVars) -> Invocation {
        Invocation {
            program: self.config.interpreter.clone(),
            entry_point: self.config.entry_point_in(&request.compiler_root),
            args: vec![
                request.input_artifact.clone().into_os_string(),
                request.output_artifact.clone().into_os_string(),
            ],
            env,
            timeout_secs: self.config.timeout_secs,
            capture_output: self.config.capture_output,
        }
    }

    async fn run_attempt(
        &self,
        attempt: Attempt,
        request: &CompileRequest,
        overlay: &EnvironmentOverlay,
        env: EnvVars,
    ) -> AttemptReport {
        let invocation = self.invocation(request, env);
        let command = invocation.command_line();
        let started_at = Utc::now();
        let start = Instant::now();

        info!(attempt = attempt.name(), command = %command, flags = %overlay, "Executing compiler");

        let (outcome, stdout, stderr, duration_ms) = match self.runner.run(&invocation).await {
            Ok(output) => (
                AttemptOutcome::Exited {
                    exit_code: output.exit_code,
                },
                output.stdout,
                output.stderr,
                output.duration_ms,
            ),
            Err(err) => {
                warn!(attempt = attempt.name(), error = %err, "Compiler could not be run");
                let exit_code = err.exit_code();
                let outcome = match err {
                    LaunchError::Timeout { limit_secs } => {
                        AttemptOutcome::TimedOut {
                            exit_code,
                            limit_secs,
                        }
                    }
                    other => AttemptOutcome::LaunchFailed {
                        exit_code,
                        reason: other.to_string(),
                    },
                };
                (outcome, None, None, start.elapsed().as_millis() as u64)
            }
        };

        AttemptReport {
            attempt,
            overlay: overlay.clone(),
            command,
            outcome,
            stdout,
            stderr,
            started_at,
            duration_ms,
        }
    }
}

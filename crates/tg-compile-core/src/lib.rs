//! tg-compile core - compile-with-fallback for external model compilers
//!
//! Provides an orchestrator that:
//! - Runs an external compile entry point with backend flags as env vars
//! - Retries once on a fixed CPU-only overlay when the primary attempt fails
//! - Reports which attempt produced the final status and why

pub mod environment;
pub mod error;
pub mod fakes;
pub mod fallback;
pub mod overlay;
pub mod request;
pub mod runner;
pub mod telemetry;

// Re-export key types
pub use environment::{BaseEnvironment, EnvVars, ACCELERATOR_KEYS, MODULE_SEARCH_PATH_VAR};
pub use error::{LaunchError, LAUNCH_FAILURE_EXIT_CODE, TIMEOUT_EXIT_CODE};
pub use fallback::{Attempt, AttemptOutcome, AttemptReport, CompileResult, FallbackCompiler};
pub use overlay::{EnvironmentOverlay, FlagParseWarning, DEFAULT_FALLBACK_FLAGS};
pub use request::{CompileRequest, CompilerConfig, FallbackPolicy, DEFAULT_ENTRY_POINT};
pub use runner::{Invocation, ProcessOutput, ProcessRunner, TokioProcessRunner};
pub use telemetry::init_tracing;

/// tg-compile version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Error types for launching the compiler subprocess.

use std::path::PathBuf;

/// Exit code reported when the entry point cannot be launched.
pub const LAUNCH_FAILURE_EXIT_CODE: i32 = 127;

/// Exit code reported when an attempt exceeds its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Reasons a compile attempt never produced an exit status of its own.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("compile entry point not found: {}", path.display())]
    EntryPointNotFound { path: PathBuf },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting on {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("compile timed out after {limit_secs} seconds")]
    Timeout { limit_secs: u64 },
}

impl LaunchError {
    /// Exit code the attempt is reported with.
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchError::Timeout { .. } => TIMEOUT_EXIT_CODE,
            _ => LAUNCH_FAILURE_EXIT_CODE,
        }
    }
}

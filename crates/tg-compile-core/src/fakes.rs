//! In-memory fakes for the process runner (testing only)
//!
//! `ScriptedRunner` replays a queue of canned outcomes and records every
//! invocation it receives, so the fallback logic can be exercised without
//! spawning processes.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::LaunchError;
use crate::runner::{Invocation, ProcessOutput, ProcessRunner};

/// A canned outcome for one call to [`ScriptedRunner::run`].
#[derive(Debug)]
pub enum ScriptedOutcome {
    /// The process exits with this code.
    Exit(i32),
    /// The process exits with this code and output.
    ExitWithOutput {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    /// The process could not be launched.
    Launch(LaunchError),
}

/// Fake runner returning scripted outcomes in order.
///
/// Once the script is exhausted every further call exits with 0.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    outcomes: Mutex<VecDeque<ScriptedOutcome>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new(outcomes: impl IntoIterator<Item = ScriptedOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Runner whose calls exit with the given codes, in order.
    pub fn with_exit_codes(codes: impl IntoIterator<Item = i32>) -> Self {
        Self::new(codes.into_iter().map(ScriptedOutcome::Exit))
    }

    /// Every invocation received so far.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> Result<ProcessOutput, LaunchError> {
        self.calls.lock().unwrap().push(invocation.clone());
        let next = self.outcomes.lock().unwrap().pop_front();

        match next.unwrap_or(ScriptedOutcome::Exit(0)) {
            ScriptedOutcome::Exit(exit_code) => Ok(ProcessOutput {
                exit_code,
                stdout: invocation.capture_output.then(String::new),
                stderr: invocation.capture_output.then(String::new),
                duration_ms: 0,
            }),
            ScriptedOutcome::ExitWithOutput {
                exit_code,
                stdout,
                stderr,
            } => Ok(ProcessOutput {
                exit_code,
                stdout: Some(stdout),
                stderr: Some(stderr),
                duration_ms: 0,
            }),
            ScriptedOutcome::Launch(err) => Err(err),
        }
    }
}

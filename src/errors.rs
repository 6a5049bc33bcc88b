// src/errors.rs

//! Crate-wide error types.
//!
//! Task-local failures never surface here: they are captured as
//! [`crate::model::TaskOutcome`] values and the run continues. Everything in
//! this enum is run-local and short-circuits to the run controller.

use std::path::PathBuf;

pub use anyhow::{Context, Result};

/// Exit code of a fully successful run.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for one or more failed tasks.
pub const EXIT_TASK_FAILURES: i32 = 1;
/// Exit code for fatal errors before any work begins.
pub const EXIT_FATAL: i32 = 2;
/// Reserved exit code for exclusive-mode timeout.
pub const EXIT_EXCLUSIVE_TIMEOUT: i32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum RushtiError {
    #[error("parse error in {path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("duplicate task id '{0}'")]
    DuplicateId(String),

    #[error("task '{task}' references unknown predecessor '{predecessor}'")]
    MissingPredecessor { task: String, predecessor: String },

    #[error("circular dependency detected involving task '{0}'")]
    Cycle(String),

    #[error("failed to expand '{expression}' on instance '{instance}': {message}")]
    Expansion {
        instance: String,
        expression: String,
        message: String,
    },

    #[error("timeout ({timeout_sec}s) exceeded waiting for exclusive access; blocking sessions: {blocking}")]
    ExclusiveLockTimeout { timeout_sec: u64, blocking: String },

    #[error("checkpoint does not match task file '{path}' (content changed since snapshot)")]
    CheckpointMismatch { path: PathBuf },

    #[error("cannot resume: task(s) were running without safe_retry: {tasks}")]
    UnsafeResume { tasks: String },

    #[error("no checkpoint found for workflow '{0}'")]
    CheckpointNotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("stats store error: {0}")]
    Stats(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RushtiError {
    /// Process exit code for a fatal run-local error.
    pub fn exit_code(&self) -> i32 {
        match self {
            RushtiError::ExclusiveLockTimeout { .. } => EXIT_EXCLUSIVE_TIMEOUT,
            _ => EXIT_FATAL,
        }
    }
}

// src/remote/mod.rs

//! The narrow capability the core consumes from the remote server.
//!
//! Everything protocol-specific (HTTP, auth, status-code mapping) lives in
//! the client adapter behind [`RemoteClient`]; the core only distinguishes
//! transient failures (retryable) from fatal ones.

pub mod pool;
pub mod sim;

use async_trait::async_trait;

use crate::model::Parameters;

pub use pool::ClientPool;

/// Failure mode of a remote call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    /// Connection reset, 5xx, HTTP-layer timeout. Retried with backoff.
    #[error("transient remote error: {0}")]
    Transient(String),
    /// Anything the adapter maps as non-retryable.
    #[error("remote error: {0}")]
    Fatal(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// How the remote process finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Completed without errors.
    Success,
    /// Completed, but the remote flagged minor errors.
    MinorErrors,
    /// The remote reports a logical failure; not retried.
    Failed,
}

/// Result of a completed remote invocation.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: ProcessStatus,
    /// Server-side error log reference, when the remote produced one.
    pub error_log: Option<String>,
}

/// One session observed in the remote server's session registry.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub context_tag: String,
    pub user: Option<String>,
}

/// Outcome of probing a process for existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Exists,
    NotFound,
}

/// The remote server capability.
///
/// `session_tag` identifies the invocation in the server's session registry;
/// the same tag is accepted by `cancel_invocation` to abort it mid-flight.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn execute_process(
        &self,
        process: &str,
        parameters: &Parameters,
        session_tag: &str,
        timeout: Option<std::time::Duration>,
    ) -> Result<ExecutionResult, RemoteError>;

    async fn cancel_invocation(&self, invocation_id: &str) -> Result<(), RemoteError>;

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, RemoteError>;

    async fn end_session(&self, session_id: &str) -> Result<(), RemoteError>;

    /// Evaluate a member-set expression, returning member names.
    async fn expand_members(&self, expression: &str) -> Result<Vec<String>, RemoteError>;

    async fn probe_process(&self, process: &str) -> Result<ProbeResult, RemoteError>;
}

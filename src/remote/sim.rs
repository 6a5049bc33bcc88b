// src/remote/sim.rs

//! Simulated remote server.
//!
//! Backs the `--simulate` dry-run mode and the integration tests: processes
//! "run" by sleeping for `pWaitSec` seconds (scaled by `time_scale`), the
//! session registry is shared across all clients created from one
//! [`SimulatedServer`], and failure behaviour is scripted per process name.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::model::Parameters;
use crate::remote::{
    ExecutionResult, ProbeResult, ProcessStatus, RemoteClient, RemoteError, SessionInfo,
};

/// Parameter that drives the simulated duration, in seconds.
pub const WAIT_PARAM: &str = "pWaitSec";

#[derive(Default)]
struct SharedState {
    /// Open sessions across every instance of this server.
    sessions: Vec<SessionInfo>,
    /// Member sets for `expand_members`, keyed by expression.
    members: HashMap<String, Vec<String>>,
    /// Processes that report a logical failure.
    failing: HashSet<String>,
    /// Processes that complete with minor errors.
    minor_errors: HashSet<String>,
    /// Processes that do not exist (probe + execute fail).
    missing: HashSet<String>,
    /// Remaining transient failures per process before it succeeds.
    transient: HashMap<String, u32>,
    /// Invocation ids passed to `cancel_invocation`.
    cancelled: Vec<String>,
    /// Every invocation observed, in arrival order.
    executed: Vec<ExecutedCall>,
}

/// One observed invocation, recorded for assertions.
#[derive(Debug, Clone)]
pub struct ExecutedCall {
    pub process: String,
    pub parameters: Parameters,
    pub session_tag: String,
}

/// Shared simulated backend; hand out one [`SimulatedClient`] per instance.
#[derive(Clone)]
pub struct SimulatedServer {
    state: Arc<Mutex<SharedState>>,
    session_counter: Arc<AtomicU64>,
    /// Multiplier applied to `pWaitSec` (1.0 = real seconds).
    time_scale: f64,
}

impl Default for SimulatedServer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedServer {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            session_counter: Arc::new(AtomicU64::new(0)),
            time_scale: 1.0,
        }
    }

    /// Scale simulated durations (e.g. 0.001 to run `pWaitSec` in millis).
    pub fn with_time_scale(mut self, scale: f64) -> Self {
        self.time_scale = scale;
        self
    }

    pub fn client(&self) -> Arc<SimulatedClient> {
        Arc::new(SimulatedClient {
            server: self.clone(),
        })
    }

    pub fn set_members(&self, expression: &str, members: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state.members.insert(
            expression.to_string(),
            members.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn fail_process(&self, process: &str) {
        self.state.lock().unwrap().failing.insert(process.to_string());
    }

    pub fn minor_errors_process(&self, process: &str) {
        self.state
            .lock()
            .unwrap()
            .minor_errors
            .insert(process.to_string());
    }

    pub fn missing_process(&self, process: &str) {
        self.state.lock().unwrap().missing.insert(process.to_string());
    }

    /// The next `count` invocations of `process` fail transiently.
    pub fn transient_failures(&self, process: &str, count: u32) {
        self.state
            .lock()
            .unwrap()
            .transient
            .insert(process.to_string(), count);
    }

    pub fn cancelled_invocations(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn executed_calls(&self) -> Vec<ExecutedCall> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn open_sessions(&self) -> Vec<SessionInfo> {
        self.state.lock().unwrap().sessions.clone()
    }
}

/// Client view of a [`SimulatedServer`] for one instance.
pub struct SimulatedClient {
    server: SimulatedServer,
}

/// Removes the session from the registry when the invocation ends, including
/// when the calling future is dropped at a timeout.
struct SessionGuard {
    state: Arc<Mutex<SharedState>>,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.sessions.retain(|s| s.id != self.session_id);
    }
}

#[async_trait]
impl RemoteClient for SimulatedClient {
    async fn execute_process(
        &self,
        process: &str,
        parameters: &Parameters,
        session_tag: &str,
        _timeout: Option<Duration>,
    ) -> Result<ExecutionResult, RemoteError> {
        let session_id = format!(
            "sim-{}",
            self.server.session_counter.fetch_add(1, Ordering::Relaxed)
        );

        let wait = {
            let mut state = self.server.state.lock().unwrap();

            state.executed.push(ExecutedCall {
                process: process.to_string(),
                parameters: parameters.clone(),
                session_tag: session_tag.to_string(),
            });

            if state.missing.contains(process) {
                return Err(RemoteError::Fatal(format!("process '{process}' not found")));
            }

            if let Some(remaining) = state.transient.get_mut(process) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(RemoteError::Transient(format!(
                        "simulated transient failure for '{process}'"
                    )));
                }
            }

            state.sessions.push(SessionInfo {
                id: session_id.clone(),
                context_tag: session_tag.to_string(),
                user: None,
            });

            parameters
                .get(WAIT_PARAM)
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0)
        };

        let _guard = SessionGuard {
            state: Arc::clone(&self.server.state),
            session_id,
        };

        if wait > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(wait * self.server.time_scale)).await;
        }

        let state = self.server.state.lock().unwrap();
        if state.failing.contains(process) {
            return Ok(ExecutionResult {
                status: ProcessStatus::Failed,
                error_log: Some(format!("{process}.error.log")),
            });
        }
        if state.minor_errors.contains(process) {
            return Ok(ExecutionResult {
                status: ProcessStatus::MinorErrors,
                error_log: Some(format!("{process}.minor.log")),
            });
        }
        Ok(ExecutionResult {
            status: ProcessStatus::Success,
            error_log: None,
        })
    }

    async fn cancel_invocation(&self, invocation_id: &str) -> Result<(), RemoteError> {
        let mut state = self.server.state.lock().unwrap();
        state.cancelled.push(invocation_id.to_string());
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, RemoteError> {
        Ok(self.server.state.lock().unwrap().sessions.clone())
    }

    async fn end_session(&self, session_id: &str) -> Result<(), RemoteError> {
        let mut state = self.server.state.lock().unwrap();
        state.sessions.retain(|s| s.id != session_id);
        Ok(())
    }

    async fn expand_members(&self, expression: &str) -> Result<Vec<String>, RemoteError> {
        let state = self.server.state.lock().unwrap();
        state
            .members
            .get(expression)
            .cloned()
            .ok_or_else(|| RemoteError::Fatal(format!("unknown member expression '{expression}'")))
    }

    async fn probe_process(&self, process: &str) -> Result<ProbeResult, RemoteError> {
        let state = self.server.state.lock().unwrap();
        if state.missing.contains(process) {
            Ok(ProbeResult::NotFound)
        } else {
            Ok(ProbeResult::Exists)
        }
    }
}

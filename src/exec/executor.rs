// src/exec/executor.rs

//! Remote invocation of a single task.
//!
//! One `execute` call owns the task's full attempt loop: transient remote
//! failures retry with exponential backoff (1s doubling, capped at 16s),
//! logical failures and minor-error signals never retry, and an armed
//! deadline decides the outcome regardless of remote state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::model::{ErrorKind, Task, TaskOutcome, TaskStatus};
use crate::remote::{ClientPool, ExecutionResult, ProcessStatus, RemoteClient, RemoteError};

const BACKOFF_BASE_SECS: u64 = 1;
const BACKOFF_CAP_SECS: u64 = 16;

/// Backoff before retry attempt `attempt` (1-based): 1, 2, 4, … capped at 16s.
fn backoff_delay(attempt: u32) -> Duration {
    let secs = BACKOFF_BASE_SECS << (attempt - 1).min(4);
    Duration::from_secs(secs.min(BACKOFF_CAP_SECS))
}

pub struct Executor {
    pool: Arc<ClientPool>,
    retries: u32,
    /// Session context tag of this run; attempt-specific invocation ids are
    /// derived from it so the reserved prefix stays visible in the remote
    /// session registry.
    session_tag: String,
}

impl Executor {
    pub fn new(pool: Arc<ClientPool>, retries: u32, session_tag: impl Into<String>) -> Self {
        Self {
            pool,
            retries,
            session_tag: session_tag.into(),
        }
    }

    /// Run the task to a terminal outcome. `abort` flipping to `true`
    /// cancels the in-flight invocation remotely and yields `CANCELLED`.
    pub async fn execute(&self, task: &Task, mut abort: watch::Receiver<bool>) -> TaskOutcome {
        let start = Utc::now();
        let mut attempts: u32 = 0;

        // The deadline arms once, when execution begins: retries and their
        // backoffs all count against it.
        let deadline = task
            .timeout_sec
            .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));

        loop {
            if *abort.borrow() {
                return TaskOutcome {
                    status: TaskStatus::Cancelled,
                    start,
                    finish: Utc::now(),
                    attempts,
                    error_kind: Some(ErrorKind::Cancelled),
                    error_message: Some("run aborted".to_string()),
                };
            }

            // The deadline may also expire during a retry backoff, with no
            // invocation outstanding to cancel.
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    let status = if task.cancel_at_timeout {
                        TaskStatus::Cancelled
                    } else {
                        TaskStatus::Failed
                    };
                    return TaskOutcome {
                        status,
                        start,
                        finish: Utc::now(),
                        attempts,
                        error_kind: Some(ErrorKind::Timeout),
                        error_message: Some(format!(
                            "deadline of {}s exceeded during retry backoff",
                            task.timeout_sec.unwrap_or(0)
                        )),
                    };
                }
            }

            attempts += 1;
            let invocation = format!("{}:{}:{}", self.session_tag, task.id, attempts);

            let Some(pooled) = self.pool.acquire(&task.instance).await else {
                error!(task = %task.id, instance = %task.instance, "instance not registered");
                return TaskOutcome {
                    status: TaskStatus::Failed,
                    start,
                    finish: Utc::now(),
                    attempts,
                    error_kind: Some(ErrorKind::RemoteFailure),
                    error_message: Some(format!(
                        "instance '{}' is not configured",
                        task.instance
                    )),
                };
            };

            info!(
                task = %task.id,
                instance = %task.instance,
                process = %task.process,
                attempt = attempts,
                "executing remote process"
            );

            let timeout = task.timeout_sec.map(Duration::from_secs);
            let call = pooled
                .client()
                .execute_process(&task.process, &task.parameters, &invocation, timeout);

            let result = tokio::select! {
                biased;
                changed = abort.changed() => {
                    // A closed channel means the run is over; treat as abort.
                    let _ = changed;
                    self.cancel(&task.instance, &invocation).await;
                    warn!(task = %task.id, "aborted; remote cancel issued");
                    return TaskOutcome {
                        status: TaskStatus::Cancelled,
                        start,
                        finish: Utc::now(),
                        attempts,
                        error_kind: Some(ErrorKind::Cancelled),
                        error_message: Some("run aborted".to_string()),
                    };
                }
                outcome = run_until(deadline, call) => outcome,
            };

            // Release the instance permit before any backoff sleep.
            drop(pooled);

            match result {
                // Deadline expired while the invocation was outstanding.
                None => {
                    let finish = Utc::now();
                    return if task.cancel_at_timeout {
                        self.cancel(&task.instance, &invocation).await;
                        warn!(task = %task.id, timeout = ?timeout, "timeout; invocation cancelled");
                        TaskOutcome {
                            status: TaskStatus::Cancelled,
                            start,
                            finish,
                            attempts,
                            error_kind: Some(ErrorKind::Timeout),
                            error_message: Some(format!(
                                "deadline of {}s exceeded; remote invocation cancelled",
                                task.timeout_sec.unwrap_or(0)
                            )),
                        }
                    } else {
                        warn!(task = %task.id, timeout = ?timeout, "timeout; detached from invocation");
                        TaskOutcome {
                            status: TaskStatus::Failed,
                            start,
                            finish,
                            attempts,
                            error_kind: Some(ErrorKind::Timeout),
                            error_message: Some(format!(
                                "deadline of {}s exceeded",
                                task.timeout_sec.unwrap_or(0)
                            )),
                        }
                    };
                }
                Some(Ok(result)) => {
                    return self.settle(task, result, start, attempts);
                }
                Some(Err(err)) if err.is_transient() && attempts <= self.retries => {
                    let delay = backoff_delay(attempts);
                    warn!(
                        task = %task.id,
                        attempt = attempts,
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "transient remote failure; backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                Some(Err(err)) => {
                    let escalated = err.is_transient();
                    error!(task = %task.id, attempts, error = %err, "remote invocation failed");
                    return TaskOutcome {
                        status: TaskStatus::Failed,
                        start,
                        finish: Utc::now(),
                        attempts,
                        error_kind: Some(ErrorKind::RemoteFailure),
                        error_message: Some(if escalated {
                            format!("retries exhausted: {err}")
                        } else {
                            err.to_string()
                        }),
                    };
                }
            }
        }
    }

    /// Map a completed invocation to a terminal outcome.
    fn settle(
        &self,
        task: &Task,
        result: ExecutionResult,
        start: chrono::DateTime<Utc>,
        attempts: u32,
    ) -> TaskOutcome {
        let finish = Utc::now();
        match result.status {
            ProcessStatus::Success => {
                info!(task = %task.id, attempts, "process completed");
                TaskOutcome {
                    status: TaskStatus::Succeeded,
                    start,
                    finish,
                    attempts,
                    error_kind: None,
                    error_message: None,
                }
            }
            ProcessStatus::MinorErrors if task.succeed_on_minor_errors => {
                warn!(
                    task = %task.id,
                    error_log = result.error_log.as_deref().unwrap_or(""),
                    "process completed with minor errors; treated as success"
                );
                TaskOutcome {
                    status: TaskStatus::Succeeded,
                    start,
                    finish,
                    attempts,
                    error_kind: None,
                    error_message: result.error_log.map(|log| format!("minor errors, see {log}")),
                }
            }
            ProcessStatus::MinorErrors => {
                error!(task = %task.id, "process completed with minor errors");
                TaskOutcome {
                    status: TaskStatus::Failed,
                    start,
                    finish,
                    attempts,
                    error_kind: Some(ErrorKind::MinorErrors),
                    error_message: result.error_log.map(|log| format!("minor errors, see {log}")),
                }
            }
            ProcessStatus::Failed => {
                error!(
                    task = %task.id,
                    error_log = result.error_log.as_deref().unwrap_or(""),
                    "process reported failure"
                );
                TaskOutcome {
                    status: TaskStatus::Failed,
                    start,
                    finish,
                    attempts,
                    error_kind: Some(ErrorKind::RemoteFailure),
                    error_message: result.error_log.map(|log| format!("see {log}")),
                }
            }
        }
    }

    async fn cancel(&self, instance: &str, invocation: &str) {
        if let Some(client) = self.pool.client_for(instance) {
            if let Err(e) = client.cancel_invocation(invocation).await {
                warn!(invocation = %invocation, error = %e, "remote cancel failed");
            } else {
                debug!(invocation = %invocation, "remote cancel issued");
            }
        }
    }
}

/// Run the call under the task deadline; `None` means the deadline expired.
async fn run_until<F>(
    deadline: Option<tokio::time::Instant>,
    call: F,
) -> Option<Result<ExecutionResult, RemoteError>>
where
    F: std::future::Future<Output = Result<ExecutionResult, RemoteError>>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, call).await.ok(),
        None => Some(call.await),
    }
}

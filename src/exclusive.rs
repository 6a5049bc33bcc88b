// src/exclusive.rs

//! Cluster-wide mutual exclusion over the remote session registry.
//!
//! Every run opens its remote sessions with a reserved context tag:
//! `RUSHTI_<workflow>` for a normal run, `RUSHTIX_<workflow>` for an
//! exclusive one. Before starting, a run scans the session registry of
//! every instance it touches and waits until no blocking session remains.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::errors::RushtiError;
use crate::remote::{ClientPool, RemoteClient};

pub const CONTEXT_PREFIX: &str = "RUSHTI_";
pub const EXCLUSIVE_PREFIX: &str = "RUSHTIX_";

/// Remote servers cap the context field length.
const CONTEXT_MAX_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub polling_interval_sec: u64,
    pub timeout_sec: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            polling_interval_sec: 30,
            timeout_sec: 600,
        }
    }
}

/// Build the session context tag for a run.
pub fn build_context_tag(workflow: &str, exclusive: bool) -> String {
    let prefix = if exclusive {
        EXCLUSIVE_PREFIX
    } else {
        CONTEXT_PREFIX
    };
    let mut tag = format!("{prefix}{workflow}");
    if tag.len() > CONTEXT_MAX_LEN {
        warn!(tag = %tag, max = CONTEXT_MAX_LEN, "session context tag truncated");
        tag.truncate(CONTEXT_MAX_LEN);
    }
    tag
}

/// Parse a session context tag. Returns `(is_exclusive, workflow)` when the
/// tag carries one of the reserved prefixes.
pub fn parse_context_tag(tag: &str) -> Option<(bool, &str)> {
    if let Some(workflow) = tag.strip_prefix(EXCLUSIVE_PREFIX) {
        Some((true, workflow))
    } else {
        tag.strip_prefix(CONTEXT_PREFIX).map(|workflow| (false, workflow))
    }
}

/// One observed blocking session.
#[derive(Debug, Clone)]
pub struct BlockingSession {
    pub instance: String,
    pub tag: String,
    pub is_exclusive: bool,
}

impl std::fmt::Display for BlockingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mode = if self.is_exclusive { "exclusive" } else { "normal" };
        write!(f, "{} ({mode}) on {}", self.tag, self.instance)
    }
}

/// Scan the given instances for sessions that block this run.
///
/// A run never blocks on its own sessions: tags equal to `own_tag` or
/// derived from it (attempt-specific invocation ids) are excluded.
async fn blocking_sessions(
    pool: &ClientPool,
    instances: &[String],
    exclusive: bool,
    own_tag: &str,
) -> Vec<BlockingSession> {
    let mut blocking = Vec::new();

    for instance in instances {
        let Some(client) = pool.client_for(instance) else {
            continue;
        };
        let sessions = match client.list_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(instance = %instance, error = %e, "session registry scan failed");
                continue;
            }
        };

        for session in sessions {
            let tag = session.context_tag;
            if tag == own_tag || tag.strip_prefix(own_tag).is_some_and(|rest| rest.starts_with(':'))
            {
                continue;
            }
            let Some((is_exclusive, _)) = parse_context_tag(&tag) else {
                continue;
            };
            // An exclusive run yields to any qualifying session; a normal
            // run only to exclusive ones.
            if exclusive || is_exclusive {
                blocking.push(BlockingSession {
                    instance: instance.clone(),
                    tag,
                    is_exclusive,
                });
            }
        }
    }

    blocking
}

/// Wait until no qualifying session remains on any of the run's instances.
///
/// Re-probes every `polling_interval_sec`; gives up with
/// [`RushtiError::ExclusiveLockTimeout`] after `timeout_sec`. With `force`
/// the check is bypassed with a warning.
pub async fn wait_for_exclusive_access(
    pool: &ClientPool,
    instances: &[String],
    exclusive: bool,
    own_tag: &str,
    settings: &LockSettings,
    force: bool,
) -> Result<(), RushtiError> {
    let mode = if exclusive { "exclusive" } else { "normal" };
    debug!(mode, own_tag, "checking session registry for blocking runs");

    let mut blocking = blocking_sessions(pool, instances, exclusive, own_tag).await;
    if blocking.is_empty() {
        info!(mode, "no blocking sessions; proceeding");
        return Ok(());
    }

    if force {
        warn!(
            blocking = %describe(&blocking),
            "force set; bypassing exclusive-mode check"
        );
        return Ok(());
    }

    info!(
        blocking = %describe(&blocking),
        interval = settings.polling_interval_sec,
        timeout = settings.timeout_sec,
        "waiting for exclusive access"
    );

    let mut elapsed = 0u64;
    while elapsed < settings.timeout_sec {
        tokio::time::sleep(Duration::from_secs(settings.polling_interval_sec)).await;
        elapsed += settings.polling_interval_sec;

        blocking = blocking_sessions(pool, instances, exclusive, own_tag).await;
        if blocking.is_empty() {
            info!(waited_sec = elapsed, "exclusive access granted");
            return Ok(());
        }
        info!(
            waited_sec = elapsed,
            timeout_sec = settings.timeout_sec,
            blocking = %describe(&blocking),
            "still waiting for exclusive access"
        );
    }

    Err(RushtiError::ExclusiveLockTimeout {
        timeout_sec: settings.timeout_sec,
        blocking: describe(&blocking),
    })
}

fn describe(blocking: &[BlockingSession]) -> String {
    blocking
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::sim::SimulatedServer;

    #[test]
    fn tag_construction_and_parsing() {
        assert_eq!(build_context_tag("daily", false), "RUSHTI_daily");
        assert_eq!(build_context_tag("daily", true), "RUSHTIX_daily");
        assert_eq!(parse_context_tag("RUSHTI_daily"), Some((false, "daily")));
        assert_eq!(parse_context_tag("RUSHTIX_daily"), Some((true, "daily")));
        assert_eq!(parse_context_tag("SOMETHING_ELSE"), None);
    }

    #[test]
    fn overlong_tag_is_truncated() {
        let tag = build_context_tag(&"x".repeat(100), false);
        assert_eq!(tag.len(), 64);
        assert!(tag.starts_with("RUSHTI_"));
    }

    async fn blocked(
        server: &SimulatedServer,
        exclusive: bool,
        own_tag: &str,
    ) -> Vec<BlockingSession> {
        let mut pool = ClientPool::new();
        pool.register("prod", server.client(), 2);
        blocking_sessions(&pool, &["prod".to_string()], exclusive, own_tag).await
    }

    fn open_session(server: &SimulatedServer, tag: &str) {
        // Long-running invocation keeps a session in the registry.
        let client = server.client();
        let tag = tag.to_string();
        tokio::spawn(async move {
            let mut params = crate::model::Parameters::default();
            params.push("pWaitSec", "3600");
            let _ = client
                .execute_process("p", &params, &tag, None)
                .await;
        });
    }

    #[tokio::test(start_paused = true)]
    async fn exclusive_run_blocks_on_any_tagged_session() {
        let server = SimulatedServer::new();
        open_session(&server, "RUSHTI_other:1:1");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let blocking = blocked(&server, true, "RUSHTIX_mine").await;
        assert_eq!(blocking.len(), 1);
        assert!(!blocking[0].is_exclusive);
    }

    #[tokio::test(start_paused = true)]
    async fn normal_run_only_blocks_on_exclusive_sessions() {
        let server = SimulatedServer::new();
        open_session(&server, "RUSHTI_other:1:1");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(blocked(&server, false, "RUSHTI_mine").await.is_empty());

        open_session(&server, "RUSHTIX_big:1:1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        let blocking = blocked(&server, false, "RUSHTI_mine").await;
        assert_eq!(blocking.len(), 1);
        assert!(blocking[0].is_exclusive);
    }

    #[tokio::test(start_paused = true)]
    async fn own_sessions_are_ignored() {
        let server = SimulatedServer::new();
        open_session(&server, "RUSHTIX_mine:task1:1");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(blocked(&server, true, "RUSHTIX_mine").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_with_lock_error() {
        let server = SimulatedServer::new();
        open_session(&server, "RUSHTIX_other:1:1");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut pool = ClientPool::new();
        pool.register("prod", server.client(), 2);

        let err = wait_for_exclusive_access(
            &pool,
            &["prod".to_string()],
            false,
            "RUSHTI_mine",
            &LockSettings {
                polling_interval_sec: 1,
                timeout_sec: 3,
            },
            false,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RushtiError::ExclusiveLockTimeout { .. }));
        assert_eq!(err.exit_code(), crate::errors::EXIT_EXCLUSIVE_TIMEOUT);
    }
}

// src/remote/pool.rs

//! Per-instance connection discipline.
//!
//! Each instance gets a semaphore with `max_workers` permits; an executor
//! acquires a permit before a remote call and releases it on return, so
//! demand above the cap blocks instead of piling invocations onto one
//! server. The client handle itself belongs to the adapter; the pool only
//! bounds concurrent invocations per instance.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::remote::RemoteClient;

struct InstanceSlot {
    client: Arc<dyn RemoteClient>,
    permits: Arc<Semaphore>,
}

/// Registry of remote clients keyed by instance name.
#[derive(Default)]
pub struct ClientPool {
    slots: HashMap<String, InstanceSlot>,
}

/// A checked-out client; the instance permit is held until drop.
pub struct PooledClient {
    client: Arc<dyn RemoteClient>,
    _permit: OwnedSemaphorePermit,
}

impl PooledClient {
    pub fn client(&self) -> &Arc<dyn RemoteClient> {
        &self.client
    }
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the client for an instance with `max_workers` permits.
    pub fn register(
        &mut self,
        instance: impl Into<String>,
        client: Arc<dyn RemoteClient>,
        max_workers: usize,
    ) {
        self.slots.insert(
            instance.into(),
            InstanceSlot {
                client,
                permits: Arc::new(Semaphore::new(max_workers.max(1))),
            },
        );
    }

    pub fn contains(&self, instance: &str) -> bool {
        self.slots.contains_key(instance)
    }

    pub fn instances(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(|s| s.as_str())
    }

    /// Direct handle for non-invocation calls (session scans, probes,
    /// member expansion).
    pub fn client_for(&self, instance: &str) -> Option<&Arc<dyn RemoteClient>> {
        self.slots.get(instance).map(|s| &s.client)
    }

    /// Acquire a client for one invocation; waits while the instance is at
    /// its concurrency cap. Returns `None` for an unregistered instance.
    pub async fn acquire(&self, instance: &str) -> Option<PooledClient> {
        let slot = self.slots.get(instance)?;
        let permits = Arc::clone(&slot.permits);
        // The semaphore is never closed, so acquire cannot fail.
        let permit = permits.acquire_owned().await.ok()?;
        Some(PooledClient {
            client: Arc::clone(&slot.client),
            _permit: permit,
        })
    }
}

// tests/common/mod.rs

//! Shared fixtures for the integration tests: a simulated remote backend,
//! temp-directory settings, and workflow file builders.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rushti::remote::sim::SimulatedServer;
use rushti::remote::ClientPool;
use rushti::settings::Settings;

/// Settings rooted in a temp directory, tuned for fast tests: stats under
/// the temp dir, one-second checkpoint interval, one-second lock polling.
pub fn test_settings(base: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.base_dir = base.to_path_buf();
    settings.resume.checkpoint_interval_sec = 1;
    settings.exclusive.polling_interval_sec = 1;
    settings.exclusive.timeout_sec = 30;
    settings
}

/// Same, with the stats store disabled entirely.
pub fn test_settings_no_stats(base: &Path) -> Settings {
    let mut settings = test_settings(base);
    settings.stats.enabled = false;
    settings
}

/// One pool over a shared simulated server, registering each instance.
pub fn sim_pool(server: &SimulatedServer, instances: &[&str], max_workers: usize) -> Arc<ClientPool> {
    let mut pool = ClientPool::new();
    for instance in instances {
        pool.register(instance.to_string(), server.client(), max_workers);
    }
    Arc::new(pool)
}

pub fn write_workflow(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

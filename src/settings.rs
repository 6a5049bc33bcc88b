// src/settings.rs

//! The settings file and the option precedence chain.
//!
//! Settings resolve highest-first: command-line flag, then the workflow's
//! `settings` block, then the settings file (TOML), then built-in defaults.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::engine::queue::OrderingPolicy;
use crate::errors::RushtiError;
use crate::exclusive::LockSettings;
use crate::stats::EstimatorConfig;
use crate::taskfile::WorkflowSettings;

/// `[defaults]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsSection {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub result_file: Option<String>,
}

fn default_max_workers() -> usize {
    4
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            retries: 0,
            result_file: None,
        }
    }
}

/// `[optimization]` section: estimator tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct OptimizationSection {
    #[serde(default = "default_lookback_runs")]
    pub lookback_runs: usize,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_cache_hours")]
    pub cache_hours: u32,
    #[serde(default)]
    pub time_of_day_weighting: bool,
}

fn default_lookback_runs() -> usize {
    10
}

fn default_min_samples() -> usize {
    3
}

fn default_alpha() -> f64 {
    0.3
}

fn default_cache_hours() -> u32 {
    24
}

impl Default for OptimizationSection {
    fn default() -> Self {
        Self {
            lookback_runs: default_lookback_runs(),
            min_samples: default_min_samples(),
            alpha: default_alpha(),
            cache_hours: default_cache_hours(),
            time_of_day_weighting: false,
        }
    }
}

impl OptimizationSection {
    pub fn estimator_config(&self) -> EstimatorConfig {
        EstimatorConfig {
            lookback_runs: self.lookback_runs,
            min_samples: self.min_samples,
            alpha: self.alpha,
            cache_hours: self.cache_hours,
            time_of_day_weighting: self.time_of_day_weighting,
        }
    }
}

/// `[exclusive]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ExclusiveSection {
    #[serde(default = "default_polling_interval")]
    pub polling_interval_sec: u64,
    #[serde(default = "default_lock_timeout")]
    pub timeout_sec: u64,
}

fn default_polling_interval() -> u64 {
    30
}

fn default_lock_timeout() -> u64 {
    600
}

impl Default for ExclusiveSection {
    fn default() -> Self {
        Self {
            polling_interval_sec: default_polling_interval(),
            timeout_sec: default_lock_timeout(),
        }
    }
}

impl ExclusiveSection {
    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            polling_interval_sec: self.polling_interval_sec,
            timeout_sec: self.timeout_sec,
        }
    }
}

/// `[resume]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ResumeSection {
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_sec: u64,
}

fn default_checkpoint_interval() -> u64 {
    60
}

impl Default for ResumeSection {
    fn default() -> Self {
        Self {
            checkpoint_interval_sec: default_checkpoint_interval(),
        }
    }
}

/// `[stats]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StatsSection {
    #[serde(default = "default_stats_enabled")]
    pub enabled: bool,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_stats_enabled() -> bool {
    true
}

fn default_db_path() -> String {
    "data/rushti_stats.sqlite".to_string()
}

fn default_retention_days() -> u32 {
    90
}

impl Default for StatsSection {
    fn default() -> Self {
        Self {
            enabled: default_stats_enabled(),
            db_path: default_db_path(),
            retention_days: default_retention_days(),
        }
    }
}

/// The whole settings file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub defaults: DefaultsSection,
    #[serde(default)]
    pub optimization: OptimizationSection,
    #[serde(default)]
    pub exclusive: ExclusiveSection,
    #[serde(default)]
    pub resume: ResumeSection,
    #[serde(default)]
    pub stats: StatsSection,
    /// Base directory for checkpoints, stats and archives.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, RushtiError> {
        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)
            .map_err(|e| RushtiError::Config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "settings file loaded");
        Ok(settings)
    }

    /// Load from path if given; otherwise the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, RushtiError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn stats_db_path(&self) -> PathBuf {
        self.base_dir.join(&self.stats.db_path)
    }
}

/// Values taken from the command line; `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub max_workers: Option<usize>,
    pub retries: Option<u32>,
    pub result_file: Option<String>,
    pub exclusive: Option<bool>,
    pub ordering_policy: Option<OrderingPolicy>,
    pub no_checkpoint: bool,
}

/// The fully resolved configuration of one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub max_workers: usize,
    pub retries: u32,
    pub result_file: Option<String>,
    pub exclusive: bool,
    pub ordering_policy: Option<OrderingPolicy>,
    pub checkpoint_enabled: bool,
    pub stage_workers: HashMap<String, usize>,
}

/// Resolve the precedence chain for one run.
pub fn resolve_run_config(
    cli: &CliOverrides,
    workflow: &WorkflowSettings,
    settings: &Settings,
) -> Result<RunConfig, RushtiError> {
    let max_workers = cli
        .max_workers
        .or(workflow.max_workers)
        .unwrap_or(settings.defaults.max_workers);
    if max_workers == 0 {
        return Err(RushtiError::Config(
            "max_workers must be a positive integer".to_string(),
        ));
    }

    let retries = cli
        .retries
        .or(workflow.retries)
        .unwrap_or(settings.defaults.retries);

    let result_file = cli
        .result_file
        .clone()
        .or_else(|| workflow.result_file.clone())
        .or_else(|| settings.defaults.result_file.clone());

    let exclusive = cli.exclusive.or(workflow.exclusive).unwrap_or(false);

    let ordering_policy = cli.ordering_policy.or(workflow.ordering_policy);

    let stage_workers: HashMap<String, usize> = workflow
        .stage_workers
        .clone()
        .map(|m| m.into_iter().collect())
        .unwrap_or_default();

    Ok(RunConfig {
        max_workers,
        retries,
        result_file,
        exclusive,
        ordering_policy,
        checkpoint_enabled: !cli.no_checkpoint,
        stage_workers,
    })
}

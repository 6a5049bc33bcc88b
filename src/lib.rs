// src/lib.rs

pub mod checkpoint;
pub mod cli;
pub mod engine;
pub mod errors;
pub mod exclusive;
pub mod exec;
pub mod logging;
pub mod model;
pub mod remote;
pub mod results;
pub mod settings;
pub mod stats;
pub mod taskfile;

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::engine::runtime::{resume_workflow, run_workflow};
use crate::errors::RushtiError;
use crate::remote::ClientPool;
use crate::results::RunSummary;
use crate::settings::{CliOverrides, Settings};
use crate::stats::contention::{analyze_contention, apply_to_taskfile, AnalyzerConfig};
use crate::stats::StatsStore;

/// Execute a workflow file. This is the library equivalent of `rushti run`.
pub async fn run(
    pool: Arc<ClientPool>,
    taskfile_path: &Path,
    cli: CliOverrides,
    settings: Settings,
    force: bool,
) -> Result<RunSummary, RushtiError> {
    run_workflow(pool, taskfile_path.to_path_buf(), cli, settings, force).await
}

/// Resume a workflow from its checkpoint (`rushti resume`).
pub async fn resume(
    pool: Arc<ClientPool>,
    taskfile_path: &Path,
    cli: CliOverrides,
    settings: Settings,
    force: bool,
) -> Result<RunSummary, RushtiError> {
    resume_workflow(pool, taskfile_path.to_path_buf(), cli, settings, force).await
}

/// Structural validation, with an optional remote probe (`rushti validate`).
pub async fn validate(
    taskfile_path: &Path,
    pool: Option<&ClientPool>,
) -> Result<taskfile::Report, RushtiError> {
    let tf = taskfile::load(taskfile_path)?;
    let dag = taskfile::build_dag(&tf)?;
    let mut report = taskfile::validate_structural(&dag);

    if let Some(pool) = pool {
        let remote = taskfile::validate_remote(&dag, pool).await;
        report.errors.extend(remote.errors);
        report.warnings.extend(remote.warnings);
    }

    Ok(report)
}

/// Apply parametric expansion and emit the structured form
/// (`rushti expand`).
pub async fn expand(
    pool: Arc<ClientPool>,
    taskfile_path: &Path,
    output_path: &Path,
) -> Result<(), RushtiError> {
    let tf = taskfile::load(taskfile_path)?;
    let expanded = taskfile::expand_taskfile(&tf, &pool).await?;
    taskfile::save(&expanded, output_path)?;
    info!(
        input = %taskfile_path.display(),
        output = %output_path.display(),
        tasks = expanded.tasks.len(),
        "expanded workflow written"
    );
    Ok(())
}

/// Contention analysis over stored history, rewriting the workflow with
/// chain edges and a worker recommendation (`rushti analyze`).
pub fn analyze(
    settings: &Settings,
    workflow: &str,
    taskfile_path: Option<&Path>,
    output_path: &Path,
    sensitivity: Option<f64>,
) -> Result<stats::ContentionReport, RushtiError> {
    let store = StatsStore::open(&settings.stats_db_path(), settings.stats.retention_days)?;

    let config = AnalyzerConfig {
        sensitivity: sensitivity.unwrap_or(10.0),
        lookback_runs: settings.optimization.lookback_runs,
        alpha: settings.optimization.alpha,
        ..AnalyzerConfig::default()
    };
    let report = analyze_contention(&store, workflow, &config)?;

    // Rewrite the given taskfile, or the archived copy of the last
    // successful run when none is given.
    let source = match taskfile_path {
        Some(path) => Some(path.to_path_buf()),
        None => store
            .latest_archived_taskfile(workflow)?
            .map(std::path::PathBuf::from),
    };
    let Some(source) = source else {
        return Err(RushtiError::Config(format!(
            "no taskfile given and no archived run found for workflow '{workflow}'"
        )));
    };

    let tf = taskfile::load(&source)?;
    let rewritten = apply_to_taskfile(&tf, &report);
    taskfile::save(&rewritten, output_path)?;
    info!(output = %output_path.display(), "rewritten workflow written");

    Ok(report)
}

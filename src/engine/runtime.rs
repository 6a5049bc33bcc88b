// src/engine/runtime.rs

//! The run controller.
//!
//! Owns the run lifecycle: load and expand the workflow, acquire the
//! exclusive lock when requested, open the stats store and checkpointer,
//! drive the scheduler to a terminal state over a completion channel, then
//! finalize results and release everything. Workers report back through an
//! mpsc channel; the scheduler itself is only ever touched from this loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::checkpoint::{self, Checkpoint, CheckpointManager};
use crate::engine::scheduler::{Finalized, Scheduler, SchedulerOptions};
use crate::errors::RushtiError;
use crate::exclusive;
use crate::exec::Executor;
use crate::model::{TaskOutcome, TaskStatus};
use crate::remote::ClientPool;
use crate::results::{ResultSink, RunSummary};
use crate::settings::{resolve_run_config, CliOverrides, Settings};
use crate::stats::{Estimator, RunRecord, StatsStore, TaskRecord};
use crate::taskfile;

/// External control of a run in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Stop dispatching; in-flight tasks run to completion.
    Stop,
    /// Stop dispatching and cancel in-flight invocations remotely.
    Abort,
}

/// Everything needed to execute (or resume) one workflow run.
pub struct RunRequest {
    pub taskfile_path: PathBuf,
    pub cli: CliOverrides,
    pub settings: Settings,
    /// Bypass checkpoint-mismatch, unsafe-resume and lock checks.
    pub force: bool,
    /// Resume from this workflow's checkpoint instead of starting fresh.
    pub resume: bool,
}

/// Execute a workflow run end to end.
pub async fn execute_run(
    pool: Arc<ClientPool>,
    request: RunRequest,
    control: Option<mpsc::Receiver<ControlSignal>>,
) -> Result<RunSummary, RushtiError> {
    let started_at = Utc::now();
    let run_id = Local::now().format("%Y%m%d_%H%M%S%3f").to_string();

    // Parse, expand, validate.
    let mut taskfile = taskfile::load(&request.taskfile_path)?;
    if taskfile::needs_expansion(&taskfile) {
        taskfile = taskfile::expand_taskfile(&taskfile, &pool).await?;
    }
    let workflow = taskfile.workflow_name().to_string();
    let dag = taskfile::build_dag(&taskfile)?;

    let structural = taskfile::validate_structural(&dag);
    if !structural.is_ok() {
        return Err(RushtiError::Config(structural.errors.join("; ")));
    }

    let config = resolve_run_config(&request.cli, &taskfile.settings, &request.settings)?;
    info!(
        run_id = %run_id,
        workflow = %workflow,
        tasks = dag.len(),
        max_workers = config.max_workers,
        retries = config.retries,
        exclusive = config.exclusive,
        "starting run"
    );

    // Cluster-wide coordination before any task starts.
    let session_tag = exclusive::build_context_tag(&workflow, config.exclusive);
    let instances = dag.instances();
    exclusive::wait_for_exclusive_access(
        &pool,
        &instances,
        config.exclusive,
        &session_tag,
        &request.settings.exclusive.lock_settings(),
        request.force,
    )
    .await?;

    // Durable collaborators.
    let stats = open_stats(&request.settings);
    let archive_path = taskfile::archive(
        &taskfile,
        &request.settings.base_dir,
        &workflow,
        &run_id,
    )
    .map_err(|e| {
        warn!(error = %e, "failed to archive workflow");
        e
    })
    .ok();

    // Scheduling weights, only when an ordering policy is active.
    let costs = match (&config.ordering_policy, &stats) {
        (Some(_), Some(store)) => {
            let estimator = Estimator::new(store, request.settings.optimization.estimator_config());
            estimator.costs_for(dag.tasks())?
        }
        _ => HashMap::new(),
    };

    // Resume bootstrap.
    let mut finalized_from_checkpoint = HashMap::new();
    if request.resume {
        let path = checkpoint::checkpoint_path(&request.settings.base_dir, &workflow);
        if !path.exists() {
            return Err(RushtiError::CheckpointNotFound(workflow));
        }
        let snapshot = Checkpoint::load(&path)?;
        let plan = checkpoint::plan_resume(snapshot, &request.taskfile_path, request.force)?;
        info!(
            reattempted = plan.reattempted.len(),
            finalized = plan.finalized.len(),
            "resuming from checkpoint"
        );
        finalized_from_checkpoint = plan.finalized.into_iter().collect();
    }

    let mut scheduler = Scheduler::new(
        dag.clone(),
        SchedulerOptions {
            max_workers: config.max_workers,
            policy: config.ordering_policy,
            costs,
            stage_caps: config.stage_workers.clone(),
            finalized: finalized_from_checkpoint.clone(),
        },
    );

    let mut checkpointer = if config.checkpoint_enabled {
        let mut snapshot = Checkpoint::create(&run_id, &workflow, &request.taskfile_path, &dag)?;
        for (id, status) in &finalized_from_checkpoint {
            if let Some(task) = snapshot.tasks.get_mut(id) {
                task.status = *status;
            }
        }
        Some(CheckpointManager::new(
            snapshot,
            &request.settings.base_dir,
            request.settings.resume.checkpoint_interval_sec,
        )?)
    } else {
        None
    };

    // Drive the DAG to a terminal state.
    let executor = Arc::new(Executor::new(
        Arc::clone(&pool),
        config.retries,
        session_tag.clone(),
    ));
    let mut sink = ResultSink::new();

    drive(
        &mut scheduler,
        executor,
        &mut sink,
        stats.as_ref(),
        checkpointer.as_mut(),
        &run_id,
        &workflow,
        request.settings.resume.checkpoint_interval_sec,
        control,
    )
    .await;

    // Finalize: summary, stats run row, result file, checkpoint cleanup.
    let finished_at = Utc::now();
    let summary = sink.summarize(
        &run_id,
        &workflow,
        started_at,
        finished_at,
        config.max_workers,
        dag.len(),
    );

    if let Some(store) = &stats {
        let record = RunRecord {
            run_id: run_id.clone(),
            workflow: workflow.clone(),
            taskfile_path: archive_path.as_ref().map(|p| p.display().to_string()),
            started_at,
            finished_at,
            max_workers: config.max_workers,
            retries: config.retries,
            exclusive: config.exclusive,
            ordering_policy: config.ordering_policy.map(|p| p.to_string()),
            status: summary.status_label().to_string(),
            total: summary.total,
            succeeded: summary.succeeded,
            failed: summary.failed,
            skipped: summary.skipped,
            cancelled: summary.cancelled,
        };
        if let Err(e) = store.append_run(&record) {
            warn!(error = %e, "failed to record run summary");
        }
    }

    if let Some(result_file) = &config.result_file {
        if let Err(e) = sink.write_csv(&request.settings.base_dir.join(result_file)) {
            warn!(error = %e, "failed to write result file");
        }
    }

    if let Some(manager) = checkpointer.take() {
        manager.finish(summary.overall_success());
    }

    info!(
        run_id = %run_id,
        elapsed_sec = summary.elapsed_seconds(),
        succeeded = summary.succeeded,
        failed = summary.failed,
        skipped = summary.skipped,
        cancelled = summary.cancelled,
        "run finished"
    );

    Ok(summary)
}

fn open_stats(settings: &Settings) -> Option<StatsStore> {
    if !settings.stats.enabled {
        return None;
    }
    match StatsStore::open(&settings.stats_db_path(), settings.stats.retention_days) {
        Ok(store) => Some(store),
        Err(e) => {
            warn!(error = %e, "stats store unavailable; continuing without history");
            None
        }
    }
}

/// The main loop: dispatch ready tasks, fold completions back into the
/// scheduler, snapshot periodically, react to stop/abort.
#[allow(clippy::too_many_arguments)]
async fn drive(
    scheduler: &mut Scheduler,
    executor: Arc<Executor>,
    sink: &mut ResultSink,
    stats: Option<&StatsStore>,
    mut checkpointer: Option<&mut CheckpointManager>,
    run_id: &str,
    workflow: &str,
    checkpoint_interval_sec: u64,
    control: Option<mpsc::Receiver<ControlSignal>>,
) {
    let (events_tx, mut events_rx) = mpsc::channel::<(String, TaskOutcome)>(64);
    let (abort_tx, abort_rx) = watch::channel(false);
    let mut control_rx = control;

    // Statuses carried over from a resumed checkpoint (plus skips cascaded
    // from them) go straight to the sink; they hold no new history.
    for finalized in scheduler.take_bootstrap_finalized() {
        record_finalized(
            scheduler,
            &finalized,
            sink,
            None,
            checkpointer.as_deref_mut(),
            run_id,
            workflow,
        );
    }

    dispatch(
        scheduler,
        &executor,
        &events_tx,
        &abort_rx,
        checkpointer.as_deref_mut(),
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(checkpoint_interval_sec.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.reset();

    while !scheduler.is_complete() {
        tokio::select! {
            Some((id, outcome)) = events_rx.recv() => {
                for finalized in scheduler.on_complete(&id, outcome) {
                    record_finalized(
                        scheduler,
                        &finalized,
                        sink,
                        stats,
                        checkpointer.as_deref_mut(),
                        run_id,
                        workflow,
                    );
                }
                dispatch(scheduler, &executor, &events_tx, &abort_rx, checkpointer.as_deref_mut());
            }
            _ = ticker.tick() => {
                if let Some(manager) = checkpointer.as_deref_mut() {
                    manager.save_now();
                }
            }
            Some(signal) = recv_control(&mut control_rx) => {
                match signal {
                    ControlSignal::Stop => {
                        info!("stop requested; draining in-flight tasks");
                        scheduler.stop();
                    }
                    ControlSignal::Abort => {
                        warn!("abort requested; cancelling in-flight tasks");
                        scheduler.stop();
                        let _ = abort_tx.send(true);
                    }
                }
            }
        }
    }
}

async fn recv_control(
    control: &mut Option<mpsc::Receiver<ControlSignal>>,
) -> Option<ControlSignal> {
    match control {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Hand every claimable ready task to a worker.
fn dispatch(
    scheduler: &mut Scheduler,
    executor: &Arc<Executor>,
    events_tx: &mpsc::Sender<(String, TaskOutcome)>,
    abort_rx: &watch::Receiver<bool>,
    mut checkpointer: Option<&mut CheckpointManager>,
) {
    for task in scheduler.claim_ready() {
        if let Some(manager) = checkpointer.as_deref_mut() {
            manager.mark_running(&task.id);
        }

        let executor = Arc::clone(executor);
        let tx = events_tx.clone();
        let abort = abort_rx.clone();
        tokio::spawn(async move {
            let outcome = executor.execute(&task, abort).await;
            if tx.send((task.id, outcome)).await.is_err() {
                error!("completion channel closed before outcome delivery");
            }
        });
    }
}

/// Persist one finalized task everywhere it needs to go.
fn record_finalized(
    scheduler: &Scheduler,
    finalized: &Finalized,
    sink: &mut ResultSink,
    stats: Option<&StatsStore>,
    checkpointer: Option<&mut CheckpointManager>,
    run_id: &str,
    workflow: &str,
) {
    let Some(task) = scheduler.dag().get(&finalized.id) else {
        return;
    };

    sink.record(task, &finalized.outcome);

    // Synthetic zero-duration rows would poison the duration history, so
    // only outcomes that actually ran (or were skipped live) are stored.
    let ran = finalized.outcome.attempts > 0;
    let live_skip = finalized.outcome.status == TaskStatus::Skipped;
    if let Some(store) = stats {
        if ran || live_skip {
            let record = TaskRecord::from_outcome(run_id, workflow, task, &finalized.outcome);
            if let Err(e) = store.append_task(&record) {
                warn!(task = %task.id, error = %e, "failed to record task result");
            }
        }
    }

    if let Some(manager) = checkpointer {
        manager.mark_finalized(
            &finalized.id,
            finalized.outcome.status,
            finalized.outcome.start,
            finalized.outcome.finish,
        );
    }
}

/// Convenience wrapper for the plain (non-resume) entry point.
pub async fn run_workflow(
    pool: Arc<ClientPool>,
    taskfile_path: PathBuf,
    cli: CliOverrides,
    settings: Settings,
    force: bool,
) -> Result<RunSummary, RushtiError> {
    execute_run(
        pool,
        RunRequest {
            taskfile_path,
            cli,
            settings,
            force,
            resume: false,
        },
        None,
    )
    .await
}

/// Convenience wrapper for resuming from the workflow's checkpoint.
pub async fn resume_workflow(
    pool: Arc<ClientPool>,
    taskfile_path: PathBuf,
    cli: CliOverrides,
    settings: Settings,
    force: bool,
) -> Result<RunSummary, RushtiError> {
    execute_run(
        pool,
        RunRequest {
            taskfile_path,
            cli,
            settings,
            force,
            resume: true,
        },
        None,
    )
    .await
}


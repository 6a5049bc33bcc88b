// src/checkpoint.rs

//! Durable run snapshots and the resume protocol.
//!
//! The checkpoint is a JSON document written via temp-file-and-rename so
//! the authoritative path is never left partial. One checkpoint exists per
//! workflow at `checkpoints/<workflow>.snapshot`; a per-run archival copy
//! is kept alongside it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::errors::RushtiError;
use crate::model::{Dag, TaskStatus};
use crate::taskfile::sanitize;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Per-task state captured in a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<DateTime<Utc>>,
    pub safe_retry: bool,
}

/// A durable snapshot of in-flight run state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub run_id: String,
    pub workflow: String,
    pub taskfile_path: PathBuf,
    /// Hex sha256 of the task file content at run start.
    pub taskfile_hash: String,
    pub run_started: DateTime<Utc>,
    pub snapshot_at: DateTime<Utc>,
    pub tasks: BTreeMap<String, TaskSnapshot>,
}

impl Checkpoint {
    /// Fresh checkpoint at run start: every task pending.
    pub fn create(
        run_id: &str,
        workflow: &str,
        taskfile_path: &Path,
        dag: &Dag,
    ) -> Result<Self, RushtiError> {
        let now = Utc::now();
        Ok(Self {
            version: SNAPSHOT_VERSION,
            run_id: run_id.to_string(),
            workflow: workflow.to_string(),
            taskfile_path: taskfile_path.to_path_buf(),
            taskfile_hash: file_hash(taskfile_path)?,
            run_started: now,
            snapshot_at: now,
            tasks: dag
                .tasks()
                .iter()
                .map(|t| {
                    (
                        t.id.clone(),
                        TaskSnapshot {
                            status: TaskStatus::Pending,
                            start: None,
                            finish: None,
                            safe_retry: t.safe_retry,
                        },
                    )
                })
                .collect(),
        })
    }

    pub fn is_fully_successful(&self) -> bool {
        self.tasks
            .values()
            .all(|t| matches!(t.status, TaskStatus::Succeeded | TaskStatus::Skipped))
    }

    pub fn load(path: &Path) -> Result<Self, RushtiError> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| RushtiError::Parse {
            path: path.to_path_buf(),
            line: e.line(),
            message: format!("invalid checkpoint: {e}"),
        })
    }

    /// Write atomically: temp file in the target directory, then rename
    /// over the authoritative path.
    pub fn save(&self, path: &Path) -> Result<(), RushtiError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let tmp = path.with_extension("snapshot.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self).unwrap_or_default())?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "checkpoint saved");
        Ok(())
    }
}

/// What a resumed run starts from.
#[derive(Debug, Clone)]
pub struct ResumePlan {
    pub checkpoint: Checkpoint,
    /// Tasks treated as already terminal (`SUCCEEDED` / `SKIPPED`).
    pub finalized: BTreeMap<String, TaskStatus>,
    /// Tasks that will be re-attempted (checkpointed `FAILED`, or `RUNNING`
    /// with `safe_retry`).
    pub reattempted: Vec<String>,
}

/// Apply the resume protocol to a loaded checkpoint.
///
/// The referenced task file must hash to the checkpointed value unless
/// `force` is set. A task that was `RUNNING` without `safe_retry` fails the
/// resume unless `force` is set.
pub fn plan_resume(
    checkpoint: Checkpoint,
    taskfile_path: &Path,
    force: bool,
) -> Result<ResumePlan, RushtiError> {
    let current_hash = file_hash(taskfile_path)?;
    if current_hash != checkpoint.taskfile_hash {
        if !force {
            return Err(RushtiError::CheckpointMismatch {
                path: taskfile_path.to_path_buf(),
            });
        }
        warn!(
            path = %taskfile_path.display(),
            "task file changed since checkpoint; resuming anyway (force)"
        );
    }

    let mut finalized = BTreeMap::new();
    let mut reattempted = Vec::new();
    let mut unsafe_tasks = Vec::new();

    for (id, snapshot) in &checkpoint.tasks {
        match snapshot.status {
            TaskStatus::Succeeded | TaskStatus::Skipped => {
                finalized.insert(id.clone(), snapshot.status);
            }
            TaskStatus::Failed | TaskStatus::Cancelled => {
                reattempted.push(id.clone());
            }
            TaskStatus::Running => {
                if snapshot.safe_retry {
                    reattempted.push(id.clone());
                } else {
                    unsafe_tasks.push(id.clone());
                }
            }
            TaskStatus::Pending | TaskStatus::Ready => {}
        }
    }

    if !unsafe_tasks.is_empty() {
        if !force {
            return Err(RushtiError::UnsafeResume {
                tasks: unsafe_tasks.join(", "),
            });
        }
        warn!(
            tasks = %unsafe_tasks.join(", "),
            "re-attempting non-safe-retry tasks that were running (force)"
        );
        reattempted.extend(unsafe_tasks);
    }

    info!(
        finalized = finalized.len(),
        reattempted = reattempted.len(),
        "resume plan prepared"
    );

    Ok(ResumePlan {
        checkpoint,
        finalized,
        reattempted,
    })
}

/// Authoritative checkpoint path for a workflow.
pub fn checkpoint_path(base_dir: &Path, workflow: &str) -> PathBuf {
    base_dir
        .join("checkpoints")
        .join(format!("{}.snapshot", sanitize(workflow)))
}

/// Hex sha256 of a file's content.
pub fn file_hash(path: &Path) -> Result<String, RushtiError> {
    let content = fs::read(path)?;
    let digest = Sha256::digest(&content);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Owns the checkpoint during a run: tracks transitions, saves on the
/// configured interval plus every task completion, and cleans up on a fully
/// successful exit.
pub struct CheckpointManager {
    checkpoint: Checkpoint,
    path: PathBuf,
    archive_path: PathBuf,
    interval_sec: u64,
    last_save: std::time::Instant,
}

impl CheckpointManager {
    pub fn new(
        checkpoint: Checkpoint,
        base_dir: &Path,
        interval_sec: u64,
    ) -> Result<Self, RushtiError> {
        let path = checkpoint_path(base_dir, &checkpoint.workflow);
        let archive_path = base_dir.join("checkpoints").join(format!(
            "{}.{}.snapshot",
            sanitize(&checkpoint.workflow),
            checkpoint.run_id
        ));
        let manager = Self {
            checkpoint,
            path,
            archive_path,
            interval_sec,
            last_save: std::time::Instant::now(),
        };
        manager.save()?;
        Ok(manager)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mark_running(&mut self, id: &str) {
        if let Some(task) = self.checkpoint.tasks.get_mut(id) {
            task.status = TaskStatus::Running;
            task.start = Some(Utc::now());
        }
        self.maybe_save();
    }

    pub fn mark_finalized(
        &mut self,
        id: &str,
        status: TaskStatus,
        start: DateTime<Utc>,
        finish: DateTime<Utc>,
    ) {
        if let Some(task) = self.checkpoint.tasks.get_mut(id) {
            task.status = status;
            task.start = Some(start);
            task.finish = Some(finish);
        }
        if let Err(e) = self.save() {
            warn!(error = %e, "checkpoint save failed");
        }
    }

    /// Interval-based save for transitions that happen in bursts.
    fn maybe_save(&mut self) {
        if self.last_save.elapsed().as_secs() >= self.interval_sec {
            if let Err(e) = self.save() {
                warn!(error = %e, "checkpoint save failed");
            }
        }
    }

    fn save(&self) -> Result<(), RushtiError> {
        let mut snapshot = self.checkpoint.clone();
        snapshot.snapshot_at = Utc::now();
        snapshot.save(&self.path)
    }

    /// Force an immediate save (used on the periodic timer tick).
    pub fn save_now(&mut self) {
        if let Err(e) = self.save() {
            warn!(error = %e, "checkpoint save failed");
        } else {
            self.last_save = std::time::Instant::now();
        }
    }

    /// Write the per-run archival copy, then delete the authoritative
    /// checkpoint only after a fully successful run.
    pub fn finish(self, run_successful: bool) {
        if let Err(e) = self.checkpoint.save(&self.archive_path) {
            warn!(error = %e, "failed to write archival checkpoint copy");
        }
        if run_successful {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %e, "failed to delete checkpoint");
                }
            }
        } else {
            if let Err(e) = self.checkpoint.save(&self.path) {
                warn!(error = %e, "failed to retain checkpoint");
            }
            info!(path = %self.path.display(), "checkpoint retained for resume");
        }
    }
}

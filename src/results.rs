// src/results.rs

//! Per-task result records aggregated to a run summary, with CSV export.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::errors::RushtiError;
use crate::model::{Task, TaskOutcome, TaskStatus};

/// One exported result row.
#[derive(Debug, Clone)]
pub struct ResultRow {
    pub task_id: String,
    pub instance: String,
    pub process: String,
    pub status: TaskStatus,
    pub start: DateTime<Utc>,
    pub finish: DateTime<Utc>,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Final accounting of a run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub workflow: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub max_workers: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

impl RunSummary {
    pub fn elapsed_seconds(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// A run is successful when every task finished in `SUCCEEDED` or
    /// `SKIPPED` (a skip is a policy outcome, not a failure of the run
    /// machinery itself) and nothing failed or was cancelled.
    pub fn overall_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0 && self.succeeded + self.skipped == self.total
    }

    pub fn exit_code(&self) -> i32 {
        if self.failed == 0 && self.cancelled == 0 {
            crate::errors::EXIT_SUCCESS
        } else {
            crate::errors::EXIT_TASK_FAILURES
        }
    }

    pub fn status_label(&self) -> &'static str {
        if self.overall_success() && self.skipped == 0 {
            "success"
        } else if self.failed == 0 && self.cancelled == 0 {
            "partial"
        } else {
            "failed"
        }
    }
}

/// Collects task records during a run and finalizes them into a summary.
#[derive(Debug, Default)]
pub struct ResultSink {
    rows: Vec<ResultRow>,
}

impl ResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, task: &Task, outcome: &TaskOutcome) {
        self.rows.push(ResultRow {
            task_id: task.id.clone(),
            instance: task.instance.clone(),
            process: task.process.clone(),
            status: outcome.status,
            start: outcome.start,
            finish: outcome.finish,
            attempts: outcome.attempts,
            error: outcome.error_message.clone(),
        });
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.rows.iter().filter(|r| r.status == status).count()
    }

    pub fn summarize(
        &self,
        run_id: &str,
        workflow: &str,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        max_workers: usize,
        total: usize,
    ) -> RunSummary {
        RunSummary {
            run_id: run_id.to_string(),
            workflow: workflow.to_string(),
            started_at,
            finished_at,
            max_workers,
            total,
            succeeded: self.count(TaskStatus::Succeeded),
            failed: self.count(TaskStatus::Failed),
            skipped: self.count(TaskStatus::Skipped),
            cancelled: self.count(TaskStatus::Cancelled),
        }
    }

    /// Write the result file: one CSV row per task, finalization order.
    pub fn write_csv(&self, path: &Path) -> Result<(), RushtiError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let mut out =
            String::from("task_id,instance,process,status,start,finish,attempts,error\n");
        for row in &self.rows {
            out.push_str(&format!(
                "{},{},{},{},{},{},{},{}\n",
                csv_field(&row.task_id),
                csv_field(&row.instance),
                csv_field(&row.process),
                row.status,
                row.start.to_rfc3339(),
                row.finish.to_rfc3339(),
                row.attempts,
                csv_field(row.error.as_deref().unwrap_or("")),
            ));
        }
        fs::write(path, out)?;
        info!(path = %path.display(), rows = self.rows.len(), "result file written");
        Ok(())
    }
}

fn csv_field(value: &str) -> String {
    if value.contains(&[',', '"', '\n'][..]) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

// src/stats/store.rs

//! Durable execution history.
//!
//! A single embedded SQLite database holds one row per run and one row per
//! (run, task). Task rows are append-only during a run; the run row is
//! written last. rusqlite's `Connection` is not `Sync`, so the handle lives
//! behind a `Mutex` and writes are serialized.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::errors::RushtiError;
use crate::model::{Task, TaskOutcome};

/// One row of the `runs` table.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub workflow: String,
    pub taskfile_path: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub max_workers: usize,
    pub retries: u32,
    pub exclusive: bool,
    pub ordering_policy: Option<String>,
    pub status: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

/// One row of the `task_results` table.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub run_id: String,
    pub workflow: String,
    pub task_id: String,
    pub signature: String,
    pub instance: String,
    pub process: String,
    pub parameters_json: String,
    pub status: String,
    pub start: DateTime<Utc>,
    pub finish: DateTime<Utc>,
    pub duration_seconds: f64,
    pub attempts: u32,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub stage: Option<String>,
    pub predecessors_json: Option<String>,
}

impl TaskRecord {
    pub fn from_outcome(
        run_id: &str,
        workflow: &str,
        task: &Task,
        outcome: &TaskOutcome,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            workflow: workflow.to_string(),
            task_id: task.id.clone(),
            signature: task.signature(),
            instance: task.instance.clone(),
            process: task.process.clone(),
            parameters_json: serde_json::to_string(&task.parameters).unwrap_or_default(),
            status: outcome.status.as_str().to_string(),
            start: outcome.start,
            finish: outcome.finish,
            duration_seconds: outcome.duration_seconds(),
            attempts: outcome.attempts,
            error_kind: outcome.error_kind.map(|k| k.to_string()),
            error_message: outcome.error_message.clone(),
            stage: task.stage.clone(),
            predecessors_json: (!task.predecessors.is_empty())
                .then(|| serde_json::to_string(&task.predecessors).unwrap_or_default()),
        }
    }
}

/// Condensed run summary for analysis queries.
#[derive(Debug, Clone)]
pub struct RunRow {
    pub run_id: String,
    pub started_at: String,
    pub duration_seconds: f64,
    pub max_workers: usize,
    pub status: String,
}

/// Per-task row of one run, as needed by the contention analyzer.
#[derive(Debug, Clone)]
pub struct AnalyzerTaskRow {
    pub task_id: String,
    pub signature: String,
    pub process: String,
    pub parameters: Vec<(String, String)>,
}

pub struct StatsStore {
    conn: Mutex<Connection>,
}

impl StatsStore {
    /// Open (or create) the database and purge rows older than
    /// `retention_days` (0 = unbounded).
    pub fn open(path: &Path, retention_days: u32) -> Result<Self, RushtiError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        if retention_days > 0 {
            let purged = store.purge_older_than(retention_days)?;
            if purged > 0 {
                info!(purged, retention_days, "purged expired run history");
            }
        }
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, RushtiError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), RushtiError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                workflow TEXT NOT NULL,
                taskfile_path TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                duration_seconds REAL NOT NULL,
                max_workers INTEGER NOT NULL,
                retries INTEGER NOT NULL,
                exclusive INTEGER NOT NULL,
                ordering_policy TEXT,
                status TEXT NOT NULL,
                total INTEGER NOT NULL,
                succeeded INTEGER NOT NULL,
                failed INTEGER NOT NULL,
                skipped INTEGER NOT NULL,
                cancelled INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                workflow TEXT NOT NULL,
                task_id TEXT NOT NULL,
                signature TEXT NOT NULL,
                instance TEXT NOT NULL,
                process TEXT NOT NULL,
                parameters TEXT NOT NULL,
                status TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                duration_seconds REAL NOT NULL,
                attempts INTEGER NOT NULL,
                error_kind TEXT,
                error_message TEXT,
                stage TEXT,
                predecessors TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_task_results_signature
                ON task_results(signature);
            CREATE INDEX IF NOT EXISTS idx_task_results_run
                ON task_results(run_id);
            CREATE INDEX IF NOT EXISTS idx_runs_workflow
                ON runs(workflow);",
        )?;
        Ok(())
    }

    /// Record the run summary. Written once, after all task rows.
    pub fn append_run(&self, record: &RunRecord) -> Result<(), RushtiError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO runs (
                run_id, workflow, taskfile_path, started_at, finished_at,
                duration_seconds, max_workers, retries, exclusive,
                ordering_policy, status, total, succeeded, failed, skipped, cancelled
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                record.run_id,
                record.workflow,
                record.taskfile_path,
                record.started_at.to_rfc3339(),
                record.finished_at.to_rfc3339(),
                (record.finished_at - record.started_at).num_milliseconds() as f64 / 1000.0,
                record.max_workers as i64,
                record.retries as i64,
                record.exclusive as i64,
                record.ordering_policy,
                record.status,
                record.total as i64,
                record.succeeded as i64,
                record.failed as i64,
                record.skipped as i64,
                record.cancelled as i64,
            ],
        )?;
        debug!(run_id = %record.run_id, "run summary recorded");
        Ok(())
    }

    /// Append one (run, task) row.
    pub fn append_task(&self, record: &TaskRecord) -> Result<(), RushtiError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO task_results (
                run_id, workflow, task_id, signature, instance, process,
                parameters, status, start_time, end_time, duration_seconds,
                attempts, error_kind, error_message, stage, predecessors
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                record.run_id,
                record.workflow,
                record.task_id,
                record.signature,
                record.instance,
                record.process,
                record.parameters_json,
                record.status,
                record.start.to_rfc3339(),
                record.finish.to_rfc3339(),
                record.duration_seconds,
                record.attempts as i64,
                record.error_kind,
                record.error_message,
                record.stage,
                record.predecessors_json,
            ],
        )?;
        Ok(())
    }

    /// Last `k` successful durations for a signature, most recent first.
    pub fn recent(&self, signature: &str, k: usize) -> Result<Vec<f64>, RushtiError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT duration_seconds FROM task_results
             WHERE signature = ?1 AND status = 'succeeded'
             ORDER BY start_time DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![signature, k as i64], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<f64>, _>>()?)
    }

    /// Like [`recent`](Self::recent) but with start timestamps, for
    /// time-of-day weighted estimation.
    pub fn recent_with_times(
        &self,
        signature: &str,
        k: usize,
    ) -> Result<Vec<(f64, DateTime<Utc>)>, RushtiError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT duration_seconds, start_time FROM task_results
             WHERE signature = ?1 AND status = 'succeeded'
             ORDER BY start_time DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![signature, k as i64], |row| {
            let duration: f64 = row.get(0)?;
            let start: String = row.get(1)?;
            Ok((duration, start))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (duration, start) = row?;
            if let Ok(ts) = DateTime::parse_from_rfc3339(&start) {
                out.push((duration, ts.with_timezone(&Utc)));
            }
        }
        Ok(out)
    }

    /// Last `k` run summaries for a workflow, most recent first.
    pub fn recent_runs(&self, workflow: &str, k: usize) -> Result<Vec<RunRow>, RushtiError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT run_id, started_at, duration_seconds, max_workers, status
             FROM runs WHERE workflow = ?1
             ORDER BY started_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![workflow, k as i64], |row| {
            Ok(RunRow {
                run_id: row.get(0)?,
                started_at: row.get(1)?,
                duration_seconds: row.get(2)?,
                max_workers: row.get::<_, i64>(3)? as usize,
                status: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// All distinct signatures recorded for a workflow.
    pub fn signatures_for_workflow(&self, workflow: &str) -> Result<Vec<String>, RushtiError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT signature FROM task_results
             WHERE workflow = ?1 ORDER BY signature",
        )?;
        let rows = stmt.query_map(params![workflow], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    /// Task rows of the most recent fully successful run of a workflow.
    pub fn tasks_of_latest_successful_run(
        &self,
        workflow: &str,
    ) -> Result<Vec<AnalyzerTaskRow>, RushtiError> {
        let conn = self.conn.lock().unwrap();

        let run_id: Option<String> = conn
            .query_row(
                "SELECT run_id FROM runs
                 WHERE workflow = ?1 AND status = 'success'
                 ORDER BY started_at DESC LIMIT 1",
                params![workflow],
                |row| row.get(0),
            )
            .optional()?;
        let Some(run_id) = run_id else {
            return Ok(Vec::new());
        };

        let mut stmt = conn.prepare(
            "SELECT task_id, signature, process, parameters
             FROM task_results WHERE run_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            let task_id: String = row.get(0)?;
            let signature: String = row.get(1)?;
            let process: String = row.get(2)?;
            let parameters: String = row.get(3)?;
            Ok((task_id, signature, process, parameters))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (task_id, signature, process, parameters_json) = row?;
            let parameters: Vec<(String, String)> =
                serde_json::from_str::<crate::model::Parameters>(&parameters_json)
                    .map(|p| p.0)
                    .unwrap_or_default();
            out.push(AnalyzerTaskRow {
                task_id,
                signature,
                process,
                parameters,
            });
        }
        Ok(out)
    }

    /// The archived taskfile path of the most recent successful run.
    pub fn latest_archived_taskfile(&self, workflow: &str) -> Result<Option<String>, RushtiError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT taskfile_path FROM runs
                 WHERE workflow = ?1 AND status = 'success'
                 ORDER BY started_at DESC LIMIT 1",
                params![workflow],
                |row| row.get(0),
            )
            .optional()?
            .flatten())
    }

    /// Delete runs (and their task rows) older than `days`.
    pub fn purge_older_than(&self, days: u32) -> Result<usize, RushtiError> {
        let cutoff = (Utc::now() - Duration::days(days as i64)).to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM task_results WHERE run_id IN
                 (SELECT run_id FROM runs WHERE started_at < ?1)",
            params![cutoff],
        )?;
        let purged = conn.execute("DELETE FROM runs WHERE started_at < ?1", params![cutoff])?;
        Ok(purged)
    }
}

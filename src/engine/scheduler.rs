// src/engine/scheduler.rs

//! The DAG scheduler state machine.
//!
//! Synchronous and single-owner: the runtime drives it from dispatch and
//! completion events, so every status transition and pending-count update
//! happens in one place. Workers never touch it directly.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::{debug, warn};

use crate::engine::queue::{OrderingPolicy, QueueEntry, ReadyQueue};
use crate::model::task::{TaskId, TaskOutcome, TaskStatus};
use crate::model::{Dag, Task};

/// A task that reached a terminal status, with its recorded outcome.
/// One completion can finalize several tasks via skip propagation.
#[derive(Debug, Clone)]
pub struct Finalized {
    pub id: TaskId,
    pub outcome: TaskOutcome,
}

/// Scheduler construction options.
pub struct SchedulerOptions {
    pub max_workers: usize,
    pub policy: Option<OrderingPolicy>,
    /// Estimated runtime per task id (`None` = estimator has no data).
    pub costs: HashMap<TaskId, Option<f64>>,
    /// Optional per-stage concurrency caps.
    pub stage_caps: HashMap<String, usize>,
    /// Tasks already terminal from a resumed checkpoint.
    pub finalized: HashMap<TaskId, TaskStatus>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_workers: 1,
            policy: None,
            costs: HashMap::new(),
            stage_caps: HashMap::new(),
            finalized: HashMap::new(),
        }
    }
}

pub struct Scheduler {
    dag: Dag,
    status: HashMap<TaskId, TaskStatus>,
    pending_count: HashMap<TaskId, usize>,
    queue: ReadyQueue,
    running: HashSet<TaskId>,
    running_per_stage: HashMap<String, usize>,
    stage_caps: HashMap<String, usize>,
    costs: HashMap<TaskId, Option<f64>>,
    max_workers: usize,
    stopping: bool,
    /// Tasks finalized during bootstrap (resumed statuses + cascaded skips).
    bootstrap_finalized: Vec<Finalized>,
}

impl Scheduler {
    pub fn new(dag: Dag, mut options: SchedulerOptions) -> Self {
        for (stage, cap) in options.stage_caps.iter_mut() {
            if *cap == 0 {
                warn!(stage = %stage, "stage worker cap of 0 raised to 1");
                *cap = 1;
            }
            if *cap > options.max_workers {
                warn!(
                    stage = %stage,
                    cap = *cap,
                    max_workers = options.max_workers,
                    "stage worker cap exceeds max_workers; clamping"
                );
                *cap = options.max_workers;
            }
        }

        let mut scheduler = Self {
            status: dag
                .tasks()
                .iter()
                .map(|t| (t.id.clone(), TaskStatus::Pending))
                .collect(),
            pending_count: dag
                .tasks()
                .iter()
                .map(|t| (t.id.clone(), dag.predecessor_count(&t.id)))
                .collect(),
            queue: ReadyQueue::new(options.policy),
            running: HashSet::new(),
            running_per_stage: HashMap::new(),
            stage_caps: options.stage_caps,
            costs: options.costs,
            max_workers: options.max_workers.max(1),
            stopping: false,
            bootstrap_finalized: Vec::new(),
            dag,
        };

        // Replay checkpointed terminal statuses before seeding the queue.
        let preloaded: Vec<(TaskId, TaskStatus)> = scheduler
            .dag
            .tasks()
            .iter()
            .filter_map(|t| options.finalized.remove(&t.id).map(|s| (t.id.clone(), s)))
            .collect();
        for (id, status) in preloaded {
            if scheduler.status.get(&id) != Some(&TaskStatus::Pending) {
                continue;
            }
            let outcome = synthetic_outcome(status, None);
            let mut acc = Vec::new();
            scheduler.finalize(&id, outcome, &mut acc);
            scheduler.bootstrap_finalized.extend(acc);
        }

        // Seed: every pending task with no unfinalized predecessors is ready.
        let seeds: Vec<TaskId> = scheduler
            .dag
            .tasks()
            .iter()
            .filter(|t| {
                scheduler.status.get(&t.id) == Some(&TaskStatus::Pending)
                    && scheduler.pending_count.get(&t.id).copied().unwrap_or(0) == 0
            })
            .map(|t| t.id.clone())
            .collect();
        for id in seeds {
            scheduler.mark_ready(&id);
        }

        scheduler
    }

    /// Tasks finalized during construction from a resumed checkpoint,
    /// including skips cascaded from checkpointed failures.
    pub fn take_bootstrap_finalized(&mut self) -> Vec<Finalized> {
        std::mem::take(&mut self.bootstrap_finalized)
    }

    /// Claim as many ready tasks as worker slots allow, marking each
    /// `RUNNING`. Entries whose stage is at its cap are skipped in queue
    /// order and stay queued.
    pub fn claim_ready(&mut self) -> Vec<Task> {
        let mut claimed = Vec::new();

        while !self.stopping && self.running.len() < self.max_workers {
            let caps = &self.stage_caps;
            let counts = &self.running_per_stage;
            let Some(entry) = self.queue.pop_eligible(|e| match e.stage.as_deref() {
                Some(stage) => match caps.get(stage) {
                    Some(cap) => counts.get(stage).copied().unwrap_or(0) < *cap,
                    None => true,
                },
                None => true,
            }) else {
                break;
            };

            self.status.insert(entry.id.clone(), TaskStatus::Running);
            self.running.insert(entry.id.clone());
            if let Some(stage) = &entry.stage {
                *self.running_per_stage.entry(stage.clone()).or_insert(0) += 1;
            }

            debug!(task = %entry.id, running = self.running.len(), "claimed task");
            if let Some(task) = self.dag.get(&entry.id) {
                claimed.push(task.clone());
            }
        }

        claimed
    }

    /// Record a worker's outcome for a running task. Returns every task
    /// finalized by this event (the task itself plus propagated skips).
    pub fn on_complete(&mut self, id: &str, outcome: TaskOutcome) -> Vec<Finalized> {
        let mut finalized = Vec::new();
        if self
            .status
            .get(id)
            .map(|s| s.is_terminal())
            .unwrap_or(true)
        {
            warn!(task = %id, "completion for a task that is not running; ignoring");
            return finalized;
        }
        self.finalize(id, outcome, &mut finalized);
        finalized
    }

    fn finalize(&mut self, id: &str, outcome: TaskOutcome, acc: &mut Vec<Finalized>) {
        let status = outcome.status;
        self.status.insert(id.to_string(), status);
        if self.running.remove(id) {
            if let Some(stage) = self.dag.get(id).and_then(|t| t.stage.clone()) {
                if let Some(count) = self.running_per_stage.get_mut(&stage) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        acc.push(Finalized {
            id: id.to_string(),
            outcome,
        });

        let bad = status.is_unsuccessful_terminal();
        let successors: Vec<TaskId> = self.dag.successors_of(id).map(String::from).collect();

        for succ in successors {
            if let Some(count) = self.pending_count.get_mut(&succ) {
                *count = count.saturating_sub(1);
            }

            if self.status.get(&succ) != Some(&TaskStatus::Pending) {
                continue;
            }

            let requires_success = self
                .dag
                .get(&succ)
                .map(|t| t.require_predecessor_success)
                .unwrap_or(false);

            if bad && requires_success {
                debug!(task = %succ, predecessor = %id, "skipping: predecessor unsuccessful");
                let skip = synthetic_outcome(
                    TaskStatus::Skipped,
                    Some(format!("predecessor '{id}' finished {status}")),
                );
                self.finalize(&succ, skip, acc);
            } else if self.pending_count.get(&succ).copied().unwrap_or(0) == 0 {
                self.mark_ready(&succ);
            }
        }
    }

    fn mark_ready(&mut self, id: &str) {
        self.status.insert(id.to_string(), TaskStatus::Ready);
        let task = self.dag.get(id);
        self.queue.push(QueueEntry {
            id: id.to_string(),
            stage: task.and_then(|t| t.stage.clone()),
            cost: self.costs.get(id).copied().flatten(),
            seq: self.dag.declaration_index(id).unwrap_or(usize::MAX),
        });
        debug!(task = %id, queued = self.queue.len(), "task ready");
    }

    /// Stop dispatching new tasks; in-flight tasks run to completion.
    pub fn stop(&mut self) {
        self.stopping = true;
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Terminal state of the run loop: nothing running, and either the
    /// queue is drained or dispatch has been stopped.
    pub fn is_complete(&self) -> bool {
        self.running.is_empty() && (self.stopping || self.queue.is_empty())
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.status.get(id).copied()
    }

    pub fn statuses(&self) -> impl Iterator<Item = (&str, TaskStatus)> {
        self.status.iter().map(|(id, s)| (id.as_str(), *s))
    }

    pub fn dag(&self) -> &Dag {
        &self.dag
    }
}

/// Outcome for a task that never ran (skips, resumed statuses).
fn synthetic_outcome(status: TaskStatus, message: Option<String>) -> TaskOutcome {
    let now = Utc::now();
    TaskOutcome {
        status,
        start: now,
        finish: now,
        attempts: 0,
        error_kind: None,
        error_message: message,
    }
}

// tests/scheduler_property.rs

//! Property test over randomly generated DAGs: the scheduler always drains,
//! never exceeds the worker cap, and honours predecessor-success skipping.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use proptest::prelude::*;

use rushti::engine::{Scheduler, SchedulerOptions};
use rushti::model::{Dag, Task, TaskOutcome, TaskStatus};

#[derive(Debug, Clone)]
struct GeneratedDag {
    tasks: Vec<Task>,
    failing: HashSet<usize>,
}

/// Acyclic by construction: task N may only depend on tasks 0..N-1.
fn dag_strategy(max_tasks: usize) -> impl Strategy<Value = GeneratedDag> {
    (2..=max_tasks).prop_flat_map(move |n| {
        let deps = proptest::collection::vec(
            proptest::collection::vec(any::<prop::sample::Index>(), 0..4),
            n,
        );
        let flags = proptest::collection::vec(any::<bool>(), n);
        let failing = proptest::collection::vec(any::<prop::sample::Index>(), 0..3);

        (deps, flags, failing).prop_map(move |(deps, flags, failing)| {
            let mut tasks = Vec::with_capacity(n);
            for (i, (potential, requires)) in deps.iter().zip(flags).enumerate() {
                let mut task = Task::new(format!("t{i}"), "prod", "p");
                task.require_predecessor_success = requires;
                let mut chosen: Vec<usize> = potential
                    .iter()
                    .filter_map(|ix| (i > 0).then(|| ix.index(i)))
                    .collect();
                chosen.sort_unstable();
                chosen.dedup();
                task.predecessors = chosen.iter().map(|d| format!("t{d}")).collect();
                tasks.push(task);
            }
            let failing = failing.iter().map(|ix| ix.index(n)).collect();
            GeneratedDag { tasks, failing }
        })
    })
}

fn outcome(status: TaskStatus) -> TaskOutcome {
    let now = Utc::now();
    TaskOutcome {
        status,
        start: now,
        finish: now,
        attempts: 1,
        error_kind: None,
        error_message: None,
    }
}

proptest! {
    #[test]
    fn scheduler_drains_within_bounds(generated in dag_strategy(12), max_workers in 1usize..5) {
        let dag = Dag::from_tasks(generated.tasks.clone()).unwrap();
        let mut scheduler = Scheduler::new(
            dag,
            SchedulerOptions {
                max_workers,
                ..SchedulerOptions::default()
            },
        );

        let failing: HashSet<String> = generated
            .failing
            .iter()
            .map(|i| format!("t{i}"))
            .collect();
        let by_id: HashMap<String, Task> = generated
            .tasks
            .iter()
            .map(|t| (t.id.clone(), t.clone()))
            .collect();

        let mut executing: Vec<String> = Vec::new();
        let mut finished: HashMap<String, TaskStatus> = HashMap::new();
        let mut steps = 0;

        loop {
            for task in scheduler.claim_ready() {
                executing.push(task.id);
            }
            prop_assert!(executing.len() <= max_workers);

            let Some(id) = executing.pop() else { break };
            let status = if failing.contains(&id) {
                TaskStatus::Failed
            } else {
                TaskStatus::Succeeded
            };
            for f in scheduler.on_complete(&id, outcome(status)) {
                finished.insert(f.id, f.outcome.status);
            }

            steps += 1;
            prop_assert!(steps <= generated.tasks.len() * 2, "scheduler did not converge");
        }

        prop_assert!(scheduler.is_complete());

        // Every task reached a terminal status.
        prop_assert_eq!(finished.len(), generated.tasks.len());

        // Skip semantics: a task requiring predecessor success whose
        // predecessor ended badly must be skipped, and skipped tasks never
        // reached the executor.
        for task in &generated.tasks {
            let status = finished[&task.id];
            if task.require_predecessor_success {
                let bad_pred = task.predecessors.iter().any(|p| {
                    matches!(
                        finished[p],
                        TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled
                    )
                });
                if bad_pred {
                    prop_assert_eq!(status, TaskStatus::Skipped);
                }
            }
            if status == TaskStatus::Skipped {
                prop_assert!(by_id[&task.id].require_predecessor_success);
            }
        }
    }
}

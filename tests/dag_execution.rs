// tests/dag_execution.rs

//! End-to-end DAG execution against the simulated backend: barrier
//! parallelism, dependency-driven scheduling, and the worker cap.

mod common;

use std::time::Duration;

use rushti::engine::{execute_run, RunRequest};
use rushti::remote::sim::SimulatedServer;
use rushti::settings::CliOverrides;

use common::{sim_pool, test_settings_no_stats, write_workflow};

fn overrides(max_workers: usize) -> CliOverrides {
    CliOverrides {
        max_workers: Some(max_workers),
        ..CliOverrides::default()
    }
}

/// Three tasks, a barrier, then two more: the second group starts only
/// after the first fully drains, and total wall clock is the sum of the
/// two group maxima.
#[tokio::test(start_paused = true)]
async fn barrier_groups_run_in_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = write_workflow(
        dir.path(),
        "basic.txt",
        "\
instance=prod process=sleep pWaitSec=2
instance=prod process=sleep pWaitSec=5
instance=prod process=sleep pWaitSec=3
wait
instance=prod process=sleep pWaitSec=4
instance=prod process=sleep pWaitSec=2
",
    );

    let server = SimulatedServer::new();
    let pool = sim_pool(&server, &["prod"], 4);
    let before = tokio::time::Instant::now();

    let summary = execute_run(
        pool,
        RunRequest {
            taskfile_path: tasks,
            cli: overrides(4),
            settings: test_settings_no_stats(dir.path()),
            force: false,
            resume: false,
        },
        None,
    )
    .await
    .unwrap();

    let elapsed = before.elapsed();
    assert_eq!(summary.total, 5);
    assert_eq!(summary.succeeded, 5);
    assert!(summary.overall_success());
    assert_eq!(summary.exit_code(), 0);

    // Group one peaks at 5s, group two at 4s.
    assert!(elapsed >= Duration::from_secs(9), "elapsed: {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(12), "elapsed: {elapsed:?}");

    // The second group's tasks arrive only after the barrier drains.
    let calls = server.executed_calls();
    assert_eq!(calls.len(), 5);
    let first_group: Vec<&str> = calls[..3]
        .iter()
        .map(|c| c.parameters.get("pWaitSec").unwrap())
        .collect();
    assert_eq!(first_group.len(), 3);
    assert!(first_group.contains(&"5"));
}

/// Six tasks, pWaitSec 2,5,3,4,2,3; 4 after 2; 5 after
/// 1,3,4; 6 after 5. Critical path 5 + 4 + 2 + 3 = 14s.
#[tokio::test(start_paused = true)]
async fn dependency_driven_parallelism() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = write_workflow(
        dir.path(),
        "deps.txt",
        "\
id=1 predecessors= instance=prod process=sleep pWaitSec=2
id=2 predecessors= instance=prod process=sleep pWaitSec=5
id=3 predecessors= instance=prod process=sleep pWaitSec=3
id=4 predecessors=2 instance=prod process=sleep pWaitSec=4
id=5 predecessors=1,3,4 instance=prod process=sleep pWaitSec=2
id=6 predecessors=5 instance=prod process=sleep pWaitSec=3
",
    );

    let server = SimulatedServer::new();
    let pool = sim_pool(&server, &["prod"], 4);
    let before = tokio::time::Instant::now();

    let summary = execute_run(
        pool,
        RunRequest {
            taskfile_path: tasks,
            cli: overrides(4),
            settings: test_settings_no_stats(dir.path()),
            force: false,
            resume: false,
        },
        None,
    )
    .await
    .unwrap();

    let elapsed = before.elapsed();
    assert_eq!(summary.succeeded, 6);
    assert!(elapsed >= Duration::from_secs(14), "elapsed: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(15), "elapsed: {elapsed:?}");

    // Arrival order respects the dependency structure.
    let order: Vec<String> = server
        .executed_calls()
        .iter()
        .map(|c| c.session_tag.split(':').nth(1).unwrap().to_string())
        .collect();
    let pos = |id: &str| order.iter().position(|t| t == id).unwrap();
    assert!(pos("4") > pos("2"));
    assert!(pos("5") > pos("1") && pos("5") > pos("3") && pos("5") > pos("4"));
    assert!(pos("6") > pos("5"));
}

/// The worker cap bounds concurrency: ten 1-second tasks on two workers
/// need five sequential waves.
#[tokio::test(start_paused = true)]
async fn worker_cap_is_respected() {
    let dir = tempfile::tempdir().unwrap();
    let mut content = String::new();
    for _ in 0..10 {
        content.push_str("instance=prod process=sleep pWaitSec=1\n");
    }
    let tasks = write_workflow(dir.path(), "cap.txt", &content);

    let server = SimulatedServer::new();
    let pool = sim_pool(&server, &["prod"], 2);
    let before = tokio::time::Instant::now();

    let summary = execute_run(
        pool,
        RunRequest {
            taskfile_path: tasks,
            cli: overrides(2),
            settings: test_settings_no_stats(dir.path()),
            force: false,
            resume: false,
        },
        None,
    )
    .await
    .unwrap();

    assert_eq!(summary.succeeded, 10);
    assert!(before.elapsed() >= Duration::from_secs(5));
}

/// A workflow with no barriers and no predecessors ends in the same
/// terminal statuses regardless of task declaration order.
#[tokio::test(start_paused = true)]
async fn independent_tasks_commute() {
    for content in [
        "instance=prod process=a pWaitSec=1\ninstance=prod process=b pWaitSec=2\n",
        "instance=prod process=b pWaitSec=2\ninstance=prod process=a pWaitSec=1\n",
    ] {
        let dir = tempfile::tempdir().unwrap();
        let tasks = write_workflow(dir.path(), "perm.txt", content);
        let server = SimulatedServer::new();
        server.fail_process("b");
        let pool = sim_pool(&server, &["prod"], 4);

        let summary = execute_run(
            pool,
            RunRequest {
                taskfile_path: tasks,
                cli: overrides(4),
                settings: test_settings_no_stats(dir.path()),
                force: false,
                resume: false,
            },
            None,
        )
        .await
        .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.exit_code(), 1);
    }
}

/// Stage ordering is strict: no load-stage task starts before every
/// extract-stage task finished, and stage caps bound per-stage concurrency.
#[tokio::test(start_paused = true)]
async fn stages_gate_and_cap_execution() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = write_workflow(
        dir.path(),
        "stages.json",
        r#"{
            "metadata": {"workflow": "staged"},
            "settings": {
                "stage_order": ["extract", "load"],
                "stage_workers": {"extract": 2}
            },
            "tasks": [
                {"id": "e1", "instance": "prod", "process": "ex", "stage": "extract",
                 "parameters": {"pWaitSec": "2"}},
                {"id": "e2", "instance": "prod", "process": "ex", "stage": "extract",
                 "parameters": {"pWaitSec": "2"}},
                {"id": "e3", "instance": "prod", "process": "ex", "stage": "extract",
                 "parameters": {"pWaitSec": "2"}},
                {"id": "l1", "instance": "prod", "process": "ld", "stage": "load",
                 "parameters": {"pWaitSec": "1"}}
            ]
        }"#,
    );

    let server = SimulatedServer::new();
    let pool = sim_pool(&server, &["prod"], 4);
    let before = tokio::time::Instant::now();

    let summary = execute_run(
        pool,
        RunRequest {
            taskfile_path: tasks,
            cli: overrides(4),
            settings: test_settings_no_stats(dir.path()),
            force: false,
            resume: false,
        },
        None,
    )
    .await
    .unwrap();

    assert_eq!(summary.succeeded, 4);
    // Extract takes two waves of 2s under its cap of 2, then load runs.
    assert!(before.elapsed() >= Duration::from_secs(5));

    let order: Vec<String> = server
        .executed_calls()
        .iter()
        .map(|c| c.process.clone())
        .collect();
    assert_eq!(order.last().map(String::as_str), Some("ld"));
}

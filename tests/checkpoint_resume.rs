// tests/checkpoint_resume.rs

//! Idempotent resume: interrupt a run mid-flight, resume from the
//! checkpoint, and end with the same per-task outcomes as an uninterrupted
//! run.

mod common;

use std::time::Duration;

use rushti::checkpoint::{checkpoint_path, Checkpoint};
use rushti::engine::{execute_run, RunRequest};
use rushti::model::TaskStatus;
use rushti::remote::sim::SimulatedServer;
use rushti::settings::CliOverrides;

use common::{sim_pool, test_settings_no_stats, write_workflow};

/// Three quick roots, two slow safe-retry middles, three dependents.
const WORKFLOW: &str = "\
id=a1 predecessors= instance=prod process=quick pWaitSec=1
id=a2 predecessors= instance=prod process=quick pWaitSec=1
id=a3 predecessors= instance=prod process=quick pWaitSec=1
id=b1 predecessors=a1,a2,a3 safe_retry=true instance=prod process=slow pWaitSec=10
id=b2 predecessors=a1,a2,a3 safe_retry=true instance=prod process=slow pWaitSec=10
id=c1 predecessors=b1,b2 instance=prod process=quick pWaitSec=1
id=c2 predecessors=b1,b2 instance=prod process=quick pWaitSec=1
id=c3 predecessors=b1,b2 instance=prod process=quick pWaitSec=1
";

fn request(tasks: std::path::PathBuf, dir: &std::path::Path, resume: bool) -> RunRequest {
    RunRequest {
        taskfile_path: tasks,
        cli: CliOverrides {
            max_workers: Some(4),
            ..CliOverrides::default()
        },
        settings: test_settings_no_stats(dir),
        force: false,
        resume,
    }
}

/// Kill the run at T=3s (3 succeeded, 2 running with
/// safe_retry, 3 pending), then resume. The resumed run performs exactly
/// the 5 remaining invocations and every task ends SUCCEEDED.
#[tokio::test(start_paused = true)]
async fn interrupted_run_resumes_idempotently() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = write_workflow(dir.path(), "resume.txt", WORKFLOW);

    // First run, killed at T=3s. The checkpoint interval is one second, so
    // the snapshot on disk has b1/b2 marked running by then.
    {
        let server = SimulatedServer::new();
        let pool = sim_pool(&server, &["prod"], 4);
        let run = execute_run(pool, request(tasks.clone(), dir.path(), false), None);
        tokio::select! {
            _ = run => panic!("run should not finish before the interrupt"),
            _ = tokio::time::sleep(Duration::from_millis(3500)) => {}
        }
        assert_eq!(server.executed_calls().len(), 5);
    }

    let snapshot_path = checkpoint_path(dir.path(), "resume");
    let snapshot = Checkpoint::load(&snapshot_path).unwrap();
    let status = |id: &str| snapshot.tasks.get(id).unwrap().status;
    assert_eq!(status("a1"), TaskStatus::Succeeded);
    assert_eq!(status("a2"), TaskStatus::Succeeded);
    assert_eq!(status("a3"), TaskStatus::Succeeded);
    assert_eq!(status("b1"), TaskStatus::Running);
    assert_eq!(status("b2"), TaskStatus::Running);
    assert_eq!(status("c1"), TaskStatus::Pending);

    // Resume on a fresh backend: only b1, b2, c1..c3 are re-invoked.
    let server = SimulatedServer::new();
    let pool = sim_pool(&server, &["prod"], 4);
    let summary = execute_run(pool, request(tasks, dir.path(), true), None)
        .await
        .unwrap();

    assert_eq!(summary.total, 8);
    assert_eq!(summary.succeeded, 8);
    assert!(summary.overall_success());
    assert_eq!(server.executed_calls().len(), 5);
    let invoked: Vec<String> = server
        .executed_calls()
        .iter()
        .map(|c| c.session_tag.split(':').nth(1).unwrap().to_string())
        .collect();
    assert!(!invoked.iter().any(|id| id.starts_with('a')));

    // A fully successful run removes the authoritative checkpoint.
    assert!(!snapshot_path.exists());
}

/// Resuming against a modified task file is refused without force.
#[tokio::test(start_paused = true)]
async fn resume_refuses_modified_taskfile() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = write_workflow(dir.path(), "resume.txt", WORKFLOW);

    {
        let server = SimulatedServer::new();
        let pool = sim_pool(&server, &["prod"], 4);
        let run = execute_run(pool, request(tasks.clone(), dir.path(), false), None);
        tokio::select! {
            _ = run => panic!("run should not finish before the interrupt"),
            _ = tokio::time::sleep(Duration::from_millis(3500)) => {}
        }
    }

    std::fs::write(&tasks, "id=z predecessors= instance=prod process=quick\n").unwrap();
    let server = SimulatedServer::new();
    let pool = sim_pool(&server, &["prod"], 4);
    let err = execute_run(pool, request(tasks, dir.path(), true), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        rushti::errors::RushtiError::CheckpointMismatch { .. }
    ));
}

/// Without a checkpoint on disk, resume is a clean error.
#[tokio::test]
async fn resume_without_checkpoint_fails() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = write_workflow(dir.path(), "fresh.txt", WORKFLOW);
    let server = SimulatedServer::new();
    let pool = sim_pool(&server, &["prod"], 4);

    let err = execute_run(pool, request(tasks, dir.path(), true), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        rushti::errors::RushtiError::CheckpointNotFound(_)
    ));
}

/// A failed run retains its checkpoint for a later resume.
#[tokio::test(start_paused = true)]
async fn failed_run_retains_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = write_workflow(
        dir.path(),
        "fails.txt",
        "id=x predecessors= instance=prod process=broken\n",
    );

    let server = SimulatedServer::new();
    server.fail_process("broken");
    let pool = sim_pool(&server, &["prod"], 2);

    let summary = execute_run(pool, request(tasks, dir.path(), false), None)
        .await
        .unwrap();
    assert_eq!(summary.failed, 1);

    let snapshot = Checkpoint::load(&checkpoint_path(dir.path(), "fails")).unwrap();
    assert_eq!(
        snapshot.tasks.get("x").unwrap().status,
        TaskStatus::Failed
    );
}

// tests/commands.rs

//! The library command surface: validate, expand, analyze.

mod common;

use std::sync::Arc;

use rushti::remote::sim::SimulatedServer;
use rushti::remote::ClientPool;
use rushti::taskfile;

use common::{sim_pool, test_settings, write_workflow};

#[tokio::test]
async fn validate_reports_structural_and_remote_problems() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = write_workflow(
        dir.path(),
        "wf.txt",
        "\
id=a predecessors= instance=prod process=real
id=b predecessors=a instance=prod process=ghost
",
    );

    // Structural only: fine.
    let report = rushti::validate(&tasks, None).await.unwrap();
    assert!(report.is_ok());

    // With a remote probe, the missing process surfaces as an error.
    let server = SimulatedServer::new();
    server.missing_process("ghost");
    let pool = sim_pool(&server, &["prod"], 2);
    let report = rushti::validate(&tasks, Some(&pool)).await.unwrap();
    assert!(!report.is_ok());
    assert!(report.errors[0].contains("ghost"));
}

#[tokio::test]
async fn validate_rejects_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = write_workflow(
        dir.path(),
        "cycle.txt",
        "\
id=a predecessors=b instance=prod process=p
id=b predecessors=a instance=prod process=p
",
    );
    let err = rushti::validate(&tasks, None).await.unwrap_err();
    assert!(matches!(err, rushti::errors::RushtiError::Cycle(_)));
}

#[tokio::test]
async fn expand_emits_structured_form_with_children() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = write_workflow(
        dir.path(),
        "template.txt",
        concat!(
            "id=load predecessors= instance=prod process=load.region ",
            "pRegion*=\"*{ regions }\"\n",
            "id=report predecessors=load instance=prod process=report\n",
        ),
    );

    let server = SimulatedServer::new();
    server.set_members("regions", &["APAC", "EMEA"]);
    let pool = sim_pool(&server, &["prod"], 2);

    let output = dir.path().join("expanded.json");
    rushti::expand(pool, &tasks, &output).await.unwrap();

    let expanded = taskfile::load(&output).unwrap();
    let ids: Vec<&str> = expanded.tasks.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["load_APAC", "load_EMEA", "report"]);
    let report = expanded.tasks.iter().find(|t| t.id == "report").unwrap();
    assert_eq!(report.predecessors, vec!["load_APAC", "load_EMEA"]);
    assert!(expanded.metadata.expanded_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn analyze_rewrites_from_archived_run() {
    use rushti::engine::{execute_run, RunRequest};
    use rushti::settings::CliOverrides;

    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());

    // Two real runs build up history and an archived workflow.
    let tasks = write_workflow(
        dir.path(),
        "hist.txt",
        "\
id=1 predecessors= instance=prod process=load pCube=sales pWaitSec=1
id=2 predecessors= instance=prod process=load pCube=stock pWaitSec=1
",
    );
    for _ in 0..2 {
        let server = SimulatedServer::new();
        let pool = sim_pool(&server, &["prod"], 2);
        execute_run(
            pool,
            RunRequest {
                taskfile_path: tasks.clone(),
                cli: CliOverrides {
                    max_workers: Some(2),
                    ..CliOverrides::default()
                },
                settings: settings.clone(),
                force: false,
                resume: false,
            },
            None,
        )
        .await
        .unwrap();
    }

    // Two near-identical groups cannot produce heavy outliers, so no chain
    // edges are added, but the rewrite still lands.
    let output = dir.path().join("rewritten.json");
    let report = rushti::analyze(&settings, "hist", None, &output, None).unwrap();
    assert!(report.predecessor_map.is_empty());
    assert!(!report.warnings.is_empty());
    assert!(output.exists());

    // Both signatures have two runs of history behind their estimates.
    assert_eq!(report.signature_estimates.len(), 2);
    assert!(report
        .signature_estimates
        .iter()
        .all(|e| !e.estimated && e.sample_count == 2));
    let mean = report.mean_confidence();
    assert!(mean > 0.0 && mean <= 1.0);

    let rewritten = taskfile::load(&output).unwrap();
    assert_eq!(rewritten.tasks.len(), 2);
}

#[tokio::test]
async fn expand_without_directives_needs_no_remote() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = write_workflow(
        dir.path(),
        "plain.txt",
        "instance=prod process=p pWaitSec=1\n",
    );
    let output = dir.path().join("plain.json");
    rushti::expand(Arc::new(ClientPool::new()), &tasks, &output)
        .await
        .unwrap();
    assert!(taskfile::load(&output).is_ok());
}

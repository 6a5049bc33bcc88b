// src/main.rs

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use rushti::cli::{self, Command};
use rushti::engine::{execute_run, ControlSignal, RunRequest};
use rushti::errors::{RushtiError, EXIT_FATAL};
use rushti::remote::sim::SimulatedServer;
use rushti::remote::ClientPool;
use rushti::settings::Settings;
use rushti::{logging, taskfile};

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::parse();
    logging::init_logging(args.log_level);

    let settings = match Settings::load_or_default(args.settings.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("rushti error: {err}");
            return ExitCode::from(EXIT_FATAL as u8);
        }
    };

    let code = match run_command(args.command, settings).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("rushti error: {err}");
            err.exit_code()
        }
    };
    ExitCode::from(code as u8)
}

async fn run_command(command: Command, settings: Settings) -> Result<i32, RushtiError> {
    match command {
        Command::Run(run_args) => start_run(run_args, settings, false).await,
        Command::Resume(run_args) => start_run(run_args, settings, true).await,
        Command::Validate {
            tasks,
            remote,
            simulate,
        } => {
            let pool = if remote {
                Some(build_pool(&tasks, simulate, &settings)?)
            } else {
                None
            };
            let report = rushti::validate(&tasks, pool.as_deref()).await?;

            for warning in &report.warnings {
                println!("warning: {warning}");
            }
            for error in &report.errors {
                println!("error: {error}");
            }
            if report.is_ok() {
                println!("workflow is valid");
                Ok(0)
            } else {
                Ok(EXIT_FATAL)
            }
        }
        Command::Expand {
            tasks,
            output,
            simulate,
        } => {
            // A file without expansion directives converts offline.
            let pool = if taskfile::needs_expansion(&taskfile::load(&tasks)?) {
                build_pool(&tasks, simulate, &settings)?
            } else {
                Arc::new(ClientPool::new())
            };
            rushti::expand(pool, &tasks, &output).await?;
            Ok(0)
        }
        Command::Analyze {
            workflow,
            tasks,
            output,
            sensitivity,
        } => {
            let output = output
                .unwrap_or_else(|| settings.base_dir.join(format!("{workflow}_optimized.json")));
            let report =
                rushti::analyze(&settings, &workflow, tasks.as_deref(), &output, sensitivity)?;

            match &report.driver {
                Some(driver) => {
                    println!("contention driver: {driver}");
                    println!("heavy groups: {}", report.heavy_groups.len());
                    println!("chain edges added: {}", report.predecessor_map.len());
                }
                None => println!("no contention driver detected; reordered longest-first"),
            }
            if !report.signature_estimates.is_empty() {
                let with_history = report
                    .signature_estimates
                    .iter()
                    .filter(|e| !e.estimated)
                    .count();
                println!(
                    "runtime estimates: {} signatures ({} with history, mean confidence {:.2})",
                    report.signature_estimates.len(),
                    with_history,
                    report.mean_confidence()
                );
                for estimate in report.signature_estimates.iter().filter(|e| e.estimated) {
                    println!(
                        "  {}: no history, assuming {:.1}s",
                        estimate.signature, estimate.ewma_seconds
                    );
                }
            }
            if report.recommended_workers > 0 {
                println!("recommended max_workers: {}", report.recommended_workers);
            }
            for warning in &report.warnings {
                println!("warning: {warning}");
            }
            println!("rewritten workflow: {}", output.display());
            Ok(0)
        }
    }
}

/// Execute or resume a run with Ctrl-C wired to graceful stop: the first
/// interrupt drains in-flight tasks, the second cancels them remotely.
async fn start_run(
    run_args: cli::RunArgs,
    settings: Settings,
    resume: bool,
) -> Result<i32, RushtiError> {
    let pool = build_pool(&run_args.tasks, run_args.simulate, &settings)?;

    let (control_tx, control_rx) = tokio::sync::mpsc::channel(2);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = control_tx.send(ControlSignal::Stop).await;
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = control_tx.send(ControlSignal::Abort).await;
        }
    });

    let summary = execute_run(
        pool,
        RunRequest {
            taskfile_path: run_args.tasks.clone(),
            cli: run_args.overrides(),
            settings,
            force: run_args.force,
            resume,
        },
        Some(control_rx),
    )
    .await?;
    Ok(summary.exit_code())
}

/// Register one client per instance referenced by the workflow file.
///
/// The core is transport-agnostic: real deployments construct their own
/// `RemoteClient` adapter and use rushti as a library. The binary ships the
/// simulated backend (`--simulate`) for workflow dry runs and testing.
fn build_pool(
    taskfile_path: &Path,
    simulate: bool,
    settings: &Settings,
) -> Result<Arc<ClientPool>, RushtiError> {
    if !simulate {
        return Err(RushtiError::Config(
            "no remote client adapter is configured; pass --simulate for a local dry run \
             or embed rushti as a library with your RemoteClient implementation"
                .to_string(),
        ));
    }

    let tf = taskfile::load(taskfile_path)?;
    let max_workers = tf
        .settings
        .max_workers
        .unwrap_or(settings.defaults.max_workers);

    let server = SimulatedServer::new();
    let mut pool = ClientPool::new();
    let mut seen = std::collections::BTreeSet::new();
    for task in &tf.tasks {
        if seen.insert(task.instance.clone()) {
            pool.register(task.instance.clone(), server.client(), max_workers);
        }
    }
    Ok(Arc::new(pool))
}

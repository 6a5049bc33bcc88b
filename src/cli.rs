// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::engine::OrderingPolicy;
use crate::settings::CliOverrides;

/// Command-line arguments for `rushti`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "rushti",
    version,
    about = "Run workflows of remote analytical processes in parallel.",
    long_about = None
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the settings file (TOML).
    #[arg(long, value_name = "PATH", global = true)]
    pub settings: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `RUSHTI_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Execute a workflow.
    Run(RunArgs),
    /// Resume a workflow from its checkpoint.
    Resume(RunArgs),
    /// Validate a workflow file (structural, optionally remote).
    Validate {
        /// Path to the workflow file.
        #[arg(long, value_name = "PATH")]
        tasks: PathBuf,
        /// Also probe each (instance, process) pair against the remote.
        #[arg(long)]
        remote: bool,
        /// Run against the built-in simulated server.
        #[arg(long)]
        simulate: bool,
    },
    /// Apply parametric expansion and emit the structured form.
    Expand {
        /// Path to the workflow file.
        #[arg(long, value_name = "PATH")]
        tasks: PathBuf,
        /// Output path for the expanded structured file.
        #[arg(long, value_name = "PATH")]
        output: PathBuf,
        /// Run against the built-in simulated server.
        #[arg(long)]
        simulate: bool,
    },
    /// Rewrite a workflow from execution history (contention analysis).
    Analyze {
        /// Workflow name to analyze.
        #[arg(long, value_name = "NAME")]
        workflow: String,
        /// Workflow file to rewrite (defaults to the archived copy of the
        /// last successful run).
        #[arg(long, value_name = "PATH")]
        tasks: Option<PathBuf>,
        /// Output path for the rewritten workflow.
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
        /// IQR sensitivity multiplier for heavy-group detection.
        #[arg(long, value_name = "K")]
        sensitivity: Option<f64>,
    },
}

/// Flags shared by `run` and `resume`.
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Path to the workflow file.
    #[arg(long, value_name = "PATH")]
    pub tasks: PathBuf,

    /// Maximum number of concurrently executing tasks.
    #[arg(long, value_name = "N")]
    pub max_workers: Option<usize>,

    /// Retries for transient remote failures.
    #[arg(long, value_name = "N")]
    pub retries: Option<u32>,

    /// Legacy flag; execution mode is auto-detected from file content.
    #[arg(long, value_name = "MODE", hide = true)]
    pub mode: Option<String>,

    /// Output path for the per-task result file (CSV).
    #[arg(long, value_name = "PATH")]
    pub result: Option<String>,

    /// Require that no other tagged run is active on any instance.
    #[arg(long)]
    pub exclusive: bool,

    /// Bypass exclusive-lock, checkpoint-mismatch and unsafe-resume checks.
    #[arg(long)]
    pub force: bool,

    /// Ordering policy for ready tasks.
    #[arg(long, value_enum, value_name = "POLICY")]
    pub optimize: Option<OptimizeArg>,

    /// Disable checkpointing for this run.
    #[arg(long)]
    pub no_checkpoint: bool,

    /// Run against the built-in simulated server instead of real
    /// instances (processes sleep for their `pWaitSec` parameter).
    #[arg(long)]
    pub simulate: bool,
}

impl RunArgs {
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            max_workers: self.max_workers,
            retries: self.retries,
            result_file: self.result.clone(),
            exclusive: self.exclusive.then_some(true),
            ordering_policy: self.optimize.map(OrderingPolicy::from),
            no_checkpoint: self.no_checkpoint,
        }
    }
}

/// Ordering policy as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum OptimizeArg {
    LongestFirst,
    ShortestFirst,
}

impl From<OptimizeArg> for OrderingPolicy {
    fn from(arg: OptimizeArg) -> Self {
        match arg {
            OptimizeArg::LongestFirst => OrderingPolicy::LongestFirst,
            OptimizeArg::ShortestFirst => OrderingPolicy::ShortestFirst,
        }
    }
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

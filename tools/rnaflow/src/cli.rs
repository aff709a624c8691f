//! Command-line interface definitions for rnaflow.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::Backend;

/// Declarative RNA-seq variant-calling workflow engine.
#[derive(Parser)]
#[command(name = "rnaflow", version, about)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Path to rnaflow.toml (default: searched upward from the current directory).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Rule script to evaluate (default: rnaflow.rhai in the project root).
    #[arg(long, global = true)]
    pub script: Option<PathBuf>,

    /// Rerun every node, ignoring timestamps and fingerprints.
    #[arg(long, short = 'f', global = true)]
    pub force: bool,

    /// Rerun every node of the named rule. May be repeated.
    #[arg(long, value_name = "RULE", global = true)]
    pub forcerun: Vec<String>,

    /// Suppress per-step output; show only errors and the final summary.
    #[arg(long, short = 'q', global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Enable verbose output with stale reasons, commands and timings.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Maximum number of concurrent jobs (default: the core budget).
    #[arg(long, short = 'j', global = true)]
    pub jobs: Option<usize>,

    /// Thread budget shared by running jobs (default: available CPUs).
    #[arg(long, short = 'c', global = true)]
    pub cores: Option<u32>,

    /// Memory budget in MiB shared by running jobs.
    #[arg(long, global = true)]
    pub mem_mb: Option<u64>,

    /// Where to run shell steps.
    #[arg(long, value_enum, global = true)]
    pub backend: Option<Backend>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Build targets (default: the targets declared by the rule script).
    Run(RunArgs),
    /// List the nodes a run would execute, and why.
    Plan(TargetArgs),
    /// Print the task graph.
    Graph(GraphArgs),
    /// Print the discovered samples.
    Samples,
    /// Print the resolved configuration.
    Config,
    /// Remove declared outputs, logs and engine state.
    Clean(CleanArgs),
}

/// Explicit target paths overriding the script's targets.
#[derive(Parser)]
pub struct TargetArgs {
    /// Target paths, relative to the project root.
    pub targets: Vec<String>,
}

/// Arguments for the `run` subcommand.
#[derive(Parser)]
pub struct RunArgs {
    #[command(flatten)]
    pub targets: TargetArgs,

    /// Keep running independent nodes after a failure.
    #[arg(long, short = 'k')]
    pub keep_going: bool,

    /// Default wall-clock limit per step, in seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Print the plan instead of running it.
    #[arg(long, short = 'n')]
    pub dry_run: bool,
}

/// Graph output formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum GraphFormat {
    Dot,
    Text,
}

/// Arguments for the `graph` subcommand.
#[derive(Parser)]
pub struct GraphArgs {
    #[command(flatten)]
    pub targets: TargetArgs,

    #[arg(long, value_enum, default_value = "text")]
    pub format: GraphFormat,
}

/// Arguments for the `clean` subcommand.
#[derive(Parser)]
pub struct CleanArgs {
    #[command(flatten)]
    pub targets: TargetArgs,

    /// Actually delete; without it the files are only listed.
    #[arg(long, short = 'y')]
    pub yes: bool,
}

//! rnaflow: declarative RNA-seq variant-calling workflow engine.
//!
//! Reads a project's `rnaflow.toml` and rule script, discovers samples from
//! the input file names, resolves the requested targets into a task graph
//! and runs the stale part of it on a bounded worker pool.
//!
//! Pipeline: resolve rnaflow.toml → evaluate rnaflow.rhai → validate model →
//!           register rules → discover samples → expand targets →
//!           build graph → check staleness → schedule → run shell steps.

mod cache;
mod cli;
mod config;
mod discover;
mod engine;
mod error;
mod executor;
mod graph;
mod model;
mod pattern;
mod registry;
mod runner;
mod scheduler;
mod signal;
mod template;
mod validate;
mod verbose;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use clap::Parser;

use cache::{FingerprintManifest, ForcePolicy};
use config::{Backend, Overrides, ResolvedConfig};
use executor::{ClusterExecutor, LocalExecutor};
use graph::{Dag, GraphOptions};
use model::WorkflowModel;
use pattern::{Bindings, Pattern};
use registry::RuleRegistry;
use scheduler::SchedulerOptions;
use verbose::{Timer, dprintln};

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    verbose::init(cli.quiet, cli.verbose);

    match cli.command {
        cli::Command::Run(ref args) => cmd_run(&cli, args),
        cli::Command::Plan(ref args) => cmd_plan(&cli, args),
        cli::Command::Graph(ref args) => cmd_graph(&cli, args),
        cli::Command::Samples => cmd_samples(&cli),
        cli::Command::Config => cmd_config(&cli),
        cli::Command::Clean(ref args) => cmd_clean(&cli, args),
    }
}

// ===========================================================================
// Pipeline loading
// ===========================================================================

/// Everything derived from the project before any graph is built.
struct Pipeline {
    config: ResolvedConfig,
    model: WorkflowModel,
    registry: RuleRegistry,
    /// Discovered wildcard tuples, sorted.
    samples: Vec<Bindings>,
}

/// Locate the project, make it the working directory and resolve its config.
///
/// All pipeline paths are relative to the project root from here on.
fn resolve_config(cli: &cli::Cli, run: Option<&cli::RunArgs>) -> Result<ResolvedConfig> {
    let config_path = cli
        .config
        .as_deref()
        .map(|p| {
            p.canonicalize()
                .with_context(|| format!("failed to open {}", p.display()))
        })
        .transpose()?;
    let script = cli.script.as_deref().map(std::path::absolute).transpose()?;

    let root = match &config_path {
        Some(path) => path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/")),
        None => config::find_project_root()?,
    };
    std::env::set_current_dir(&root)
        .with_context(|| format!("failed to enter project root {}", root.display()))?;

    let overrides = Overrides {
        config_path,
        script,
        cores: cli.cores,
        jobs: cli.jobs,
        mem_mb: cli.mem_mb,
        backend: cli.backend,
        timeout_secs: run.and_then(|r| r.timeout),
        keep_going: run.is_some_and(|r| r.keep_going),
    };
    config::load_config(&root, &overrides)
}

/// Evaluate the rule script, validate it, register rules and discover samples.
fn load_pipeline(config: ResolvedConfig) -> Result<Pipeline> {
    tracing::debug!("loading {}", config.script.display());
    let model = {
        let _t = Timer::start("script evaluation");
        engine::evaluate_script(&config)?
    };
    validate::validate_model(&model, &config.values)?;
    let registry = RuleRegistry::from_defs(&model.rules)?;

    let samples = match model.samples.first() {
        Some(decl) => {
            let _t = Timer::start("sample discovery");
            let patterns = decl
                .patterns
                .iter()
                .map(|p| Pattern::parse(p))
                .collect::<Result<Vec<_>, _>>()?;
            discover::discover(Path::new(&decl.dir), &patterns)?
        }
        None => Vec::new(),
    };
    tracing::debug!(
        rules = registry.len(),
        samples = samples.len(),
        "pipeline loaded"
    );

    Ok(Pipeline {
        config,
        model,
        registry,
        samples,
    })
}

/// Concrete target paths: the command-line ones, or the script's targets
/// expanded over the discovered samples.
fn target_paths(pipeline: &Pipeline, explicit: &[String]) -> Result<Vec<String>> {
    let texts = if explicit.is_empty() {
        pipeline.model.targets.as_slice()
    } else {
        explicit
    };
    ensure!(
        !texts.is_empty(),
        "no targets: declare target() in the rule script or pass paths on the command line"
    );
    let patterns = texts
        .iter()
        .map(|t| Pattern::parse(t))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(discover::expand_targets(&patterns, &pipeline.samples)?)
}

fn build_dag(pipeline: &Pipeline, explicit: &[String]) -> Result<Dag> {
    let targets = target_paths(pipeline, explicit)?;
    let _t = Timer::start("graph construction");
    let dag = graph::build(
        &pipeline.registry,
        &targets,
        &GraphOptions {
            config: &pipeline.config.values,
            default_timeout: pipeline.config.timeout,
        },
    )?;
    Ok(dag)
}

fn force_policy(cli: &cli::Cli, registry: &RuleRegistry) -> Result<ForcePolicy> {
    for rule in &cli.forcerun {
        ensure!(
            registry.by_name(rule).is_some(),
            "--forcerun: no rule named '{rule}'"
        );
    }
    Ok(ForcePolicy {
        all: cli.force,
        rules: cli.forcerun.iter().cloned().collect(),
    })
}

// ===========================================================================
// Commands
// ===========================================================================

/// Build the requested targets.
fn cmd_run(cli: &cli::Cli, args: &cli::RunArgs) -> Result<()> {
    let pipeline = load_pipeline(resolve_config(cli, Some(args))?)?;
    let dag = build_dag(&pipeline, &args.targets.targets)?;
    let force = force_policy(cli, &pipeline.registry)?;
    let config = &pipeline.config;
    let state_dir = config.state_dir();
    let mut manifest = FingerprintManifest::load(&state_dir);

    if args.dry_run {
        print_plan(&dag, &manifest, &force);
        return Ok(());
    }

    signal::install_interrupt_handler().context("failed to install the SIGINT handler")?;

    let opts = SchedulerOptions {
        jobs: config.jobs,
        cores: config.cores,
        mem_mb: config.mem_mb,
        keep_going: config.keep_going,
        force,
    };
    dprintln!(
        "Running {} node(s) for {} sample(s) with {} job(s), {} core(s)",
        dag.len(),
        pipeline.samples.len(),
        opts.jobs,
        opts.cores
    );

    let cancel = signal::interrupt_flag();
    let result = match config.backend {
        Backend::Local => {
            let executor = LocalExecutor::new(config.shell.clone());
            scheduler::execute(&dag, &executor, &mut manifest, &config.values, &opts, cancel)
        }
        Backend::Cluster => {
            let cluster = config
                .cluster
                .clone()
                .context("backend 'cluster' requires a [cluster] section")?;
            let executor = ClusterExecutor::new(cluster, config.shell.clone());
            scheduler::execute(&dag, &executor, &mut manifest, &config.values, &opts, cancel)
        }
    };

    // Completed nodes are recorded even if the run as a whole failed.
    manifest.save(&state_dir)?;
    let summary = result?;
    summary.print(&dag);

    if summary.interrupted {
        bail!("run interrupted");
    }
    if !summary.is_success() {
        bail!(
            "{} node(s) failed, {} blocked",
            summary.count(scheduler::NodeState::Failed),
            summary.count(scheduler::NodeState::Blocked)
        );
    }
    Ok(())
}

/// List the nodes a run would execute.
fn cmd_plan(cli: &cli::Cli, args: &cli::TargetArgs) -> Result<()> {
    let pipeline = load_pipeline(resolve_config(cli, None)?)?;
    let dag = build_dag(&pipeline, &args.targets)?;
    let force = force_policy(cli, &pipeline.registry)?;
    let manifest = FingerprintManifest::load(&pipeline.config.state_dir());
    print_plan(&dag, &manifest, &force);
    Ok(())
}

fn print_plan(dag: &Dag, manifest: &FingerprintManifest, force: &ForcePolicy) {
    let planned = cache::plan(dag, manifest, force);
    if planned.is_empty() {
        println!("Nothing to do: all {} node(s) up to date.", dag.len());
    } else {
        println!("{} of {} node(s) would run:", planned.len(), dag.len());
        for (id, reason) in &planned {
            println!("  {:<40} {reason}", dag.nodes[*id].label());
        }
    }

    let missing: Vec<&PathBuf> = dag.root_inputs.iter().filter(|p| !p.exists()).collect();
    if !missing.is_empty() {
        println!("\nMissing inputs:");
        for path in missing {
            println!("  {}", path.display());
        }
    }
}

/// Print the task graph.
fn cmd_graph(cli: &cli::Cli, args: &cli::GraphArgs) -> Result<()> {
    let pipeline = load_pipeline(resolve_config(cli, None)?)?;
    let dag = build_dag(&pipeline, &args.targets.targets)?;
    match args.format {
        cli::GraphFormat::Dot => print!("{}", dag.to_dot()),
        cli::GraphFormat::Text => print!("{}", dag.to_text()),
    }
    Ok(())
}

/// Print the discovered samples.
fn cmd_samples(cli: &cli::Cli) -> Result<()> {
    let pipeline = load_pipeline(resolve_config(cli, None)?)?;
    let Some(decl) = pipeline.model.samples.first() else {
        println!("The rule script declares no samples().");
        return Ok(());
    };
    println!("{} sample(s) in {}:", pipeline.samples.len(), decl.dir);
    for tuple in &pipeline.samples {
        println!("  {}", pattern::describe(tuple));
    }
    Ok(())
}

/// Print the resolved configuration.
fn cmd_config(cli: &cli::Cli) -> Result<()> {
    let resolved = resolve_config(cli, None)?;
    config::print_resolved(&resolved);
    Ok(())
}

/// Remove declared outputs, logs and engine state.
fn cmd_clean(cli: &cli::Cli, args: &cli::CleanArgs) -> Result<()> {
    let pipeline = load_pipeline(resolve_config(cli, None)?)?;
    let dag = build_dag(&pipeline, &args.targets.targets)?;

    let mut doomed: BTreeSet<PathBuf> = BTreeSet::new();
    for node in &dag.nodes {
        doomed.extend(node.outputs.iter().map(|o| o.path.clone()));
        doomed.insert(node.log.clone());
    }
    doomed.insert(pipeline.config.state_dir());
    doomed.retain(|p| p.symlink_metadata().is_ok());

    if doomed.is_empty() {
        println!("Nothing to clean.");
        return Ok(());
    }
    if !args.yes {
        println!("Would remove {} path(s):", doomed.len());
        for path in &doomed {
            println!("  {}", path.display());
        }
        println!("\nRe-run with --yes to delete them.");
        return Ok(());
    }

    for path in &doomed {
        runner::remove_path(path).with_context(|| format!("failed to remove {}", path.display()))?;
        verbose::vprintln!("  removed {}", path.display());
    }
    dprintln!("Removed {} path(s).", doomed.len());
    Ok(())
}

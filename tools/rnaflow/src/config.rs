//! Pipeline configuration.
//!
//! Parses `rnaflow.toml` from the project root and merges command-line
//! overrides into a [`ResolvedConfig`]. The resolved config is passed
//! explicitly to script evaluation, graph building and scheduling.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use serde::Deserialize;

/// Configuration file searched for in the current directory and its parents.
pub const CONFIG_FILE: &str = "rnaflow.toml";

/// Rule script evaluated when `[paths] script` is not set.
pub const DEFAULT_SCRIPT: &str = "rnaflow.rhai";

/// Top-level configuration loaded from `rnaflow.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub cluster: Option<ClusterConfig>,
    /// Free-form values exposed to scripts and command templates.
    #[serde(default)]
    pub config: BTreeMap<String, toml::Value>,
}

/// `[paths]` section.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PathsConfig {
    #[serde(default = "default_input_root")]
    pub input_root: String,
    #[serde(default = "default_output_root")]
    pub output_root: String,
    /// Reference genome FASTA.
    pub genome: Option<String>,
    /// Gene annotation (GTF).
    pub annotation: Option<String>,
    pub script: Option<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_root: default_input_root(),
            output_root: default_output_root(),
            genome: None,
            annotation: None,
            script: None,
        }
    }
}

fn default_input_root() -> String {
    "reads".into()
}

fn default_output_root() -> String {
    "results".into()
}

/// `[resources]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ResourcesConfig {
    /// Total thread budget shared by running nodes.
    pub cores: Option<u32>,
    /// Maximum number of concurrently running nodes.
    pub jobs: Option<usize>,
    /// Total memory budget in MiB.
    pub mem_mb: Option<u64>,
}

/// `[execution]` section.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "default_shell")]
    pub shell: String,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub keep_going: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            shell: default_shell(),
            timeout_secs: None,
            keep_going: false,
        }
    }
}

fn default_shell() -> String {
    "bash".into()
}

/// Execution backend selection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Run shell steps as local subprocesses.
    #[default]
    Local,
    /// Submit shell steps to a batch scheduler.
    Cluster,
}

/// `[cluster]` section: command templates for a batch scheduler.
///
/// `submit` may use `{cmd}`, `{name}`, `{log}`, `{threads}` and `{mem_mb}`;
/// `status` and `cancel` may use `{jobid}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ClusterConfig {
    pub submit: String,
    pub status: String,
    pub cancel: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// `{mem_mb}` for rules that declare no memory.
    pub default_mem_mb: Option<u64>,
}

fn default_poll_interval() -> u64 {
    10
}

/// Command-line values that take precedence over `rnaflow.toml`.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub config_path: Option<PathBuf>,
    pub script: Option<PathBuf>,
    pub cores: Option<u32>,
    pub jobs: Option<usize>,
    pub mem_mb: Option<u64>,
    pub backend: Option<Backend>,
    pub timeout_secs: Option<u64>,
    pub keep_going: bool,
}

/// Fully resolved configuration with defaults and overrides applied.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub root: PathBuf,
    pub script: PathBuf,
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    pub genome: Option<PathBuf>,
    pub annotation: Option<PathBuf>,
    pub cores: u32,
    pub jobs: usize,
    pub mem_mb: Option<u64>,
    pub backend: Backend,
    pub shell: String,
    pub timeout: Option<Duration>,
    pub keep_going: bool,
    pub cluster: Option<ClusterConfig>,
    /// Values for `CONFIG` in scripts and `{config.KEY}` in templates.
    pub values: BTreeMap<String, String>,
}

impl ResolvedConfig {
    /// Directory holding engine state (fingerprint manifest).
    pub fn state_dir(&self) -> PathBuf {
        self.output_root.join(".rnaflow")
    }
}

/// Walk up from the current directory to find the directory containing
/// `rnaflow.toml`.
pub fn find_project_root() -> Result<PathBuf> {
    find_project_root_from(&std::env::current_dir()?)
}

pub fn find_project_root_from(start: &Path) -> Result<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join(CONFIG_FILE).exists() {
            return Ok(dir);
        }
        if !dir.pop() {
            bail!("could not find {CONFIG_FILE} in any parent directory");
        }
    }
}

/// Load `rnaflow.toml` (or the overriding path) and resolve it.
pub fn load_config(root: &Path, overrides: &Overrides) -> Result<ResolvedConfig> {
    let toml_path = overrides
        .config_path
        .clone()
        .unwrap_or_else(|| root.join(CONFIG_FILE));
    let contents = std::fs::read_to_string(&toml_path)
        .with_context(|| format!("failed to read {}", toml_path.display()))?;
    let project: ProjectConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse {}", toml_path.display()))?;
    resolve(project, root, overrides)
}

/// Apply defaults and overrides to a parsed config.
pub fn resolve(project: ProjectConfig, root: &Path, overrides: &Overrides) -> Result<ResolvedConfig> {
    let ProjectConfig {
        paths,
        resources,
        execution,
        cluster,
        config,
    } = project;

    let cores = match overrides.cores.or(resources.cores) {
        Some(n) => n,
        None => std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(4),
    };
    ensure!(cores >= 1, "the core budget must be at least 1");

    let jobs = overrides.jobs.or(resources.jobs).unwrap_or(cores as usize);
    ensure!(jobs >= 1, "at least one concurrent job is required");

    let mem_mb = overrides.mem_mb.or(resources.mem_mb);
    if let Some(mem) = mem_mb {
        ensure!(mem >= 1, "the memory budget must be at least 1 MiB");
    }

    let backend = overrides.backend.unwrap_or(execution.backend);
    if backend == Backend::Cluster && cluster.is_none() {
        bail!("backend 'cluster' requires a [cluster] section with submit and status commands");
    }
    if let Some(cluster) = &cluster {
        ensure!(
            cluster.default_mem_mb != Some(0),
            "[cluster] default-mem-mb must be positive"
        );
    }

    let timeout_secs = overrides.timeout_secs.or(execution.timeout_secs);
    if timeout_secs == Some(0) {
        bail!("timeout-secs must be positive");
    }

    let script = overrides
        .script
        .clone()
        .or_else(|| paths.script.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SCRIPT));

    let mut values = BTreeMap::new();
    for (key, value) in &config {
        values.insert(key.clone(), value_to_string(key, value)?);
    }
    values.insert("input_root".into(), paths.input_root.clone());
    values.insert("output_root".into(), paths.output_root.clone());
    if let Some(ref genome) = paths.genome {
        values.insert("genome".into(), genome.clone());
    }
    if let Some(ref annotation) = paths.annotation {
        values.insert("annotation".into(), annotation.clone());
    }

    Ok(ResolvedConfig {
        root: root.to_path_buf(),
        script: root.join(script),
        input_root: PathBuf::from(paths.input_root),
        output_root: PathBuf::from(paths.output_root),
        genome: paths.genome.map(PathBuf::from),
        annotation: paths.annotation.map(PathBuf::from),
        cores,
        jobs,
        mem_mb,
        backend,
        shell: execution.shell,
        timeout: timeout_secs.map(Duration::from_secs),
        keep_going: overrides.keep_going || execution.keep_going,
        cluster,
        values,
    })
}

/// Flatten a `[config]` value into template text.
fn value_to_string(key: &str, value: &toml::Value) -> Result<String> {
    Ok(match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(b) => b.to_string(),
        toml::Value::Array(items) => items
            .iter()
            .map(|v| value_to_string(key, v))
            .collect::<Result<Vec<_>>>()?
            .join(" "),
        other => bail!("config value '{key}' has unsupported type {}", other.type_str()),
    })
}

/// Print resolved config to stdout.
pub fn print_resolved(config: &ResolvedConfig) {
    println!("Project root: {}", config.root.display());
    println!("  script: {}", config.script.display());
    println!("  input-root: {}", config.input_root.display());
    println!("  output-root: {}", config.output_root.display());
    if let Some(ref genome) = config.genome {
        println!("  genome: {}", genome.display());
    }
    if let Some(ref annotation) = config.annotation {
        println!("  annotation: {}", annotation.display());
    }
    println!("Resources:");
    println!("  cores: {}", config.cores);
    println!("  jobs: {}", config.jobs);
    if let Some(mem) = config.mem_mb {
        println!("  mem-mb: {mem}");
    }
    println!("Execution:");
    println!("  backend: {:?}", config.backend);
    println!("  shell: {}", config.shell);
    if let Some(timeout) = config.timeout {
        println!("  timeout: {timeout:?}");
    }
    println!("  keep-going: {}", config.keep_going);
    println!("\nConfig values:");
    for (name, value) in &config.values {
        println!("  {name} = {value}");
    }
}

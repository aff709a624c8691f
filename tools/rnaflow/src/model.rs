//! Data model for workflow definitions.
//!
//! These types are populated by the Rhai engine during evaluation of
//! `rnaflow.rhai` and consumed by validation, the rule registry and the
//! graph builder. They hold pattern text only; nothing here is resolved
//! against concrete samples.

use std::collections::BTreeMap;

/// Complete workflow definition produced by script evaluation.
#[derive(Debug, Default, Clone)]
pub struct WorkflowModel {
    /// Rules in declaration order.
    pub rules: Vec<RuleDef>,
    /// Sample discovery declarations (`samples(dir, [...])`).
    pub samples: Vec<SampleDef>,
    /// Terminal target patterns, expanded over the discovered samples.
    pub targets: Vec<String>,
}

/// A declarative rule: how to produce outputs from inputs with one shell step.
#[derive(Debug, Clone)]
pub struct RuleDef {
    pub name: String,
    /// Named input patterns, in declaration order.
    pub inputs: Vec<NamedPattern>,
    /// Named output patterns, in declaration order.
    pub outputs: Vec<OutputDef>,
    /// Log file pattern. Defaults to the first output path plus `.log`.
    pub log: Option<String>,
    /// Parameter templates, rendered per node before the shell command.
    pub params: BTreeMap<String, String>,
    pub resources: ResourceSpec,
    /// Shell command template.
    pub shell: Option<String>,
    /// Wall-clock limit in seconds, overriding the global default.
    pub timeout_secs: Option<u64>,
}

impl RuleDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            log: None,
            params: BTreeMap::new(),
            resources: ResourceSpec::default(),
            shell: None,
            timeout_secs: None,
        }
    }
}

/// A pattern with the name it is referenced by in command templates.
///
/// Patterns declared without a name get their positional index (`"0"`,
/// `"1"`, ...) as name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedPattern {
    pub name: String,
    pub pattern: String,
}

/// A declared output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDef {
    pub name: String,
    pub pattern: String,
    pub kind: OutputKind,
}

/// Whether an output is a single file or a whole directory tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    File,
    Directory,
}

/// Resources a rule requests from the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSpec {
    /// Threads the command uses; counted against the core budget.
    pub threads: u32,
    /// Memory in MiB, counted against the optional memory budget.
    pub mem_mb: Option<u64>,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            threads: 1,
            mem_mb: None,
        }
    }
}

/// Where and how to discover samples.
#[derive(Debug, Clone)]
pub struct SampleDef {
    /// Directory to list, relative to the project root.
    pub dir: String,
    /// File-name patterns sharing the same wildcards.
    pub patterns: Vec<String>,
}

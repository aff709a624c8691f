//! Task graph construction.
//!
//! Starting from the terminal target paths, each path is reverse-resolved to
//! the rule that produces it, the rule's inputs are formatted with the
//! recovered bindings, and the process repeats until only root inputs (paths
//! no rule produces) remain. Nodes are memoized by `(rule, bindings)`, so a
//! shared step such as the genome index appears once no matter how many
//! samples consume it.
//!
//! Node ids are assigned in dependency post-order: every producer has a
//! smaller id than its consumers, so ascending id order is a valid
//! topological order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PipelineError, bail_config};
use crate::model::{OutputKind, ResourceSpec};
use crate::pattern::{Bindings, describe};
use crate::registry::{RuleId, RuleRegistry};
use crate::template::{self, TemplateContext};

/// Index of a node within the [`Dag`].
pub type NodeId = usize;

/// One declared output of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOutput {
    pub name: String,
    pub path: PathBuf,
    pub kind: OutputKind,
}

/// A rule instantiated for one set of wildcard bindings.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: NodeId,
    pub rule_name: String,
    pub wildcards: Bindings,
    pub inputs: Vec<(String, PathBuf)>,
    pub outputs: Vec<NodeOutput>,
    pub log: PathBuf,
    /// Params rendered for this node.
    pub params: BTreeMap<String, String>,
    pub resources: ResourceSpec,
    pub timeout: Option<Duration>,
    /// Shell command template, rendered by the runner.
    pub shell: String,
}

impl TaskNode {
    /// `rule[name=value,...]`, or just the rule name without wildcards.
    pub fn label(&self) -> String {
        if self.wildcards.is_empty() {
            self.rule_name.clone()
        } else {
            format!("{}[{}]", self.rule_name, describe(&self.wildcards))
        }
    }

    /// Template context with the given output paths substituted.
    ///
    /// The runner passes temporary paths here; everything else uses the
    /// declared paths.
    pub fn render_command(
        &self,
        outputs: &[(String, String)],
        config: &BTreeMap<String, String>,
    ) -> Result<String, PipelineError> {
        let inputs = path_pairs(&self.inputs);
        let log = self.log.to_string_lossy();
        let ctx = TemplateContext {
            rule: &self.rule_name,
            inputs: &inputs,
            outputs,
            wildcards: &self.wildcards,
            params: &self.params,
            threads: self.resources.threads,
            mem_mb: self.resources.mem_mb,
            log: &log,
            config,
        };
        template::render(&self.shell, &ctx)
    }
}

fn path_pairs(entries: &[(String, PathBuf)]) -> Vec<(String, String)> {
    entries
        .iter()
        .map(|(name, path)| (name.clone(), path.to_string_lossy().into_owned()))
        .collect()
}

/// The resolved task graph.
#[derive(Debug, Default)]
pub struct Dag {
    pub nodes: Vec<TaskNode>,
    /// Producers each node depends on, ascending.
    pub deps: Vec<Vec<NodeId>>,
    /// Consumers of each node, ascending.
    pub dependents: Vec<Vec<NodeId>>,
    /// Nodes producing the requested targets.
    pub targets: Vec<NodeId>,
    /// Input paths no rule produces; they must exist before their consumers run.
    pub root_inputs: BTreeSet<PathBuf>,
}

/// Settings the builder needs besides the registry.
pub struct GraphOptions<'a> {
    /// Config values for `{config.KEY}` in params.
    pub config: &'a BTreeMap<String, String>,
    /// Time limit for rules that declare none.
    pub default_timeout: Option<Duration>,
}

/// Build the task graph for a set of terminal target paths.
pub fn build(
    registry: &RuleRegistry,
    targets: &[String],
    options: &GraphOptions<'_>,
) -> Result<Dag, PipelineError> {
    let mut builder = Builder {
        registry,
        options,
        memo: HashMap::new(),
        stack: Vec::new(),
        producers: HashMap::new(),
        logs: HashMap::new(),
        dag: Dag::default(),
    };

    for target in targets {
        match registry.find_producer(target)? {
            Some((rule, bindings)) => {
                let id = builder.instantiate(rule, bindings)?;
                if !builder.dag.targets.contains(&id) {
                    builder.dag.targets.push(id);
                }
            }
            None if Path::new(target).exists() => {
                tracing::warn!("target {target} already exists and no rule produces it");
            }
            None => bail_config!("no rule produces target {target}"),
        }
    }

    let mut dag = builder.dag;
    dag.dependents = vec![Vec::new(); dag.nodes.len()];
    for (id, deps) in dag.deps.iter().enumerate() {
        for &dep in deps {
            dag.dependents[dep].push(id);
        }
    }
    tracing::debug!(
        nodes = dag.nodes.len(),
        roots = dag.root_inputs.len(),
        "task graph built"
    );
    Ok(dag)
}

struct Builder<'a> {
    registry: &'a RuleRegistry,
    options: &'a GraphOptions<'a>,
    memo: HashMap<(RuleId, Bindings), NodeId>,
    /// Instantiations in progress, for cycle detection.
    stack: Vec<(RuleId, Bindings)>,
    /// Output path → node that writes it.
    producers: HashMap<PathBuf, NodeId>,
    logs: HashMap<PathBuf, NodeId>,
    dag: Dag,
}

impl Builder<'_> {
    fn instantiate(&mut self, rule_id: RuleId, bindings: Bindings) -> Result<NodeId, PipelineError> {
        let key = (rule_id, bindings);
        if let Some(&id) = self.memo.get(&key) {
            return Ok(id);
        }
        if let Some(pos) = self.stack.iter().position(|k| *k == key) {
            let cycle: Vec<String> = self.stack[pos..]
                .iter()
                .chain(std::iter::once(&key))
                .map(|(r, b)| self.key_label(*r, b))
                .collect();
            bail_config!("dependency cycle: {}", cycle.join(" -> "));
        }

        let registry = self.registry;
        let rule = registry.get(rule_id);
        let bindings = &key.1;

        let mut inputs = Vec::with_capacity(rule.inputs.len());
        for (name, pattern) in &rule.inputs {
            inputs.push((name.clone(), PathBuf::from(pattern.format(bindings)?)));
        }

        self.stack.push(key.clone());
        let mut deps = BTreeSet::new();
        for (_, path) in &inputs {
            let text = path.to_string_lossy();
            match self.registry.find_producer(&text)? {
                Some((dep_rule, dep_bindings)) => {
                    deps.insert(self.instantiate(dep_rule, dep_bindings)?);
                }
                None => {
                    self.dag.root_inputs.insert(path.clone());
                }
            }
        }
        self.stack.pop();

        let mut outputs = Vec::with_capacity(rule.outputs.len());
        for out in &rule.outputs {
            outputs.push(NodeOutput {
                name: out.name.clone(),
                path: PathBuf::from(out.pattern.format(bindings)?),
                kind: out.kind,
            });
        }

        let log = match &rule.log {
            Some(pattern) => PathBuf::from(pattern.format(bindings)?),
            None => {
                let mut name = outputs[0].path.clone().into_os_string();
                name.push(".log");
                PathBuf::from(name)
            }
        };

        let id = self.dag.nodes.len();
        let label = self.key_label(rule_id, bindings);
        for out in &outputs {
            if self.logs.contains_key(&out.path) {
                bail_config!("output {} of {label} is also another node's log", out.path.display());
            }
            if let Some(&other) = self.producers.get(&out.path) {
                bail_config!(
                    "output {} is written by both {} and {label}",
                    out.path.display(),
                    self.dag.nodes[other].label()
                );
            }
            self.producers.insert(out.path.clone(), id);
        }
        if self.producers.contains_key(&log) {
            bail_config!("log {} of {label} is also a declared output", log.display());
        }
        if let Some(&other) = self.logs.get(&log) {
            bail_config!(
                "log {} is shared by {} and {label}",
                log.display(),
                self.dag.nodes[other].label()
            );
        }
        self.logs.insert(log.clone(), id);

        let input_pairs = path_pairs(&inputs);
        let output_pairs: Vec<(String, String)> = outputs
            .iter()
            .map(|o| (o.name.clone(), o.path.to_string_lossy().into_owned()))
            .collect();
        let log_text = log.to_string_lossy().into_owned();
        let no_params = BTreeMap::new();
        let ctx = TemplateContext {
            rule: &rule.name,
            inputs: &input_pairs,
            outputs: &output_pairs,
            wildcards: bindings,
            params: &no_params,
            threads: rule.resources.threads,
            mem_mb: rule.resources.mem_mb,
            log: &log_text,
            config: self.options.config,
        };
        let mut params = BTreeMap::new();
        for (name, text) in &rule.params {
            params.insert(name.clone(), template::render(text, &ctx)?);
        }

        let timeout = rule
            .timeout_secs
            .map(Duration::from_secs)
            .or(self.options.default_timeout);

        self.dag.nodes.push(TaskNode {
            id,
            rule_name: rule.name.clone(),
            wildcards: bindings.clone(),
            inputs,
            outputs,
            log,
            params,
            resources: rule.resources,
            timeout,
            shell: rule.shell.clone(),
        });
        self.dag.deps.push(deps.into_iter().collect());
        self.memo.insert(key, id);
        Ok(id)
    }

    fn key_label(&self, rule: RuleId, bindings: &Bindings) -> String {
        let name = &self.registry.get(rule).name;
        if bindings.is_empty() {
            name.clone()
        } else {
            format!("{name}[{}]", describe(bindings))
        }
    }
}

impl Dag {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Kahn's algorithm, smallest ready id first.
    pub fn topological_order(&self) -> Vec<NodeId> {
        let mut in_degree: Vec<usize> = self.deps.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<NodeId> = (0..self.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for &next in &self.dependents[id] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }
        order
    }

    /// Every node reachable from `id` along consumer edges, excluding `id`.
    pub fn descendants(&self, id: NodeId) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut stack = self.dependents[id].clone();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(&self.dependents[next]);
            }
        }
        seen
    }

    /// Render the graph in Graphviz DOT format.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph rnaflow {\n    node [shape=box, style=rounded];\n");
        for node in &self.nodes {
            let _ = writeln!(out, "    n{} [label=\"{}\"];", node.id, node.label().replace('"', "\\\""));
        }
        for (id, deps) in self.deps.iter().enumerate() {
            for dep in deps {
                let _ = writeln!(out, "    n{dep} -> n{id};");
            }
        }
        out.push_str("}\n");
        out
    }

    /// One line per node with its direct dependencies.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for id in self.topological_order() {
            let node = &self.nodes[id];
            let deps: Vec<String> = self.deps[id].iter().map(|&d| self.nodes[d].label()).collect();
            if deps.is_empty() {
                let _ = writeln!(out, "{}", node.label());
            } else {
                let _ = writeln!(out, "{} <- {}", node.label(), deps.join(", "));
            }
        }
        out
    }
}

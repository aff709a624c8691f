//! Post-evaluation validation of the [`WorkflowModel`].
//!
//! Catches everything that can be checked before samples are discovered:
//! malformed patterns, bad names and resource values, and command templates
//! that reference inputs, outputs, wildcards, params or config keys that do
//! not exist.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{PipelineError, ensure_config};
use crate::model::{RuleDef, WorkflowModel};
use crate::pattern::{Pattern, is_identifier};
use crate::template::{Placeholder, placeholders};

/// Validate a fully populated workflow model against the resolved config
/// values.
pub fn validate_model(
    model: &WorkflowModel,
    config: &BTreeMap<String, String>,
) -> Result<(), PipelineError> {
    ensure_config!(!model.rules.is_empty(), "the rule script declares no rules");
    validate_samples(model)?;
    validate_targets(model)?;

    let mut names = BTreeSet::new();
    for rule in &model.rules {
        ensure_config!(
            names.insert(rule.name.as_str()),
            "rule '{}' is defined more than once",
            rule.name
        );
        validate_rule(rule, config)?;
    }
    Ok(())
}

fn validate_samples(model: &WorkflowModel) -> Result<(), PipelineError> {
    ensure_config!(
        model.samples.len() <= 1,
        "samples() may only be declared once, found {} declarations",
        model.samples.len()
    );
    let Some(decl) = model.samples.first() else {
        return Ok(());
    };
    ensure_config!(!decl.dir.is_empty(), "samples(): directory is empty");
    ensure_config!(!decl.patterns.is_empty(), "samples(): no file patterns given");

    let mut shared: Option<BTreeSet<String>> = None;
    for text in &decl.patterns {
        let pattern = Pattern::parse(text)?;
        ensure_config!(
            pattern.has_wildcards(),
            "samples(): pattern '{text}' has no wildcards"
        );
        let wildcards = pattern.wildcards();
        if let Some(expected) = &shared {
            ensure_config!(
                *expected == wildcards,
                "samples(): pattern '{text}' does not use the same wildcards as '{}'",
                decl.patterns[0]
            );
        }
        shared = Some(wildcards);
    }
    Ok(())
}

fn validate_targets(model: &WorkflowModel) -> Result<(), PipelineError> {
    for target in &model.targets {
        let pattern = Pattern::parse(target)?;
        if pattern.has_wildcards() {
            ensure_config!(
                !model.samples.is_empty(),
                "target '{target}' has wildcards but no samples() declaration"
            );
        }
    }
    Ok(())
}

fn validate_rule(rule: &RuleDef, config: &BTreeMap<String, String>) -> Result<(), PipelineError> {
    let name = &rule.name;
    ensure_config!(is_identifier(name), "rule name '{name}' is not a valid identifier");
    ensure_config!(
        rule.resources.threads >= 1,
        "rule '{name}': threads must be at least 1"
    );
    ensure_config!(
        rule.resources.mem_mb != Some(0),
        "rule '{name}': mem_mb must be positive"
    );
    ensure_config!(
        rule.timeout_secs != Some(0),
        "rule '{name}': timeout must be positive"
    );

    let inputs: Vec<&str> = rule.inputs.iter().map(|i| i.name.as_str()).collect();
    let outputs: Vec<&str> = rule.outputs.iter().map(|o| o.name.as_str()).collect();
    check_names(name, "input", &inputs)?;
    check_names(name, "output", &outputs)?;

    // Pattern errors surface here with the rule name attached; the registry
    // repeats the structural checks when compiling.
    let mut wildcards = BTreeSet::new();
    for out in &rule.outputs {
        wildcards.extend(parse_in(name, &out.pattern)?.wildcards());
    }
    for input in &rule.inputs {
        parse_in(name, &input.pattern)?;
    }
    if let Some(log) = &rule.log {
        parse_in(name, log)?;
    }

    let refs = Refs {
        rule: name,
        inputs: &inputs,
        outputs: &outputs,
        wildcards: &wildcards,
        params: &rule.params,
        mem_mb: rule.resources.mem_mb,
        config,
    };
    for (param, text) in &rule.params {
        ensure_config!(is_identifier(param), "rule '{name}': param name '{param}' is not an identifier");
        for hole in placeholders(text)? {
            ensure_config!(
                !matches!(hole, Placeholder::Param(_)),
                "rule '{name}': param '{param}' may not reference other params"
            );
            refs.check(&hole)?;
        }
    }
    if let Some(shell) = &rule.shell {
        for hole in placeholders(shell)? {
            refs.check(&hole)?;
        }
    }
    Ok(())
}

fn parse_in(rule: &str, text: &str) -> Result<Pattern, PipelineError> {
    Pattern::parse(text).map_err(|e| match e {
        PipelineError::Configuration(msg) => {
            PipelineError::Configuration(format!("rule '{rule}': {msg}"))
        }
        other => other,
    })
}

/// Names are identifiers, or positional indexes for unnamed entries.
fn check_names(rule: &str, what: &str, names: &[&str]) -> Result<(), PipelineError> {
    let mut seen = BTreeSet::new();
    for name in names {
        ensure_config!(
            is_identifier(name) || name.parse::<usize>().is_ok(),
            "rule '{rule}': {what} name '{name}' is not an identifier"
        );
        ensure_config!(
            seen.insert(*name),
            "rule '{rule}': {what} '{name}' is declared more than once"
        );
    }
    Ok(())
}

/// What a rule's templates may refer to.
struct Refs<'a> {
    rule: &'a str,
    inputs: &'a [&'a str],
    outputs: &'a [&'a str],
    wildcards: &'a BTreeSet<String>,
    params: &'a BTreeMap<String, String>,
    mem_mb: Option<u64>,
    config: &'a BTreeMap<String, String>,
}

impl Refs<'_> {
    fn check(&self, hole: &Placeholder) -> Result<(), PipelineError> {
        let rule = self.rule;
        match hole {
            Placeholder::Input(Some(name)) => ensure_config!(
                declared(self.inputs, name),
                "rule '{rule}': template references undeclared input '{name}'"
            ),
            Placeholder::Output(Some(name)) => ensure_config!(
                declared(self.outputs, name),
                "rule '{rule}': template references undeclared output '{name}'"
            ),
            Placeholder::Wildcard(name) => ensure_config!(
                self.wildcards.contains(name),
                "rule '{rule}': template references wildcard '{name}' not bound by its outputs"
            ),
            Placeholder::Param(name) => ensure_config!(
                self.params.contains_key(name),
                "rule '{rule}': template references undeclared param '{name}'"
            ),
            Placeholder::Config(key) => ensure_config!(
                self.config.contains_key(key),
                "rule '{rule}': template references config key '{key}' which is not set"
            ),
            Placeholder::MemMb => ensure_config!(
                self.mem_mb.is_some(),
                "rule '{rule}' uses {{resources.mem_mb}} but declares no mem_mb"
            ),
            Placeholder::Input(None)
            | Placeholder::Output(None)
            | Placeholder::Threads
            | Placeholder::Log
            | Placeholder::Rule => {}
        }
        Ok(())
    }
}

fn declared(names: &[&str], name: &str) -> bool {
    names.contains(&name) || name.parse::<usize>().is_ok_and(|i| i < names.len())
}

//! Rule registry: compiled rule definitions and producer lookup.
//!
//! Registration compiles every pattern of a [`RuleDef`] and rejects rules
//! whose outputs could collide across samples. Lookup reverse-matches a
//! concrete path against every output pattern to find the one rule that
//! produces it.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{PipelineError, bail_config, ensure_config};
use crate::model::{OutputKind, ResourceSpec, RuleDef};
use crate::pattern::{Bindings, Pattern, describe};

/// Index of a rule within the registry.
pub type RuleId = usize;

/// A registered rule with its patterns compiled.
#[derive(Debug)]
pub struct Rule {
    pub name: String,
    pub inputs: Vec<(String, Pattern)>,
    pub outputs: Vec<CompiledOutput>,
    pub log: Option<Pattern>,
    pub params: BTreeMap<String, String>,
    pub resources: ResourceSpec,
    pub shell: String,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug)]
pub struct CompiledOutput {
    pub name: String,
    pub pattern: Pattern,
    pub kind: OutputKind,
}

/// All registered rules, in registration order.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: Vec<Rule>,
    by_name: BTreeMap<String, RuleId>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from rule definitions, registering each in order.
    pub fn from_defs(defs: &[RuleDef]) -> Result<Self, PipelineError> {
        let mut registry = Self::new();
        for def in defs {
            registry.register(def)?;
        }
        Ok(registry)
    }

    /// Compile and register one rule.
    ///
    /// Fails on a duplicate name, a rule without outputs, outputs with
    /// differing wildcards, or any input or log wildcard that the
    /// outputs do not bind.
    pub fn register(&mut self, def: &RuleDef) -> Result<RuleId, PipelineError> {
        let name = &def.name;
        ensure_config!(
            !self.by_name.contains_key(name),
            "rule '{name}' is defined more than once"
        );
        ensure_config!(!def.outputs.is_empty(), "rule '{name}' declares no outputs");
        let Some(shell) = def.shell.clone() else {
            bail_config!("rule '{name}' has no shell command");
        };

        let mut outputs = Vec::with_capacity(def.outputs.len());
        for out in &def.outputs {
            outputs.push(CompiledOutput {
                name: out.name.clone(),
                pattern: Pattern::parse(&out.pattern)?,
                kind: out.kind,
            });
        }

        let distinct: BTreeSet<&str> = outputs.iter().map(|o| o.pattern.as_str()).collect();
        ensure_config!(
            distinct.len() == outputs.len(),
            "rule '{name}' declares the same output pattern twice"
        );

        let wildcards = outputs[0].pattern.wildcards();
        for out in &outputs[1..] {
            let other = out.pattern.wildcards();
            ensure_config!(
                other == wildcards,
                "rule '{name}': output '{}' uses wildcards {{{}}} but '{}' uses {{{}}}",
                out.pattern,
                join(&other),
                outputs[0].pattern,
                join(&wildcards)
            );
        }

        let mut inputs = Vec::with_capacity(def.inputs.len());
        for input in &def.inputs {
            let pattern = Pattern::parse(&input.pattern)?;
            check_covered(name, "input", &pattern, &wildcards)?;
            inputs.push((input.name.clone(), pattern));
        }

        let log = match &def.log {
            Some(text) => {
                let pattern = Pattern::parse(text)?;
                check_covered(name, "log", &pattern, &wildcards)?;
                Some(pattern)
            }
            None => None,
        };

        let id = self.rules.len();
        self.by_name.insert(name.clone(), id);
        self.rules.push(Rule {
            name: name.clone(),
            inputs,
            outputs,
            log,
            params: def.params.clone(),
            resources: def.resources,
            shell,
            timeout_secs: def.timeout_secs,
        });
        tracing::trace!(rule = %name, "registered");
        Ok(id)
    }

    pub fn get(&self, id: RuleId) -> &Rule {
        &self.rules[id]
    }

    pub fn by_name(&self, name: &str) -> Option<RuleId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RuleId, &Rule)> {
        self.rules.iter().enumerate()
    }

    /// Find the rule producing `path` and the bindings it implies.
    ///
    /// Returns `Ok(None)` when no rule produces the path (a root input).
    /// Two different rules matching the same path is an ambiguity error.
    pub fn find_producer(&self, path: &str) -> Result<Option<(RuleId, Bindings)>, PipelineError> {
        let mut found: Option<(RuleId, Bindings)> = None;
        for (id, rule) in self.iter() {
            let Some(bindings) = rule
                .outputs
                .iter()
                .find_map(|out| out.pattern.match_path(path))
            else {
                continue;
            };
            if let Some((prev, prev_bindings)) = &found {
                bail_config!(
                    "ambiguous output {path}: produced by rule '{}' [{}] and rule '{}' [{}]",
                    self.rules[*prev].name,
                    describe(prev_bindings),
                    rule.name,
                    describe(&bindings)
                );
            }
            found = Some((id, bindings));
        }
        Ok(found)
    }
}

fn check_covered(
    rule: &str,
    what: &str,
    pattern: &Pattern,
    wildcards: &BTreeSet<String>,
) -> Result<(), PipelineError> {
    let missing: Vec<String> = pattern.wildcards().difference(wildcards).cloned().collect();
    ensure_config!(
        missing.is_empty(),
        "rule '{rule}': {what} '{pattern}' uses wildcard(s) {{{}}} not present in its outputs",
        missing.join("}, {")
    );
    Ok(())
}

fn join(names: &BTreeSet<String>) -> String {
    names.iter().cloned().collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NamedPattern, OutputDef};
    use crate::pattern::bindings;

    fn rule(name: &str, inputs: &[&str], outputs: &[&str]) -> RuleDef {
        let mut def = RuleDef::new(name);
        def.inputs = inputs
            .iter()
            .enumerate()
            .map(|(i, p)| NamedPattern {
                name: i.to_string(),
                pattern: p.to_string(),
            })
            .collect();
        def.outputs = outputs
            .iter()
            .enumerate()
            .map(|(i, p)| OutputDef {
                name: i.to_string(),
                pattern: p.to_string(),
                kind: OutputKind::File,
            })
            .collect();
        def.shell = Some("true".into());
        def
    }

    #[test]
    fn finds_producer_and_bindings() {
        let registry = RuleRegistry::from_defs(&[
            rule("align", &["reads/{sample}.fq"], &["out/{sample}/align.bam"]),
            rule("call", &["out/{sample}/align.bam"], &["out/{sample}/calls.vcf"]),
        ])
        .unwrap();

        let (id, b) = registry.find_producer("out/S1/calls.vcf").unwrap().unwrap();
        assert_eq!(registry.get(id).name, "call");
        assert_eq!(b, bindings([("sample", "S1")]));
        assert!(registry.find_producer("reads/S1.fq").unwrap().is_none());
        assert_eq!(registry.by_name("align"), Some(0));
    }

    #[test]
    fn input_wildcard_missing_from_outputs_is_rejected() {
        let err = RuleRegistry::from_defs(&[rule(
            "merge",
            &["reads/{sample}.fq"],
            &["out/merged.bam"],
        )])
        .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert!(err.to_string().contains("{sample}"), "{err}");
    }

    #[test]
    fn outputs_must_share_wildcards() {
        let err = RuleRegistry::from_defs(&[rule(
            "split",
            &[],
            &["out/{sample}/a.bam", "out/{sample}/{lane}.bam"],
        )])
        .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn duplicate_names_and_missing_shell_are_rejected() {
        let a = rule("a", &[], &["x.txt"]);
        assert!(RuleRegistry::from_defs(&[a.clone(), a]).is_err());

        let mut no_shell = rule("b", &[], &["y.txt"]);
        no_shell.shell = None;
        assert!(RuleRegistry::from_defs(&[no_shell]).is_err());
        assert!(RuleRegistry::from_defs(&[rule("c", &["in.txt"], &[])]).is_err());
    }

    #[test]
    fn overlapping_outputs_are_ambiguous() {
        let registry = RuleRegistry::from_defs(&[
            rule("sorted", &[], &["out/{name}.bam"]),
            rule("merged", &[], &["out/{sample}.bam"]),
        ])
        .unwrap();
        let err = registry.find_producer("out/S1.bam").unwrap_err();
        assert!(err.to_string().contains("ambiguous output"), "{err}");
    }

    #[test]
    fn log_wildcards_must_be_bound() {
        let mut def = rule("a", &[], &["out/{sample}.txt"]);
        def.log = Some("logs/{sample}/{lane}.log".into());
        assert!(RuleRegistry::from_defs(&[def]).is_err());
    }
}

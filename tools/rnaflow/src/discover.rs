//! Sample discovery from input file names.
//!
//! Lists a directory once at startup and reverse-matches each entry against
//! the discovery patterns (e.g. `{sample}.R1.fastq.gz`). The result is the
//! sorted set of wildcard tuples that every pattern matched.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use walkdir::WalkDir;

use crate::error::{PipelineError, bail_config};
use crate::pattern::{Bindings, Pattern, describe};

/// Discover wildcard tuples in `dir` that satisfy all `patterns`.
///
/// Patterns without a `/` are matched against the base names of the
/// directory's direct entries. Patterns containing `/` are matched against
/// paths relative to `dir`, found by walking it recursively.
///
/// Tuples matched by only some of the patterns (an R1 without its R2) are
/// dropped with a warning. An empty result is a [`PipelineError::Discovery`].
pub fn discover(dir: &Path, patterns: &[Pattern]) -> Result<Vec<Bindings>, PipelineError> {
    let Some(first) = patterns.first() else {
        bail_config!("sample discovery needs at least one pattern");
    };
    let names = first.wildcards();
    if names.is_empty() {
        bail_config!("discovery pattern '{first}' has no wildcards");
    }
    for pattern in &patterns[1..] {
        if pattern.wildcards() != names {
            bail_config!(
                "discovery patterns '{first}' and '{pattern}' use different wildcards"
            );
        }
    }

    if !dir.is_dir() {
        return Err(PipelineError::Discovery(format!(
            "input directory {} does not exist",
            dir.display()
        )));
    }

    let mut per_pattern: Vec<BTreeSet<Bindings>> = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        let candidates = if pattern.as_str().contains('/') {
            list_recursive(dir)?
        } else {
            list_flat(dir)?
        };
        let matched: BTreeSet<Bindings> = candidates
            .iter()
            .filter_map(|name| pattern.match_path(name))
            .collect();
        tracing::debug!(
            pattern = pattern.as_str(),
            matches = matched.len(),
            "scanned {}",
            dir.display()
        );
        per_pattern.push(matched);
    }

    let union: BTreeSet<Bindings> = per_pattern.iter().flatten().cloned().collect();
    let mut found = Vec::new();
    for tuple in union {
        let missing: Vec<&str> = patterns
            .iter()
            .zip(&per_pattern)
            .filter(|(_, set)| !set.contains(&tuple))
            .map(|(p, _)| p.as_str())
            .collect();
        if missing.is_empty() {
            found.push(tuple);
        } else {
            tracing::warn!(
                "skipping {}: no file matching {}",
                describe(&tuple),
                missing.join(", ")
            );
        }
    }

    if found.is_empty() {
        let listed: Vec<&str> = patterns.iter().map(Pattern::as_str).collect();
        return Err(PipelineError::Discovery(format!(
            "no input files found in {} matching {}",
            dir.display(),
            listed.join(" and ")
        )));
    }
    Ok(found)
}

/// Base names of the direct entries of `dir`.
fn list_flat(dir: &Path) -> Result<Vec<String>, PipelineError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// `/`-separated paths of every file below `dir`, relative to it.
fn list_recursive(dir: &Path) -> Result<Vec<String>, PipelineError> {
    let mut names = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| PipelineError::Discovery(e.to_string()))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let parts: Vec<&str> = rel.iter().filter_map(|c| c.to_str()).collect();
        names.push(parts.join("/"));
    }
    Ok(names)
}

/// Expand target patterns over the discovered tuples.
///
/// A pattern without wildcards yields one path. A pattern with wildcards is
/// formatted once per tuple. Duplicates are dropped, first occurrence wins.
pub fn expand_targets(
    targets: &[Pattern],
    tuples: &[Bindings],
) -> Result<Vec<String>, PipelineError> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for target in targets {
        let paths = if target.has_wildcards() {
            tuples
                .iter()
                .map(|t| target.format(t))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            vec![target.as_str().to_string()]
        };
        for path in paths {
            if seen.insert(path.clone()) {
                out.push(path);
            }
        }
    }
    Ok(out)
}

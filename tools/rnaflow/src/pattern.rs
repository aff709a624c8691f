//! Wildcard file patterns.
//!
//! A pattern is literal path text with `{name}` placeholders, for example
//! `results/{sample}/align_pass1/{sample}.bam`. Patterns are used in both
//! directions: forward ([`Pattern::format`]) to produce a concrete path from
//! bindings, and in reverse ([`Pattern::match_path`]) to recover the bindings
//! from a concrete path.
//!
//! Syntax:
//! - `{name}` matches one path segment (`[^/]+`).
//! - `{name,REGEX}` matches `REGEX` instead.
//! - `{{` and `}}` are literal braces.
//!
//! A wildcard may appear more than once; every occurrence must bind the same
//! value for a reverse match to succeed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use regex::Regex;

use crate::error::{PipelineError, bail_config};

/// Concrete values for a set of wildcards, ordered by wildcard name.
pub type Bindings = BTreeMap<String, String>;

/// Constraint used when a wildcard declares none.
const DEFAULT_CONSTRAINT: &str = "[^/]+";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard { name: String, constraint: Option<String> },
}

/// A parsed wildcard pattern with its compiled reverse matcher.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    segments: Vec<Segment>,
    matcher: Regex,
    /// Wildcard name for each capture group `w0`, `w1`, ... in `matcher`.
    groups: Vec<String>,
}

impl Pattern {
    /// Parse a pattern string.
    pub fn parse(source: &str) -> Result<Self, PipelineError> {
        let segments = parse_segments(source)?;

        let mut regex_src = String::from("^");
        let mut groups = Vec::new();
        let mut constraints: BTreeMap<&str, &str> = BTreeMap::new();
        for segment in &segments {
            match segment {
                Segment::Literal(text) => regex_src.push_str(&regex::escape(text)),
                Segment::Wildcard { name, constraint } => {
                    // Repeated wildcards reuse the first declared constraint.
                    let constraint = *constraints
                        .entry(name.as_str())
                        .or_insert_with(|| constraint.as_deref().unwrap_or(DEFAULT_CONSTRAINT));
                    regex_src.push_str(&format!("(?P<w{}>{constraint})", groups.len()));
                    groups.push(name.clone());
                }
            }
        }
        regex_src.push('$');

        let matcher = Regex::new(&regex_src).map_err(|e| {
            PipelineError::Configuration(format!("invalid wildcard constraint in '{source}': {e}"))
        })?;

        Ok(Self {
            source: source.to_string(),
            segments,
            matcher,
            groups,
        })
    }

    /// The pattern text as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Distinct wildcard names appearing in the pattern.
    pub fn wildcards(&self) -> BTreeSet<String> {
        self.groups.iter().cloned().collect()
    }

    pub fn has_wildcards(&self) -> bool {
        !self.groups.is_empty()
    }

    /// Substitute bindings into the pattern.
    ///
    /// Every wildcard must be bound; extra bindings are ignored.
    pub fn format(&self, bindings: &Bindings) -> Result<String, PipelineError> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Wildcard { name, .. } => match bindings.get(name) {
                    Some(value) => out.push_str(value),
                    None => bail_config!(
                        "wildcard '{{{name}}}' in '{}' has no value",
                        self.source
                    ),
                },
            }
        }
        Ok(out)
    }

    /// Reverse-match a concrete path, returning the wildcard bindings.
    ///
    /// The whole path must match. Returns `None` when it does not, or when a
    /// repeated wildcard would bind two different values.
    pub fn match_path(&self, path: &str) -> Option<Bindings> {
        let caps = self.matcher.captures(path)?;
        let mut bindings = Bindings::new();
        for (idx, name) in self.groups.iter().enumerate() {
            let value = caps.name(&format!("w{idx}"))?.as_str();
            match bindings.get(name) {
                Some(existing) if existing != value => return None,
                Some(_) => {}
                None => {
                    bindings.insert(name.clone(), value.to_string());
                }
            }
        }
        Some(bindings)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Split pattern text into literal and wildcard segments.
fn parse_segments(source: &str) -> Result<Vec<Segment>, PipelineError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = source.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '}' => bail_config!("unbalanced '}}' in pattern '{source}'"),
            '{' => {
                // Constraints may contain braces (`{n,[0-9]{3}}`), so track depth.
                let mut body = String::new();
                let mut depth = 1;
                for inner in chars.by_ref() {
                    match inner {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    body.push(inner);
                }
                if depth != 0 {
                    bail_config!("unterminated wildcard in pattern '{source}'");
                }

                let (name, constraint) = match body.split_once(',') {
                    Some((name, constraint)) => (name.trim(), Some(constraint.to_string())),
                    None => (body.trim(), None),
                };
                if !is_identifier(name) {
                    bail_config!("invalid wildcard name '{name}' in pattern '{source}'");
                }

                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Wildcard {
                    name: name.to_string(),
                    constraint,
                });
            }
            other => literal.push(other),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Build a [`Bindings`] map from `(name, value)` pairs.
#[cfg(test)]
pub fn bindings<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Bindings {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Render bindings as `name=value,name=value` for node keys and messages.
pub fn describe(bindings: &Bindings) -> String {
    bindings
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

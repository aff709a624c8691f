//! Command templates.
//!
//! Shell commands and params are written with `{...}` placeholders that are
//! filled per node: `{input}`, `{input.NAME}`, `{output.NAME}`,
//! `{wildcards.NAME}`, `{params.NAME}`, `{threads}`, `{resources.mem_mb}`,
//! `{log}`, `{config.KEY}` and `{rule}`. `{{` and `}}` produce literal braces,
//! which shell snippets such as `awk '{{print $1}}'` need.

use std::collections::BTreeMap;

use crate::error::{PipelineError, bail_config};
use crate::pattern::Bindings;

/// A placeholder reference found in a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    /// `{input}` (all, `None`) or `{input.NAME}`.
    Input(Option<String>),
    Output(Option<String>),
    Wildcard(String),
    Param(String),
    Config(String),
    Threads,
    MemMb,
    Log,
    Rule,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Text(String),
    Hole(Placeholder),
}

/// Values available while rendering one node's templates.
pub struct TemplateContext<'a> {
    pub rule: &'a str,
    pub inputs: &'a [(String, String)],
    pub outputs: &'a [(String, String)],
    pub wildcards: &'a Bindings,
    pub params: &'a BTreeMap<String, String>,
    pub threads: u32,
    pub mem_mb: Option<u64>,
    pub log: &'a str,
    pub config: &'a BTreeMap<String, String>,
}

/// List the placeholders used by a template.
pub fn placeholders(template: &str) -> Result<Vec<Placeholder>, PipelineError> {
    Ok(parse(template)?
        .into_iter()
        .filter_map(|piece| match piece {
            Piece::Hole(p) => Some(p),
            Piece::Text(_) => None,
        })
        .collect())
}

/// Render a template for one node.
pub fn render(template: &str, ctx: &TemplateContext<'_>) -> Result<String, PipelineError> {
    let mut out = String::with_capacity(template.len() + 64);
    for piece in parse(template)? {
        match piece {
            Piece::Text(text) => out.push_str(&text),
            Piece::Hole(hole) => out.push_str(&lookup(&hole, ctx)?),
        }
    }
    Ok(out)
}

fn lookup(hole: &Placeholder, ctx: &TemplateContext<'_>) -> Result<String, PipelineError> {
    let missing = |what: &str, name: &str| {
        PipelineError::Configuration(format!("rule '{}': unknown {what} '{name}'", ctx.rule))
    };
    Ok(match hole {
        Placeholder::Input(None) => join_paths(ctx.inputs),
        Placeholder::Input(Some(name)) => {
            select(ctx.inputs, name).ok_or_else(|| missing("input", name))?
        }
        Placeholder::Output(None) => join_paths(ctx.outputs),
        Placeholder::Output(Some(name)) => {
            select(ctx.outputs, name).ok_or_else(|| missing("output", name))?
        }
        Placeholder::Wildcard(name) => ctx
            .wildcards
            .get(name)
            .cloned()
            .ok_or_else(|| missing("wildcard", name))?,
        Placeholder::Param(name) => ctx
            .params
            .get(name)
            .cloned()
            .ok_or_else(|| missing("param", name))?,
        Placeholder::Config(key) => ctx
            .config
            .get(key)
            .cloned()
            .ok_or_else(|| missing("config value", key))?,
        Placeholder::Threads => ctx.threads.to_string(),
        Placeholder::MemMb => match ctx.mem_mb {
            Some(mem) => mem.to_string(),
            None => bail_config!("rule '{}' uses {{resources.mem_mb}} but declares no mem_mb", ctx.rule),
        },
        Placeholder::Log => ctx.log.to_string(),
        Placeholder::Rule => ctx.rule.to_string(),
    })
}

/// Named entry, or positional entry when `name` is an index.
fn select(entries: &[(String, String)], name: &str) -> Option<String> {
    if let Some((_, value)) = entries.iter().find(|(n, _)| n == name) {
        return Some(value.clone());
    }
    let idx: usize = name.parse().ok()?;
    entries.get(idx).map(|(_, value)| value.clone())
}

fn join_paths(entries: &[(String, String)]) -> String {
    entries
        .iter()
        .map(|(_, value)| value.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse(template: &str) -> Result<Vec<Piece>, PipelineError> {
    let mut pieces = Vec::new();
    let mut text = String::new();
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                text.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                text.push('}');
            }
            '}' => bail_config!("unbalanced '}}' in template: {template}"),
            '{' => {
                let mut body = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    body.push(inner);
                }
                if !closed {
                    bail_config!("unterminated placeholder in template: {template}");
                }
                if !text.is_empty() {
                    pieces.push(Piece::Text(std::mem::take(&mut text)));
                }
                pieces.push(Piece::Hole(classify(body.trim(), template)?));
            }
            other => text.push(other),
        }
    }

    if !text.is_empty() {
        pieces.push(Piece::Text(text));
    }
    Ok(pieces)
}

fn classify(body: &str, template: &str) -> Result<Placeholder, PipelineError> {
    let (head, tail) = match body.split_once('.') {
        Some((head, tail)) => (head, Some(tail.to_string())),
        None => (body, None),
    };
    Ok(match (head, tail) {
        ("input", name) => Placeholder::Input(name),
        ("output", name) => Placeholder::Output(name),
        ("wildcards", Some(name)) => Placeholder::Wildcard(name),
        ("params", Some(name)) => Placeholder::Param(name),
        ("config", Some(key)) => Placeholder::Config(key),
        ("resources", Some(ref res)) if res == "mem_mb" => Placeholder::MemMb,
        ("resources", Some(ref res)) if res == "threads" => Placeholder::Threads,
        ("threads", None) => Placeholder::Threads,
        ("log", None) => Placeholder::Log,
        ("rule", None) => Placeholder::Rule,
        _ => bail_config!("unknown placeholder '{{{body}}}' in template: {template}"),
    })
}

/// Quote a string for safe use as one POSIX shell word.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::bindings;

    struct Fixture {
        inputs: Vec<(String, String)>,
        outputs: Vec<(String, String)>,
        wildcards: Bindings,
        params: BTreeMap<String, String>,
        config: BTreeMap<String, String>,
    }

    impl Fixture {
        fn new() -> Self {
            let pair = |a: &str, b: &str| (a.to_string(), b.to_string());
            Self {
                inputs: vec![pair("bam", "out/S1/a.bam"), pair("bai", "out/S1/a.bai")],
                outputs: vec![pair("vcf", "out/S1/c.vcf")],
                wildcards: bindings([("sample", "S1")]),
                params: BTreeMap::from([("rg".to_string(), "ID:S1".to_string())]),
                config: BTreeMap::from([("genome".to_string(), "ref/g.fa".to_string())]),
            }
        }

        fn ctx(&self, mem_mb: Option<u64>) -> TemplateContext<'_> {
            TemplateContext {
                rule: "call",
                inputs: &self.inputs,
                outputs: &self.outputs,
                wildcards: &self.wildcards,
                params: &self.params,
                threads: 4,
                mem_mb,
                log: "out/S1/c.vcf.log",
                config: &self.config,
            }
        }
    }

    #[test]
    fn renders_all_placeholder_kinds() {
        let f = Fixture::new();
        let cmd = render(
            "gatk -R {config.genome} -I {input.bam} -O {output.vcf} --threads {threads} \
             --mem {resources.mem_mb} --rg {params.rg} --sample {wildcards.sample} 2> {log} # {rule}",
            &f.ctx(Some(4096)),
        )
        .unwrap();
        assert_eq!(
            cmd,
            "gatk -R ref/g.fa -I out/S1/a.bam -O out/S1/c.vcf --threads 4 \
             --mem 4096 --rg ID:S1 --sample S1 2> out/S1/c.vcf.log # call"
        );
    }

    #[test]
    fn bare_and_positional_references() {
        let f = Fixture::new();
        assert_eq!(
            render("cat {input} > {output.0}", &f.ctx(None)).unwrap(),
            "cat out/S1/a.bam out/S1/a.bai > out/S1/c.vcf"
        );
        assert_eq!(render("{input.1}", &f.ctx(None)).unwrap(), "out/S1/a.bai");
    }

    #[test]
    fn doubled_braces_are_literal() {
        let f = Fixture::new();
        assert_eq!(
            render("awk '{{print $1}}' {input.bam}", &f.ctx(None)).unwrap(),
            "awk '{print $1}' out/S1/a.bam"
        );
    }

    #[test]
    fn unknown_references_are_configuration_errors() {
        let f = Fixture::new();
        for bad in ["{input.cram}", "{wildcards.lane}", "{params.x}", "{config.dbsnp}", "{resources.mem_mb}"] {
            let err = render(bad, &f.ctx(None)).unwrap_err();
            assert!(matches!(err, PipelineError::Configuration(_)), "{bad}: {err}");
        }
        assert!(placeholders("{bogus}").is_err());
        assert!(placeholders("echo {input").is_err());
        assert!(placeholders("echo }").is_err());
    }

    #[test]
    fn placeholders_are_listed_in_order() {
        let found = placeholders("x {input.a} {threads} {wildcards.s}").unwrap();
        assert_eq!(
            found,
            vec![
                Placeholder::Input(Some("a".into())),
                Placeholder::Threads,
                Placeholder::Wildcard("s".into()),
            ]
        );
    }

    #[test]
    fn shell_quote_leaves_plain_words_alone() {
        assert_eq!(shell_quote("out/S1/a.bam"), "out/S1/a.bam");
        assert_eq!(shell_quote("echo hi"), "'echo hi'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}

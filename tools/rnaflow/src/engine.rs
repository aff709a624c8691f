//! Rhai scripting engine for workflow definitions.
//!
//! Sets up a Rhai engine with a rule builder type and registration
//! functions, evaluates `rnaflow.rhai`, and produces a [`WorkflowModel`].
//!
//! ```text
//! let OUT = CONFIG.output_root;
//! samples(CONFIG.input_root, ["{sample}.R1.fastq.gz", "{sample}.R2.fastq.gz"]);
//!
//! rule("markdup")
//!     .input("bam", `${OUT}/{sample}/align_pass2/Aligned.out.bam`)
//!     .output("bam", `${OUT}/{sample}/markdup/{sample}.bam`)
//!     .threads(2)
//!     .shell("gatk MarkDuplicates -I {input.bam} -O {output.bam}");
//!
//! target(`${OUT}/{sample}/call/{sample}.filtered.vcf`);
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use rhai::{Dynamic, Engine, Map};

use crate::config::ResolvedConfig;
use crate::model::{NamedPattern, OutputDef, OutputKind, RuleDef, SampleDef, WorkflowModel};

/// Shared model state passed to all builder types.
type SharedModel = Arc<Mutex<WorkflowModel>>;

fn lock(model: &SharedModel) -> MutexGuard<'_, WorkflowModel> {
    model.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Evaluate the configured rule script and return the populated model.
pub fn evaluate_script(config: &ResolvedConfig) -> Result<WorkflowModel> {
    let source = std::fs::read_to_string(&config.script).map_err(|e| {
        anyhow::anyhow!("failed to read {}: {e}", config.script.display())
    })?;
    evaluate_source(&source, &config.script, config)
}

/// Evaluate rule script text. `origin` is only used in error messages.
pub fn evaluate_source(source: &str, origin: &Path, config: &ResolvedConfig) -> Result<WorkflowModel> {
    let model = Arc::new(Mutex::new(WorkflowModel::default()));
    let mut engine = Engine::new();
    engine.set_max_expr_depths(64, 64);

    let mut scope = rhai::Scope::new();
    scope.push_constant("CONFIG", config_map(config));

    register_rule_api(&mut engine);
    register_workflow_api(&mut engine, model.clone(), config);
    register_helpers(&mut engine, &config.root);

    let ast = engine
        .compile(source)
        .map_err(|e| anyhow::anyhow!("error compiling {}: {e}", origin.display()))?;
    engine
        .run_ast_with_scope(&mut scope, &ast)
        .map_err(|e| anyhow::anyhow!("error evaluating {}: {e}", origin.display()))?;

    // Drop the engine to release all Arc references held by closures.
    drop(engine);
    drop(scope);

    let model = Arc::try_unwrap(model)
        .map_err(|_| anyhow::anyhow!("workflow model still referenced after script evaluation"))?
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner);

    Ok(model)
}

/// `CONFIG` constant: every resolved config value as a string.
fn config_map(config: &ResolvedConfig) -> Map {
    let mut map = Map::new();
    for (key, value) in &config.values {
        map.insert(key.as_str().into(), Dynamic::from(value.clone()));
    }
    map.insert("cores".into(), Dynamic::from(i64::from(config.cores)));
    map
}

// ---------------------------------------------------------------------------
// rule() -> RuleBuilder
// ---------------------------------------------------------------------------

/// Handle to a rule being declared. Each method edits the rule in place and
/// returns the handle for chaining.
#[derive(Debug, Clone)]
struct RuleBuilder {
    model: SharedModel,
    index: usize,
}

impl RuleBuilder {
    fn edit(&self, f: impl FnOnce(&mut RuleDef)) -> Self {
        let mut model = lock(&self.model);
        if let Some(rule) = model.rules.get_mut(self.index) {
            f(rule);
        }
        self.clone()
    }
}

fn register_rule_api(engine: &mut Engine) {
    engine.register_type_with_name::<RuleBuilder>("Rule");

    engine.register_fn("input", |b: &mut RuleBuilder, name: &str, pattern: &str| {
        b.edit(|r| r.inputs.push(named(name, pattern)))
    });
    engine.register_fn("input", |b: &mut RuleBuilder, pattern: &str| {
        b.edit(|r| {
            let name = r.inputs.len().to_string();
            r.inputs.push(named(&name, pattern));
        })
    });
    engine.register_fn("inputs", |b: &mut RuleBuilder, patterns: rhai::Array| {
        b.edit(|r| {
            for pattern in strings(patterns) {
                let name = r.inputs.len().to_string();
                r.inputs.push(named(&name, &pattern));
            }
        })
    });
    engine.register_fn("inputs", |b: &mut RuleBuilder, patterns: Map| {
        b.edit(|r| {
            for (name, pattern) in patterns {
                if let Ok(pattern) = pattern.into_string() {
                    r.inputs.push(named(&name, &pattern));
                }
            }
        })
    });

    engine.register_fn("output", |b: &mut RuleBuilder, name: &str, pattern: &str| {
        b.edit(|r| r.outputs.push(output(name, pattern, OutputKind::File)))
    });
    engine.register_fn("output", |b: &mut RuleBuilder, pattern: &str| {
        b.edit(|r| {
            let name = r.outputs.len().to_string();
            r.outputs.push(output(&name, pattern, OutputKind::File));
        })
    });
    engine.register_fn("directory", |b: &mut RuleBuilder, name: &str, pattern: &str| {
        b.edit(|r| r.outputs.push(output(name, pattern, OutputKind::Directory)))
    });
    engine.register_fn("directory", |b: &mut RuleBuilder, pattern: &str| {
        b.edit(|r| {
            let name = r.outputs.len().to_string();
            r.outputs.push(output(&name, pattern, OutputKind::Directory));
        })
    });

    engine.register_fn("log", |b: &mut RuleBuilder, pattern: &str| {
        b.edit(|r| r.log = Some(pattern.into()))
    });

    // Out-of-range values are kept as 0 so validation reports them.
    engine.register_fn("threads", |b: &mut RuleBuilder, n: i64| {
        b.edit(|r| r.resources.threads = u32::try_from(n).unwrap_or(0))
    });
    engine.register_fn("mem_mb", |b: &mut RuleBuilder, n: i64| {
        b.edit(|r| r.resources.mem_mb = Some(u64::try_from(n).unwrap_or(0)))
    });
    engine.register_fn("timeout", |b: &mut RuleBuilder, secs: i64| {
        b.edit(|r| r.timeout_secs = Some(u64::try_from(secs).unwrap_or(0)))
    });

    engine.register_fn("param", |b: &mut RuleBuilder, name: &str, value: Dynamic| {
        b.edit(|r| {
            r.params.insert(name.into(), value.to_string());
        })
    });
    engine.register_fn("params", |b: &mut RuleBuilder, values: Map| {
        b.edit(|r| {
            for (name, value) in values {
                r.params.insert(name.to_string(), value.to_string());
            }
        })
    });

    engine.register_fn("shell", |b: &mut RuleBuilder, template: &str| {
        b.edit(|r| r.shell = Some(template.into()))
    });
}

// ---------------------------------------------------------------------------
// rule(), samples(), target()
// ---------------------------------------------------------------------------

fn register_workflow_api(engine: &mut Engine, model: SharedModel, config: &ResolvedConfig) {
    let m = model.clone();
    engine.register_fn("rule", move |name: &str| -> RuleBuilder {
        let mut model = lock(&m);
        model.rules.push(RuleDef::new(name));
        RuleBuilder {
            model: m.clone(),
            index: model.rules.len() - 1,
        }
    });

    let m = model.clone();
    engine.register_fn("samples", move |dir: &str, patterns: rhai::Array| {
        lock(&m).samples.push(SampleDef {
            dir: dir.into(),
            patterns: strings(patterns),
        });
    });

    let m = model.clone();
    engine.register_fn("samples", move |dir: &str, pattern: &str| {
        lock(&m).samples.push(SampleDef {
            dir: dir.into(),
            patterns: vec![pattern.into()],
        });
    });

    // samples([...]) lists the configured input root.
    let m = model.clone();
    let input_root = config.input_root.to_string_lossy().into_owned();
    engine.register_fn("samples", move |patterns: rhai::Array| {
        lock(&m).samples.push(SampleDef {
            dir: input_root.clone(),
            patterns: strings(patterns),
        });
    });

    let m = model.clone();
    engine.register_fn("target", move |pattern: &str| {
        lock(&m).targets.push(pattern.into());
    });

    let m = model;
    engine.register_fn("targets", move |patterns: rhai::Array| {
        lock(&m).targets.extend(strings(patterns));
    });
}

// ---------------------------------------------------------------------------
// Helper functions available in scripts
// ---------------------------------------------------------------------------

fn register_helpers(engine: &mut Engine, root: &Path) {
    let root_for_project = root.to_path_buf();

    // project_root() -> string
    engine.register_fn("project_root", move || -> String {
        root_for_project.to_string_lossy().into_owned()
    });

    // env("VAR") -> string
    engine.register_fn("env", |var: &str| -> String {
        std::env::var(var).unwrap_or_default()
    });

    // path("a", "b") -> "a/b"
    engine.register_fn("path", |base: &str, rest: &str| -> String {
        PathBuf::from(base).join(rest).to_string_lossy().into_owned()
    });

    // exists("ref/genome.fa") -> bool
    engine.register_fn("exists", |p: &str| -> bool { Path::new(p).exists() });
}

// ---------------------------------------------------------------------------
// Utility functions
// ---------------------------------------------------------------------------

fn named(name: &str, pattern: &str) -> NamedPattern {
    NamedPattern {
        name: name.into(),
        pattern: pattern.into(),
    }
}

fn output(name: &str, pattern: &str, kind: OutputKind) -> OutputDef {
    OutputDef {
        name: name.into(),
        pattern: pattern.into(),
        kind,
    }
}

fn strings(array: rhai::Array) -> Vec<String> {
    array
        .into_iter()
        .filter_map(|v| v.into_string().ok())
        .collect()
}

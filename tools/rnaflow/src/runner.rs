//! Shell-step runner.
//!
//! Runs one task node through an [`Executor`]: stages temporary output
//! locations, renders the command against them, waits for the job while
//! enforcing the time limit and cancellation, then moves the results onto
//! the declared paths. A declared output is only ever created by a rename
//! after a zero exit, so an interrupted or failed step never leaves a
//! complete-looking output behind.
//!
//! Temporaries live in a hidden per-node directory next to each output
//! (`<dir>/.rnaflow-tmp.<tag>/<file name>`). File names are kept, since
//! many tools pick formats from extensions, and index files a tool writes
//! next to its output are moved along with it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use sha2::{Digest, Sha256};

use crate::error::PipelineError;
use crate::executor::{Executor, JobSpec, JobStatus};
use crate::graph::TaskNode;
use crate::model::OutputKind;

/// Why a job was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Timeout,
    Interrupt,
}

/// Execute `node` and publish its outputs.
pub fn run_node<E: Executor>(
    node: &TaskNode,
    executor: &E,
    config: &BTreeMap<String, String>,
    cancel: &AtomicBool,
) -> Result<(), PipelineError> {
    let staging = Staging::prepare(node)?;
    let result = execute(node, executor, config, cancel, &staging);
    let result = result.and_then(|()| staging.publish(node));
    staging.cleanup();
    result
}

fn execute<E: Executor>(
    node: &TaskNode,
    executor: &E,
    config: &BTreeMap<String, String>,
    cancel: &AtomicBool,
    staging: &Staging,
) -> Result<(), PipelineError> {
    let label = node.label();
    let command = node.render_command(&staging.output_pairs(node), config)?;
    tracing::debug!(node = %label, "{command}");

    let exec_error = |e: anyhow::Error| PipelineError::Execution {
        node: label.clone(),
        reason: format!("{e:#}"),
        log: node.log.clone(),
    };

    let job = JobSpec {
        name: &label,
        command: &command,
        log: &node.log,
        threads: node.resources.threads,
        mem_mb: node.resources.mem_mb,
    };
    let mut handle = executor.submit(&job).map_err(exec_error)?;

    let started = Instant::now();
    let mut stop = None;
    let status = loop {
        let status = executor.poll(&mut handle).map_err(exec_error)?;
        if status != JobStatus::Running {
            break status;
        }
        if stop.is_none() {
            if cancel.load(Ordering::SeqCst) {
                stop = Some(StopReason::Interrupt);
            } else if node.timeout.is_some_and(|limit| started.elapsed() >= limit) {
                stop = Some(StopReason::Timeout);
            }
            if stop.is_some() {
                tracing::debug!(node = %label, ?stop, "stopping job");
                executor.cancel(&mut handle).map_err(exec_error)?;
            }
        }
        std::thread::sleep(executor.poll_interval());
    };

    let reason = match status {
        // Finished before any stop request took effect.
        JobStatus::Succeeded => return Ok(()),
        JobStatus::Failed(reason) => reason,
        JobStatus::Running => "job did not finish".to_string(),
    };
    Err(match stop {
        Some(StopReason::Timeout) => PipelineError::Timeout {
            node: label,
            limit: node.timeout.unwrap_or_default(),
            log: node.log.clone(),
        },
        Some(StopReason::Interrupt) => PipelineError::Interrupted {
            node: label,
            log: node.log.clone(),
        },
        None => PipelineError::Execution {
            node: label,
            reason,
            log: node.log.clone(),
        },
    })
}

/// Temporary locations for one node's outputs.
struct Staging {
    /// Declared path → temporary path, in declaration order.
    temps: Vec<(PathBuf, PathBuf)>,
    /// Temporary directory → directory its contents move to.
    dirs: BTreeMap<PathBuf, PathBuf>,
}

impl Staging {
    /// Create parent and temporary directories and clear previous outputs.
    fn prepare(node: &TaskNode) -> Result<Self, PipelineError> {
        let tag = node_tag(node);
        let mut temps = Vec::with_capacity(node.outputs.len());
        let mut dirs = BTreeMap::new();

        for out in &node.outputs {
            let parent = parent_dir(&out.path);
            let file_name = out.path.file_name().ok_or_else(|| {
                PipelineError::Configuration(format!(
                    "{}: output {} has no file name",
                    node.label(),
                    out.path.display()
                ))
            })?;
            let tmp_dir = parent.join(format!(".rnaflow-tmp.{tag}"));
            let tmp = tmp_dir.join(file_name);

            if !dirs.contains_key(&tmp_dir) {
                remove_path(&tmp_dir)?;
                fs::create_dir_all(&tmp_dir)?;
                dirs.insert(tmp_dir.clone(), parent.to_path_buf());
            }
            // Outputs are rewritten from scratch.
            remove_path(&out.path)?;
            if out.kind == OutputKind::Directory {
                fs::create_dir_all(&tmp)?;
            }
            temps.push((out.path.clone(), tmp));
        }

        fs::create_dir_all(parent_dir(&node.log))?;
        Ok(Self { temps, dirs })
    }

    fn output_pairs(&self, node: &TaskNode) -> Vec<(String, String)> {
        node.outputs
            .iter()
            .zip(&self.temps)
            .map(|(out, (_, tmp))| (out.name.clone(), tmp.to_string_lossy().into_owned()))
            .collect()
    }

    /// Move staged results onto their final paths.
    fn publish(&self, node: &TaskNode) -> Result<(), PipelineError> {
        for (path, tmp) in &self.temps {
            if fs::symlink_metadata(tmp).is_err() {
                return Err(PipelineError::Execution {
                    node: node.label(),
                    reason: format!("declared output {} was not created", path.display()),
                    log: node.log.clone(),
                });
            }
        }
        // Declared outputs first, then any side files (indexes).
        for (path, tmp) in &self.temps {
            fs::rename(tmp, path)?;
        }
        for (tmp_dir, parent) in &self.dirs {
            for entry in fs::read_dir(tmp_dir)? {
                let entry = entry?;
                let dest = parent.join(entry.file_name());
                remove_path(&dest)?;
                fs::rename(entry.path(), dest)?;
            }
        }
        Ok(())
    }

    /// Remove temporary directories. Errors are logged, not returned.
    fn cleanup(&self) {
        for tmp_dir in self.dirs.keys() {
            if let Err(e) = remove_path(tmp_dir) {
                tracing::warn!("failed to remove {}: {e}", tmp_dir.display());
            }
        }
    }
}

/// Short stable tag distinguishing one node's temporaries from another's.
fn node_tag(node: &TaskNode) -> String {
    let digest = Sha256::digest(node.label().as_bytes());
    format!("{digest:x}")[..12].to_string()
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Remove a file, symlink or directory tree if present.
pub fn remove_path(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

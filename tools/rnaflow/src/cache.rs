//! Staleness tracking for task nodes.
//!
//! A node is fresh when all of its outputs exist, its rule fingerprint is
//! unchanged, none of its producers ran in this session, and no input is
//! newer than its oldest output. Rule fingerprints (SHA-256 of the command
//! template and rendered params) are kept in a JSON manifest under the
//! output root so that editing a rule reruns it even when timestamps say
//! otherwise.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::graph::{Dag, NodeId, TaskNode};

/// Current schema version. Bump when the manifest format changes.
const MANIFEST_VERSION: u32 = 1;

/// Manifest filename within the state directory.
const MANIFEST_FILE: &str = "fingerprints.json";

/// Result of a freshness check on a task node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreshResult {
    /// The node's outputs are up to date.
    Fresh,
    /// The node must run, with a human-readable reason.
    Stale(String),
}

/// Which nodes to rerun regardless of their state on disk.
#[derive(Debug, Default, Clone)]
pub struct ForcePolicy {
    /// Rerun everything.
    pub all: bool,
    /// Rerun every node of these rules.
    pub rules: BTreeSet<String>,
}

/// Persisted rule fingerprints, keyed by node label.
#[derive(Debug, Serialize, Deserialize)]
pub struct FingerprintManifest {
    /// Schema version for forward compatibility.
    pub version: u32,
    pub entries: BTreeMap<String, NodeRecord>,
}

/// What was recorded when a node last completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    /// SHA-256 of the rule template and rendered params.
    pub fingerprint: String,
    /// Completion time (seconds since the Unix epoch).
    pub completed_at_secs: u64,
}

impl Default for FingerprintManifest {
    fn default() -> Self {
        Self::new()
    }
}

impl FingerprintManifest {
    /// Create a new empty manifest.
    pub fn new() -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries: BTreeMap::new(),
        }
    }

    /// Load the manifest from `<state_dir>/fingerprints.json`.
    ///
    /// A missing, corrupt or outdated manifest yields an empty one; absent
    /// records never make a node stale.
    pub fn load(state_dir: &Path) -> Self {
        let path = state_dir.join(MANIFEST_FILE);
        let Ok(data) = fs::read_to_string(&path) else {
            return Self::new();
        };
        match serde_json::from_str::<Self>(&data) {
            Ok(manifest) if manifest.version == MANIFEST_VERSION => manifest,
            Ok(_) => {
                tracing::debug!("ignoring fingerprint manifest with old schema version");
                Self::new()
            }
            Err(e) => {
                tracing::warn!("ignoring unreadable {}: {e}", path.display());
                Self::new()
            }
        }
    }

    /// Save the manifest atomically (write to tmp, then rename).
    pub fn save(&self, state_dir: &Path) -> Result<()> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("failed to create {}", state_dir.display()))?;

        let path = state_dir.join(MANIFEST_FILE);
        let tmp_path = state_dir.join(format!("{MANIFEST_FILE}.tmp"));

        let json = serde_json::to_string_pretty(self)
            .context("failed to serialize fingerprint manifest")?;
        fs::write(&tmp_path, json)
            .context("failed to write temporary fingerprint manifest")?;
        fs::rename(&tmp_path, &path)
            .context("failed to atomically replace fingerprint manifest")?;

        Ok(())
    }

    /// Record a node that just completed successfully.
    pub fn record(&mut self, node: &TaskNode) {
        let completed_at_secs = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.entries.insert(
            node.label(),
            NodeRecord {
                fingerprint: fingerprint(node),
                completed_at_secs,
            },
        );
    }

    /// Forget a node, e.g. after its outputs were removed.
    pub fn forget(&mut self, node: &TaskNode) {
        self.entries.remove(&node.label());
    }
}

/// Check whether `node` needs to run.
///
/// `rebuilt` holds the nodes that ran (or are planned to run) in this
/// session; any of them being a producer of `node` makes it stale.
pub fn check_node(
    dag: &Dag,
    node: &TaskNode,
    manifest: &FingerprintManifest,
    rebuilt: &BTreeSet<NodeId>,
    force: &ForcePolicy,
) -> FreshResult {
    // 1. Forced?
    if force.all {
        return FreshResult::Stale("forced".into());
    }
    if force.rules.contains(&node.rule_name) {
        return FreshResult::Stale(format!("rule '{}' forced", node.rule_name));
    }

    // 2. Every output present?
    let mut oldest_output: Option<(SystemTime, &Path)> = None;
    for out in &node.outputs {
        match mtime(&out.path) {
            Some(t) => {
                if oldest_output.is_none_or(|(o, _)| t < o) {
                    oldest_output = Some((t, &out.path));
                }
            }
            None => {
                return FreshResult::Stale(format!("missing output {}", out.path.display()));
            }
        }
    }

    // 3. Rule definition changed since the last run?
    if let Some(record) = manifest.entries.get(&node.label()) {
        if record.fingerprint != fingerprint(node) {
            return FreshResult::Stale("rule definition changed".into());
        }
    }

    // 4. Any producer ran in this session?
    for dep in &dag.deps[node.id] {
        if rebuilt.contains(dep) {
            return FreshResult::Stale(format!(
                "input from {} was regenerated",
                dag.nodes[*dep].label()
            ));
        }
    }

    // 5. Any input newer than the oldest output?
    let Some((oldest, oldest_path)) = oldest_output else {
        return FreshResult::Fresh;
    };
    for (_, input) in &node.inputs {
        if let Some(t) = mtime(input) {
            if t > oldest {
                return FreshResult::Stale(format!(
                    "input {} is newer than {}",
                    input.display(),
                    oldest_path.display()
                ));
            }
        }
    }

    FreshResult::Fresh
}

/// Predict which nodes a run would execute, with the reason for each.
///
/// A node is planned when it is stale on its own or any of its producers is
/// planned.
pub fn plan(
    dag: &Dag,
    manifest: &FingerprintManifest,
    force: &ForcePolicy,
) -> BTreeMap<NodeId, String> {
    let mut planned = BTreeMap::new();
    let mut rebuilt = BTreeSet::new();
    for id in dag.topological_order() {
        if let FreshResult::Stale(reason) = check_node(dag, &dag.nodes[id], manifest, &rebuilt, force) {
            rebuilt.insert(id);
            planned.insert(id, reason);
        }
    }
    planned
}

/// Inputs of `node` that do not exist on disk.
pub fn missing_inputs(node: &TaskNode) -> Vec<PathBuf> {
    node.inputs
        .iter()
        .filter(|(_, p)| !p.exists())
        .map(|(_, p)| p.clone())
        .collect()
}

/// Fingerprint of a node's rule template and rendered params.
pub fn fingerprint(node: &TaskNode) -> String {
    let mut hasher = Sha256::new();
    hasher.update(node.shell.as_bytes());
    for (name, value) in &node.params {
        hasher.update([0]);
        hasher.update(name.as_bytes());
        hasher.update([b'=']);
        hasher.update(value.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// A path's modification time, or `None` if it does not exist.
pub fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::graph::tests::rule;
    use crate::graph::{GraphOptions, build};
    use crate::registry::RuleRegistry;

    struct Project {
        dir: tempfile::TempDir,
        dag: Dag,
    }

    impl Project {
        /// `raw -> trimmed -> counted` for one sample, built from `root`.
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().display().to_string();
            let raw = format!("{root}/{{s}}.raw");
            let trimmed = format!("{root}/{{s}}.trimmed");
            let counted = format!("{root}/{{s}}.count");
            let defs = vec![
                rule("trim", &[raw.as_str()], &[trimmed.as_str()], "cp {input} {output}"),
                rule("count", &[trimmed.as_str()], &[counted.as_str()], "wc -l {input} > {output}"),
            ];
            let registry = RuleRegistry::from_defs(&defs).unwrap();
            let config = BTreeMap::new();
            let dag = build(
                &registry,
                &[format!("{root}/A.count")],
                &GraphOptions {
                    config: &config,
                    default_timeout: None,
                },
            )
            .unwrap();
            Self { dir, dag }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn write_at(&self, name: &str, secs_ago: u64) {
            let path = self.path(name);
            fs::write(&path, name).unwrap();
            let when = SystemTime::now() - Duration::from_secs(secs_ago);
            fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(when)
                .unwrap();
        }

        fn check(&self, id: NodeId, manifest: &FingerprintManifest, rebuilt: &BTreeSet<NodeId>) -> FreshResult {
            check_node(&self.dag, &self.dag.nodes[id], manifest, rebuilt, &ForcePolicy::default())
        }
    }

    #[test]
    fn missing_output_is_stale() {
        let p = Project::new();
        p.write_at("A.raw", 30);
        let result = p.check(0, &FingerprintManifest::new(), &BTreeSet::new());
        assert!(matches!(result, FreshResult::Stale(ref r) if r.starts_with("missing output")), "{result:?}");
    }

    #[test]
    fn outputs_newer_than_inputs_are_fresh() {
        let p = Project::new();
        p.write_at("A.raw", 30);
        p.write_at("A.trimmed", 20);
        p.write_at("A.count", 10);
        let manifest = FingerprintManifest::new();
        assert_eq!(p.check(0, &manifest, &BTreeSet::new()), FreshResult::Fresh);
        assert_eq!(p.check(1, &manifest, &BTreeSet::new()), FreshResult::Fresh);
        assert!(plan(&p.dag, &manifest, &ForcePolicy::default()).is_empty());
    }

    #[test]
    fn touched_root_input_replans_the_whole_chain() {
        let p = Project::new();
        p.write_at("A.raw", 5);
        p.write_at("A.trimmed", 20);
        p.write_at("A.count", 10);
        let planned = plan(&p.dag, &FingerprintManifest::new(), &ForcePolicy::default());
        assert_eq!(planned.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert!(planned[&0].contains("is newer than"));
        assert!(planned[&1].contains("regenerated"));
    }

    #[test]
    fn changed_fingerprint_is_stale() {
        let p = Project::new();
        p.write_at("A.raw", 30);
        p.write_at("A.trimmed", 20);
        let mut manifest = FingerprintManifest::new();
        manifest.record(&p.dag.nodes[0]);
        assert_eq!(p.check(0, &manifest, &BTreeSet::new()), FreshResult::Fresh);

        manifest.entries.get_mut(&p.dag.nodes[0].label()).unwrap().fingerprint = "old".into();
        assert_eq!(
            p.check(0, &manifest, &BTreeSet::new()),
            FreshResult::Stale("rule definition changed".into())
        );
    }

    #[test]
    fn forcing_a_rule_marks_only_that_rule() {
        let p = Project::new();
        p.write_at("A.raw", 30);
        p.write_at("A.trimmed", 20);
        p.write_at("A.count", 10);
        let force = ForcePolicy {
            all: false,
            rules: BTreeSet::from(["count".to_string()]),
        };
        let planned = plan(&p.dag, &FingerprintManifest::new(), &force);
        assert_eq!(planned.keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn manifest_round_trips_through_disk() {
        let p = Project::new();
        let state = p.path(".rnaflow");
        let mut manifest = FingerprintManifest::new();
        manifest.record(&p.dag.nodes[1]);
        manifest.save(&state).unwrap();
        assert!(!state.join("fingerprints.json.tmp").exists());

        let loaded = FingerprintManifest::load(&state);
        assert_eq!(
            loaded.entries[&p.dag.nodes[1].label()].fingerprint,
            fingerprint(&p.dag.nodes[1])
        );

        fs::write(state.join(MANIFEST_FILE), "{not json").unwrap();
        assert!(FingerprintManifest::load(&state).entries.is_empty());
    }

    #[test]
    fn missing_inputs_are_listed() {
        let p = Project::new();
        assert_eq!(missing_inputs(&p.dag.nodes[0]), vec![p.path("A.raw")]);
        p.write_at("A.raw", 1);
        assert!(missing_inputs(&p.dag.nodes[0]).is_empty());
    }
}

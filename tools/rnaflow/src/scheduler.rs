//! DAG scheduler.
//!
//! The main thread owns all node state. It decides freshness lazily (when a
//! node becomes ready, so producers that ran this session are known),
//! dispatches stale nodes to a fixed pool of worker threads within the
//! thread and memory budgets, and releases consumers as results come back.
//! Workers only run the shell step for the node id they receive.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, mpsc};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};

use crate::cache::{self, FingerprintManifest, ForcePolicy, FreshResult};
use crate::error::PipelineError;
use crate::executor::Executor;
use crate::graph::{Dag, NodeId, TaskNode};
use crate::runner;

/// How long the main thread blocks on results before rechecking the
/// interrupt flag.
const RESULT_WAIT: Duration = Duration::from_millis(200);

/// Operator budget and failure policy for one run.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Worker threads, i.e. the maximum number of concurrent jobs.
    pub jobs: usize,
    /// Global thread budget shared by running jobs.
    pub cores: u32,
    /// Global memory budget in MiB, if any.
    pub mem_mb: Option<u64>,
    /// Keep dispatching independent nodes after a failure.
    pub keep_going: bool,
    pub force: ForcePolicy,
}

/// Lifecycle of a node within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Waiting on producers.
    Pending,
    /// All producers done; waiting for a worker and budget.
    Ready,
    Running,
    /// Executed or already up to date.
    Done,
    Failed,
    /// A producer failed, or the run stopped before this node started.
    Blocked,
}

/// Outcome of a run.
#[derive(Debug)]
pub struct RunSummary {
    pub states: Vec<NodeState>,
    /// Nodes that ran a shell step successfully.
    pub executed: BTreeSet<NodeId>,
    pub failures: Vec<(NodeId, PipelineError)>,
    /// Wall-clock time per executed node.
    pub timings: Vec<(NodeId, Duration)>,
    pub elapsed: Duration,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn count(&self, state: NodeState) -> usize {
        self.states.iter().filter(|&&s| s == state).count()
    }

    /// Done without running.
    pub fn up_to_date(&self) -> usize {
        self.count(NodeState::Done) - self.executed.len()
    }

    pub fn is_success(&self) -> bool {
        !self.interrupted
            && self
                .states
                .iter()
                .all(|s| matches!(s, NodeState::Done))
    }

    /// Print the final report to stdout.
    pub fn print(&self, dag: &Dag) {
        println!();
        println!(
            "  {} executed, {} up to date, {} failed, {} blocked ({:.1?})",
            self.executed.len(),
            self.up_to_date(),
            self.count(NodeState::Failed),
            self.count(NodeState::Blocked),
            self.elapsed
        );

        if !self.timings.is_empty() {
            let mut sorted = self.timings.clone();
            sorted.sort_by(|a, b| b.1.cmp(&a.1));
            sorted.truncate(5);
            crate::verbose::vprintln!();
            crate::verbose::vprintln!("  Slowest steps:");
            for (id, dur) in &sorted {
                crate::verbose::vprintln!("    {:<40} {:.1?}", dag.nodes[*id].label(), dur);
            }
        }

        for (_, err) in &self.failures {
            println!("  FAILED {err}");
        }
        if self.interrupted {
            println!("  Interrupted.");
        }
    }
}

/// Result sent back by a worker.
struct Outcome {
    node: NodeId,
    result: Result<(), PipelineError>,
    elapsed: Duration,
}

/// Budget cost of a node: threads clamped to the budget, memory likewise.
fn cost(node: &TaskNode, opts: &SchedulerOptions) -> (u32, u64) {
    let threads = node.resources.threads.clamp(1, opts.cores.max(1));
    let mem = match (node.resources.mem_mb, opts.mem_mb) {
        (Some(want), Some(budget)) => want.min(budget),
        _ => 0,
    };
    (threads, mem)
}

/// Run every stale node of `dag`, recording completions in `manifest`.
///
/// Node failures are reported in the summary; `Err` is returned only when
/// the scheduler itself breaks down.
pub fn execute<E: Executor>(
    dag: &Dag,
    executor: &E,
    manifest: &mut FingerprintManifest,
    config: &BTreeMap<String, String>,
    opts: &SchedulerOptions,
    cancel: &AtomicBool,
) -> Result<RunSummary> {
    let total = dag.len();
    let started = Instant::now();

    let mut states = vec![NodeState::Pending; total];
    let mut waiting: Vec<usize> = dag.deps.iter().map(Vec::len).collect();
    let mut ready: BTreeSet<NodeId> = BTreeSet::new();
    for id in 0..total {
        if waiting[id] == 0 {
            states[id] = NodeState::Ready;
            ready.insert(id);
        }
    }

    let workers = opts.jobs.clamp(1, total.max(1));
    let mut free_threads = opts.cores.max(1);
    let mut free_mem = opts.mem_mb.unwrap_or(0);

    let mut rebuilt = BTreeSet::new();
    let mut executed = BTreeSet::new();
    let mut failures = Vec::new();
    let mut timings = Vec::new();
    let mut halted = false;
    let mut interrupted = false;

    tracing::debug!(
        nodes = total,
        workers,
        cores = opts.cores,
        backend = executor.name(),
        "starting scheduler"
    );

    let (job_tx, job_rx) = mpsc::channel::<NodeId>();
    let (result_tx, result_rx) = mpsc::channel::<Outcome>();
    let job_rx = Mutex::new(job_rx);
    let job_rx_ref = &job_rx;

    std::thread::scope(|s| -> Result<()> {
        for _ in 0..workers {
            let tx = result_tx.clone();
            s.spawn(move || {
                loop {
                    let next = job_rx_ref
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .recv();
                    let Ok(node) = next else { break };

                    let start = Instant::now();
                    let result = runner::run_node(&dag.nodes[node], executor, config, cancel);
                    let outcome = Outcome {
                        node,
                        result,
                        elapsed: start.elapsed(),
                    };
                    if tx.send(outcome).is_err() {
                        break;
                    }
                }
            });
        }

        // Drop the cloned sender so the channel closes when workers finish.
        drop(result_tx);

        let mut in_flight = 0usize;
        let mut finished = 0usize;

        loop {
            if !halted && cancel.load(Ordering::SeqCst) {
                tracing::warn!("interrupted; waiting for {in_flight} running job(s) to stop");
                halted = true;
                interrupted = true;
            }

            // Settle ready nodes until a pass makes no progress.
            let mut progressed = !halted;
            while progressed {
                progressed = false;
                let candidates: Vec<NodeId> = ready.iter().copied().collect();
                for id in candidates {
                    if halted || in_flight >= workers {
                        break;
                    }
                    let node = &dag.nodes[id];

                    let reason = match cache::check_node(dag, node, manifest, &rebuilt, &opts.force) {
                        FreshResult::Fresh => {
                            tracing::debug!("{}: up to date", node.label());
                            ready.remove(&id);
                            states[id] = NodeState::Done;
                            finished += 1;
                            release(dag, id, &mut waiting, &mut states, &mut ready);
                            progressed = true;
                            continue;
                        }
                        FreshResult::Stale(reason) => reason,
                    };

                    if let Some(path) = cache::missing_inputs(node).into_iter().next() {
                        ready.remove(&id);
                        let err = PipelineError::MissingInput {
                            node: node.label(),
                            path,
                        };
                        fail(dag, id, err, &mut states, &mut ready, &mut failures);
                        finished += 1;
                        halted |= !opts.keep_going;
                        progressed = true;
                        continue;
                    }

                    let (threads, mem) = cost(node, opts);
                    if threads > free_threads || mem > free_mem {
                        // Leave it for later; smaller nodes may backfill.
                        continue;
                    }

                    ready.remove(&id);
                    states[id] = NodeState::Running;
                    free_threads -= threads;
                    free_mem -= mem;
                    in_flight += 1;
                    tracing::info!("[{}/{}] {} ({reason})", finished + in_flight, total, node.label());
                    if job_tx.send(id).is_err() {
                        bail!("worker threads terminated unexpectedly");
                    }
                    progressed = true;
                }
            }

            if in_flight == 0 {
                break;
            }

            let outcome = match result_rx.recv_timeout(RESULT_WAIT) {
                Ok(outcome) => outcome,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    bail!("worker threads terminated unexpectedly");
                }
            };

            in_flight -= 1;
            finished += 1;
            let id = outcome.node;
            let node = &dag.nodes[id];
            let (threads, mem) = cost(node, opts);
            free_threads += threads;
            free_mem += mem;

            match outcome.result {
                Ok(()) => {
                    tracing::debug!("{}: finished in {:.1?}", node.label(), outcome.elapsed);
                    states[id] = NodeState::Done;
                    rebuilt.insert(id);
                    executed.insert(id);
                    timings.push((id, outcome.elapsed));
                    manifest.record(node);
                    release(dag, id, &mut waiting, &mut states, &mut ready);
                }
                Err(err) => {
                    if matches!(err, PipelineError::Interrupted { .. }) {
                        interrupted = true;
                    }
                    // Outputs are gone, so the old fingerprint no longer applies.
                    manifest.forget(node);
                    fail(dag, id, err, &mut states, &mut ready, &mut failures);
                    halted |= !opts.keep_going;
                }
            }
        }

        // Close the job channel to shut down workers.
        drop(job_tx);
        Ok(())
    })?;

    for state in &mut states {
        if matches!(state, NodeState::Pending | NodeState::Ready) {
            *state = NodeState::Blocked;
        }
    }

    Ok(RunSummary {
        states,
        executed,
        failures,
        timings,
        elapsed: started.elapsed(),
        interrupted,
    })
}

/// Mark `id` done for its consumers, moving any that are now unblocked to
/// the ready set.
fn release(
    dag: &Dag,
    id: NodeId,
    waiting: &mut [usize],
    states: &mut [NodeState],
    ready: &mut BTreeSet<NodeId>,
) {
    for &next in &dag.dependents[id] {
        waiting[next] -= 1;
        if waiting[next] == 0 && states[next] == NodeState::Pending {
            states[next] = NodeState::Ready;
            ready.insert(next);
        }
    }
}

/// Record a failure and block everything downstream of it.
fn fail(
    dag: &Dag,
    id: NodeId,
    err: PipelineError,
    states: &mut [NodeState],
    ready: &mut BTreeSet<NodeId>,
    failures: &mut Vec<(NodeId, PipelineError)>,
) {
    states[id] = NodeState::Failed;
    let blocked = dag.descendants(id);
    for &d in &blocked {
        if matches!(states[d], NodeState::Pending | NodeState::Ready) {
            states[d] = NodeState::Blocked;
            ready.remove(&d);
        }
    }
    match err.log_path() {
        Some(log) => tracing::error!(
            "{err}; {} downstream node(s) blocked; see {}",
            blocked.len(),
            log.display()
        ),
        None => tracing::error!("{err}; {} downstream node(s) blocked", blocked.len()),
    }
    failures.push((id, err));
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::*;
    use crate::executor::LocalExecutor;
    use crate::graph::tests::rule;
    use crate::graph::{GraphOptions, build};
    use crate::model::RuleDef;
    use crate::registry::RuleRegistry;

    struct Fixture {
        dir: tempfile::TempDir,
        dag: Dag,
        manifest: FingerprintManifest,
    }

    impl Fixture {
        /// `{s}.in -> {s}.a -> {s}.b` for each sample; sample `bad` fails in
        /// the first step.
        fn new(samples: &[&str], tweak: impl FnOnce(&mut Vec<RuleDef>)) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().display().to_string();
            let (input, a, b) = (
                format!("{root}/{{s}}.in"),
                format!("{root}/{{s}}.a"),
                format!("{root}/{{s}}.b"),
            );
            let mut defs = vec![
                rule(
                    "first",
                    &[input.as_str()],
                    &[a.as_str()],
                    "if [ {wildcards.s} = bad ]; then echo broken >&2; exit 1; fi; cp {input} {output}",
                ),
                rule("second", &[a.as_str()], &[b.as_str()], "cat {input} > {output}; echo done >> {output}"),
            ];
            tweak(&mut defs);
            for s in samples {
                fs::write(dir.path().join(format!("{s}.in")), s).unwrap();
            }
            let registry = RuleRegistry::from_defs(&defs).unwrap();
            let targets: Vec<String> = samples.iter().map(|s| format!("{root}/{s}.b")).collect();
            let config = BTreeMap::new();
            let dag = build(
                &registry,
                &targets,
                &GraphOptions {
                    config: &config,
                    default_timeout: None,
                },
            )
            .unwrap();
            Self {
                dir,
                dag,
                manifest: FingerprintManifest::new(),
            }
        }

        fn run(&mut self, opts: &SchedulerOptions, cancel: bool) -> RunSummary {
            let flag = AtomicBool::new(cancel);
            execute(
                &self.dag,
                &LocalExecutor::new("sh"),
                &mut self.manifest,
                &BTreeMap::new(),
                opts,
                &flag,
            )
            .unwrap()
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }
    }

    fn opts(jobs: usize, keep_going: bool) -> SchedulerOptions {
        SchedulerOptions {
            jobs,
            cores: 4,
            mem_mb: None,
            keep_going,
            force: ForcePolicy::default(),
        }
    }

    #[test]
    fn runs_everything_then_nothing() {
        let mut f = Fixture::new(&["S1", "S2"], |_| {});
        let first = f.run(&opts(2, false), false);
        assert!(first.is_success(), "{first:?}");
        assert_eq!(first.executed.len(), 4);
        assert_eq!(fs::read_to_string(f.path("S2.b")).unwrap(), "S2done\n");
        assert_eq!(f.manifest.entries.len(), 4);

        let second = f.run(&opts(2, false), false);
        assert!(second.is_success());
        assert!(second.executed.is_empty());
        assert_eq!(second.up_to_date(), 4);
    }

    #[test]
    fn failure_blocks_descendants_and_halts() {
        // Ids: first[bad]=0, second[bad]=1, first[ok]=2, second[ok]=3.
        let mut f = Fixture::new(&["bad", "ok"], |_| {});
        let summary = f.run(&opts(1, false), false);
        assert_eq!(
            summary.states,
            vec![NodeState::Failed, NodeState::Blocked, NodeState::Blocked, NodeState::Blocked]
        );
        assert_eq!(summary.failures.len(), 1);
        let log = summary.failures[0].1.log_path().unwrap();
        assert!(fs::read_to_string(log).unwrap().contains("broken"));
        assert!(!f.path("bad.a").exists());
    }

    #[test]
    fn keep_going_finishes_independent_branches() {
        let mut f = Fixture::new(&["bad", "ok"], |_| {});
        let summary = f.run(&opts(1, true), false);
        assert_eq!(
            summary.states,
            vec![NodeState::Failed, NodeState::Blocked, NodeState::Done, NodeState::Done]
        );
        assert!(!summary.is_success());
        assert!(f.path("ok.b").exists());
    }

    #[test]
    fn missing_root_input_fails_its_consumer() {
        let mut f = Fixture::new(&["S1"], |_| {});
        fs::remove_file(f.path("S1.in")).unwrap();
        let summary = f.run(&opts(1, true), false);
        assert!(matches!(summary.failures[0].1, PipelineError::MissingInput { .. }));
        assert_eq!(summary.count(NodeState::Blocked), 1);
    }

    #[test]
    fn oversized_thread_requests_are_clamped() {
        let mut f = Fixture::new(&["S1", "S2"], |defs| {
            defs[0].resources.threads = 64;
        });
        let mut o = opts(2, false);
        o.cores = 2;
        o.mem_mb = Some(1000);
        let summary = f.run(&o, false);
        assert!(summary.is_success(), "{summary:?}");
        assert_eq!(summary.executed.len(), 4);
    }

    /// Make every step log `start`/`end` lines around a short sleep into a
    /// shared trace file beside the inputs.
    fn traced(defs: &mut Vec<RuleDef>) {
        for def in defs.iter_mut() {
            def.shell = Some(
                "echo \"start {rule} {wildcards.s}\" >> $(dirname {input})/trace; sleep 0.3; \
                 cp {input} {output}; echo \"end {rule} {wildcards.s}\" >> $(dirname {input})/trace"
                    .into(),
            );
        }
    }

    /// Steps never overlapped: the trace strictly alternates start and end
    /// of the same step.
    fn assert_serialized(trace: &str, steps: usize) {
        let lines: Vec<&str> = trace.lines().collect();
        assert_eq!(lines.len(), 2 * steps, "{trace}");
        for pair in lines.chunks(2) {
            let start = pair[0].strip_prefix("start ").unwrap_or_else(|| panic!("{trace}"));
            let end = pair[1].strip_prefix("end ").unwrap_or_else(|| panic!("{trace}"));
            assert_eq!(start, end, "overlapping steps:\n{trace}");
        }
    }

    #[test]
    fn thread_budget_serializes_steps() {
        let mut f = Fixture::new(&["S1", "S2"], |defs| {
            traced(defs);
            for def in defs.iter_mut() {
                def.resources.threads = 2;
            }
        });
        let mut o = opts(2, false);
        o.cores = 2;
        let summary = f.run(&o, false);
        assert!(summary.is_success(), "{summary:?}");
        assert_serialized(&fs::read_to_string(f.path("trace")).unwrap(), 4);
    }

    #[test]
    fn memory_budget_serializes_steps() {
        let mut f = Fixture::new(&["S1", "S2"], |defs| {
            traced(defs);
            for def in defs.iter_mut() {
                def.resources.mem_mb = Some(600);
            }
        });
        let mut o = opts(2, false);
        o.mem_mb = Some(1000);
        let summary = f.run(&o, false);
        assert!(summary.is_success(), "{summary:?}");
        assert_serialized(&fs::read_to_string(f.path("trace")).unwrap(), 4);
    }

    #[test]
    fn interrupt_before_start_blocks_everything() {
        let mut f = Fixture::new(&["S1"], |_| {});
        let summary = f.run(&opts(1, false), true);
        assert!(summary.interrupted);
        assert!(summary.executed.is_empty());
        assert_eq!(summary.count(NodeState::Blocked), 2);
    }

    #[test]
    fn forced_rule_reruns_only_that_rule() {
        let mut f = Fixture::new(&["S1"], |_| {});
        assert!(f.run(&opts(1, false), false).is_success());

        let mut o = opts(1, false);
        o.force.rules.insert("second".into());
        let summary = f.run(&o, false);
        assert_eq!(summary.executed, BTreeSet::from([1]));
    }
}

//! Execution backends.
//!
//! A backend only knows how to start a shell command, report whether it is
//! still running, and stop it. Output staging, logging policy and timeouts
//! live in the runner, so both backends behave the same from the
//! scheduler's point of view.

use std::fs::File;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use regex::{Captures, Regex};

use crate::config::ClusterConfig;
use crate::signal::{signal_process_group, track_process_group, untrack_process_group};
use crate::template::shell_quote;

/// One shell step ready to be started.
#[derive(Debug)]
pub struct JobSpec<'a> {
    /// Node label, used as the job name.
    pub name: &'a str,
    pub command: &'a str,
    /// Combined stdout/stderr destination.
    pub log: &'a Path,
    pub threads: u32,
    pub mem_mb: Option<u64>,
}

/// State of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Succeeded,
    /// Finished unsuccessfully, with a short reason.
    Failed(String),
}

/// A backend that can run shell steps.
pub trait Executor: Send + Sync {
    /// Per-job handle kept by the monitoring worker.
    type Handle: Send;

    fn name(&self) -> &'static str;

    /// Start a job. Returns once the job is accepted, not when it finishes.
    fn submit(&self, job: &JobSpec<'_>) -> Result<Self::Handle>;

    fn poll(&self, handle: &mut Self::Handle) -> Result<JobStatus>;

    /// Ask the job to stop. Polling continues until it reports a final state.
    fn cancel(&self, handle: &mut Self::Handle) -> Result<()>;

    /// How long to sleep between polls.
    fn poll_interval(&self) -> Duration;
}

/// Wrap a command so the shell stops at the first failing statement.
fn strict_script(shell: &str, command: &str) -> String {
    let is_bash = Path::new(shell)
        .file_name()
        .is_some_and(|n| n == "bash" || n == "zsh");
    if is_bash {
        format!("set -euo pipefail\n{command}")
    } else {
        format!("set -eu\n{command}")
    }
}

// ---------------------------------------------------------------------------
// Local subprocesses
// ---------------------------------------------------------------------------

/// Grace period between SIGTERM and SIGKILL for cancelled local jobs.
const KILL_GRACE: Duration = Duration::from_secs(10);

/// Runs each job as a child process in its own process group.
pub struct LocalExecutor {
    shell: String,
}

pub struct LocalHandle {
    child: Child,
    terminated_at: Option<Instant>,
    killed: bool,
    /// Registered for termination on a forced exit.
    tracked: bool,
}

impl LocalHandle {
    fn untrack(&mut self) {
        if self.tracked {
            untrack_process_group(self.child.id());
            self.tracked = false;
        }
    }
}

impl Drop for LocalHandle {
    fn drop(&mut self) {
        self.untrack();
    }
}

impl LocalExecutor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Executor for LocalExecutor {
    type Handle = LocalHandle;

    fn name(&self) -> &'static str {
        "local"
    }

    fn submit(&self, job: &JobSpec<'_>) -> Result<LocalHandle> {
        let log = File::create(job.log)
            .with_context(|| format!("failed to create log {}", job.log.display()))?;
        let log_err = log.try_clone().context("failed to duplicate log handle")?;

        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(strict_script(&self.shell, job.command))
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .process_group(0)
            .spawn()
            .with_context(|| format!("failed to spawn {} for {}", self.shell, job.name))?;

        tracing::trace!(job = job.name, pid = child.id(), "spawned");
        let tracked = track_process_group(child.id());
        if !tracked {
            tracing::warn!(job = job.name, "too many running jobs to track for forced exit");
        }
        Ok(LocalHandle {
            child,
            terminated_at: None,
            killed: false,
            tracked,
        })
    }

    fn poll(&self, handle: &mut LocalHandle) -> Result<JobStatus> {
        if let Some(status) = handle.child.try_wait()? {
            handle.untrack();
            return Ok(if status.success() {
                JobStatus::Succeeded
            } else {
                JobStatus::Failed(describe_exit(status))
            });
        }
        if let Some(at) = handle.terminated_at {
            if !handle.killed && at.elapsed() >= KILL_GRACE {
                signal_process_group(handle.child.id(), libc::SIGKILL)?;
                handle.killed = true;
            }
        }
        Ok(JobStatus::Running)
    }

    fn cancel(&self, handle: &mut LocalHandle) -> Result<()> {
        if handle.terminated_at.is_none() {
            signal_process_group(handle.child.id(), libc::SIGTERM)?;
            handle.terminated_at = Some(Instant::now());
        }
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(50)
    }
}

fn describe_exit(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit status {code}"),
        (None, Some(sig)) => format!("killed by signal {sig}"),
        (None, None) => "terminated abnormally".into(),
    }
}

// ---------------------------------------------------------------------------
// Cluster queue
// ---------------------------------------------------------------------------

/// Submits jobs through user-supplied scheduler commands (`sbatch`,
/// `qsub`, ...) and polls them with a status command.
pub struct ClusterExecutor {
    config: ClusterConfig,
    shell: String,
}

#[derive(Debug)]
pub struct ClusterHandle {
    job_id: String,
}

impl ClusterExecutor {
    pub fn new(config: ClusterConfig, shell: impl Into<String>) -> Self {
        Self {
            config,
            shell: shell.into(),
        }
    }

    fn run_template(&self, template: &str, vars: &[(&str, &str)]) -> Result<String> {
        let command = fill_template(template, vars);
        let output = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to run `{command}`"))?;
        if !output.status.success() {
            bail!(
                "`{command}` failed ({}): {}",
                describe_exit(output.status),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Executor for ClusterExecutor {
    type Handle = ClusterHandle;

    fn name(&self) -> &'static str {
        "cluster"
    }

    fn submit(&self, job: &JobSpec<'_>) -> Result<ClusterHandle> {
        let wrapped = format!(
            "{} -c {}",
            self.shell,
            shell_quote(&strict_script(&self.shell, job.command))
        );
        let cmd = shell_quote(&wrapped);
        let name = shell_quote(job.name);
        let log = shell_quote(&job.log.to_string_lossy());
        let threads = job.threads.to_string();
        let mem_mb = match job.mem_mb.or(self.config.default_mem_mb) {
            Some(mem) => mem.to_string(),
            None if self.config.submit.contains("{mem_mb}") => bail!(
                "{} declares no mem_mb and [cluster] default-mem-mb is not set",
                job.name
            ),
            None => String::new(),
        };
        let stdout = self.run_template(
            &self.config.submit,
            &[
                ("cmd", cmd.as_str()),
                ("name", name.as_str()),
                ("log", log.as_str()),
                ("threads", threads.as_str()),
                ("mem_mb", mem_mb.as_str()),
            ],
        )?;
        let job_id = parse_job_id(&stdout)
            .with_context(|| format!("could not find a job id in submit output {stdout:?}"))?;
        tracing::debug!(job = job.name, job_id = %job_id, "submitted");
        Ok(ClusterHandle { job_id })
    }

    fn poll(&self, handle: &mut ClusterHandle) -> Result<JobStatus> {
        match self.run_template(&self.config.status, &[("jobid", handle.job_id.as_str())]) {
            Ok(stdout) => Ok(classify_status(&stdout)),
            Err(e) => {
                // Status commands fail transiently while the queue catches up.
                tracing::warn!(job_id = %handle.job_id, "status check failed: {e:#}");
                Ok(JobStatus::Running)
            }
        }
    }

    fn cancel(&self, handle: &mut ClusterHandle) -> Result<()> {
        match &self.config.cancel {
            Some(template) => {
                self.run_template(template, &[("jobid", handle.job_id.as_str())])?;
            }
            None => tracing::warn!(
                job_id = %handle.job_id,
                "no cancel command configured; job left running"
            ),
        }
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.poll_interval_secs.max(1))
    }
}

/// `{key}` references in cluster command templates.
static TEMPLATE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").expect("template key regex is valid"));

/// Substitute `vars` into `template` in one pass. Substituted values are
/// never rescanned, so braces inside a job's own command survive intact.
/// Unknown keys are left as written.
fn fill_template(template: &str, vars: &[(&str, &str)]) -> String {
    TEMPLATE_KEY
        .replace_all(template, |caps: &Captures<'_>| {
            let key = &caps[1];
            match vars.iter().find(|(k, _)| *k == key) {
                Some((_, value)) => (*value).to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Extract the job id from submit output.
///
/// Accepts `sbatch --parsable` output (`12345` or `12345;cluster`) as well
/// as prose such as `Submitted batch job 12345`.
pub fn parse_job_id(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).rfind(|l| !l.is_empty())?;
    let head = line.split(';').next()?.trim();
    let id = head.split_whitespace().last()?;
    Some(id.to_string())
}

/// Map status command output to a [`JobStatus`].
///
/// Understands `success` / `running` / `failed` words and common Slurm
/// states. Anything unrecognised counts as still running.
pub fn classify_status(stdout: &str) -> JobStatus {
    const FAILED: &[&str] = &[
        "failed",
        "cancelled",
        "timeout",
        "out_of_memory",
        "node_fail",
        "boot_fail",
        "deadline",
        "preempted",
    ];
    const SUCCEEDED: &[&str] = &["completed", "success"];

    let text = stdout.to_ascii_lowercase();
    if let Some(state) = FAILED.iter().find(|s| text.contains(*s)) {
        return JobStatus::Failed(format!("cluster job {state}"));
    }
    if SUCCEEDED.iter().any(|s| text.contains(s)) {
        return JobStatus::Succeeded;
    }
    JobStatus::Running
}

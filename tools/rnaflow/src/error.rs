//! Error taxonomy for pipeline evaluation and execution.
//!
//! Configuration and discovery errors abort before anything runs. The
//! per-node variants are recorded against a single task and only affect that
//! task's descendants.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while building or running a pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed rules, ambiguous outputs, cycles, bad templates.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Sample discovery found nothing to work on.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// A root input was absent when its consumer became ready.
    #[error("{node}: missing input {}", path.display())]
    MissingInput { node: String, path: PathBuf },

    /// The shell step exited non-zero, or was lost by the backend.
    #[error("{node}: {reason} (log: {})", log.display())]
    Execution {
        node: String,
        reason: String,
        log: PathBuf,
    },

    /// The shell step outlived its wall-clock limit.
    #[error("{node}: exceeded time limit of {limit:?} (log: {})", log.display())]
    Timeout {
        node: String,
        limit: Duration,
        log: PathBuf,
    },

    /// The run was cancelled while this step was in flight.
    #[error("{node}: interrupted (log: {})", log.display())]
    Interrupted { node: String, log: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Log file associated with a failed node, if any.
    pub fn log_path(&self) -> Option<&PathBuf> {
        match self {
            Self::Execution { log, .. } | Self::Timeout { log, .. } | Self::Interrupted { log, .. } => {
                Some(log)
            }
            _ => None,
        }
    }
}

/// Return early with a [`PipelineError::Configuration`] if a condition fails.
///
/// Mirrors `anyhow::ensure!` for the configuration error kind.
macro_rules! ensure_config {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err($crate::error::PipelineError::Configuration(format!($($arg)*)));
        }
    };
}

pub(crate) use ensure_config;

/// Return early with a [`PipelineError::Configuration`].
macro_rules! bail_config {
    ($($arg:tt)*) => {
        return Err($crate::error::PipelineError::Configuration(format!($($arg)*)))
    };
}

pub(crate) use bail_config;

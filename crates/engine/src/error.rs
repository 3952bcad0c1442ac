//! Domain errors. Glue code uses `anyhow`; these are the failures callers
//! branch on.

use std::path::PathBuf;

use runq_core::{QueueId, QueueState, TaskId, TaskStatus};
use thiserror::Error;

/// Failures of [`crate::TaskQueueService`].
#[derive(Debug, Error)]
pub enum QueueError {
    /// The requested state change is not an edge of the state machine, or a
    /// concurrent mutation moved the entry first.
    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        /// Entry id.
        id: QueueId,
        /// State observed at commit time.
        from: QueueState,
        /// Requested state.
        to: QueueState,
    },
    /// No entry with this id.
    #[error("queue entry not found: {0}")]
    NotFound(QueueId),
    /// Persistence failed.
    #[error("queue store: {0:#}")]
    Store(anyhow::Error),
}

impl From<anyhow::Error> for QueueError {
    fn from(e: anyhow::Error) -> Self {
        Self::Store(e)
    }
}

/// Failures of [`crate::ProcessSupervisor`].
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The OS refused to start the process.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that was being started.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// Could not prepare the output files.
    #[error("output files under {path}: {source}")]
    OutputFiles {
        /// Directory or file involved.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// Signal delivery failed for a reason other than the process being gone.
    #[error("signal {signal} to pid {pid}: {source}")]
    Signal {
        /// Target pid.
        pid: u32,
        /// Signal name.
        signal: &'static str,
        /// Errno reported by the kernel.
        #[source]
        source: nix::errno::Errno,
    },
}

/// Failures of [`crate::TaskBridge`].
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No task with this id.
    #[error("task not found: {0}")]
    NotFound(TaskId),
    /// Only finished tasks can be retried.
    #[error("task {id} is {status}; only finished tasks can be retried")]
    NotRetryable {
        /// Task id.
        id: TaskId,
        /// Current status.
        status: TaskStatus,
    },
    /// Request rejected before touching the store.
    #[error("invalid request: {0}")]
    Invalid(String),
    /// The queue refused the operation.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// Persistence failed.
    #[error("task store: {0:#}")]
    Store(anyhow::Error),
}

impl From<anyhow::Error> for BridgeError {
    fn from(e: anyhow::Error) -> Self {
        Self::Store(e)
    }
}

/// Failures loading [`crate::EngineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("read config {path}: {source}")]
    Read {
        /// Config file path.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// The config file is not valid TOML for this schema.
    #[error("parse config {path}: {source}")]
    Parse {
        /// Config file path.
        path: PathBuf,
        /// Parser error.
        #[source]
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

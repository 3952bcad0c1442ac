//! Queue entries, task projections, log lines and their state enums.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{QueueId, TaskId};
use crate::util::EpochMs;

/// Failure to parse a persisted enum value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct ParseError {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The offending raw value.
    pub value: String,
}

macro_rules! str_enum {
    ($name:ident, $label:literal, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $name {
            /// Stable string form, as persisted.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $s,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = ParseError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                match raw {
                    $($s => Ok(Self::$variant),)+
                    other => Err(ParseError { kind: $label, value: other.to_string() }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Scheduling state of a queue entry.
///
/// The string forms are a durable contract read back by restart recovery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// Waiting for a concurrency slot.
    Pending,
    /// Dequeued and handed to a handler.
    Running,
    /// Finished successfully. Terminal.
    Completed,
    /// Finished unsuccessfully. Terminal.
    Failed,
}

str_enum!(QueueState, "queue state", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

impl QueueState {
    /// Completed and failed entries never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// All states, in lifecycle order.
    pub const ALL: [QueueState; 4] = [
        QueueState::Pending,
        QueueState::Running,
        QueueState::Completed,
        QueueState::Failed,
    ];
}

/// The queue state machine: `pending -> running -> {completed, failed}`.
///
/// Anything leaving a terminal state, skipping `running`, or staying in place
/// is rejected.
pub fn is_valid_transition(from: QueueState, to: QueueState) -> bool {
    matches!(
        (from, to),
        (QueueState::Pending, QueueState::Running)
            | (QueueState::Running, QueueState::Completed)
            | (QueueState::Running, QueueState::Failed)
    )
}

/// Why an entry ended up `failed`. Persisted next to the error text so
/// operators can tell "the agent failed" from "we lost track of the agent".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The handler returned an error or the process exited non-zero.
    HandlerFailed,
    /// No handler registered for the entry's task type.
    HandlerNotFound,
    /// The OS refused to start the process.
    ProcessSpawnFailure,
    /// Forcibly terminated after exceeding the task timeout.
    Timeout,
    /// Running at boot but the process could not be reattached.
    ProcessLost,
    /// Still running when the shutdown grace period ran out.
    ShutdownAbort,
}

str_enum!(FailureKind, "failure kind", {
    HandlerFailed => "handler_failed",
    HandlerNotFound => "handler_not_found",
    ProcessSpawnFailure => "process_spawn_failure",
    Timeout => "timeout",
    ProcessLost => "process_lost",
    ShutdownAbort => "shutdown_abort",
});

/// What we know about a process at spawn time, compared again at reattach.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProcessFingerprint {
    /// Process start time as reported by the OS, epoch seconds.
    pub start_time_secs: Option<u64>,
    /// Command line the process was spawned with.
    pub command: String,
}

/// Durable scheduling unit tracked by the state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedTask {
    /// Entry id, a ULID.
    pub id: QueueId,
    /// Selects the handler.
    pub task_type: String,
    /// Opaque handler parameters.
    pub payload: serde_json::Value,
    /// Current state machine position.
    pub state: QueueState,
    /// Lower is more urgent.
    pub priority: i32,
    /// When the entry was accepted.
    pub enqueued_at: EpochMs,
    /// Set when the entry is claimed.
    pub started_at: Option<EpochMs>,
    /// Set on reaching a terminal state.
    pub completed_at: Option<EpochMs>,
    /// Failure message.
    pub error: Option<String>,
    /// Failure classification.
    pub failure_kind: Option<FailureKind>,
    /// Previous runs of the same task.
    pub retry_count: u32,
    /// Correlated user-facing task, if any.
    pub external_task_id: Option<String>,
    /// Pid of the process the handler spawned.
    pub pid: Option<u32>,
    /// Identity of `pid`, checked before reattaching.
    pub fingerprint: Option<ProcessFingerprint>,
}

impl QueuedTask {
    /// A fresh pending entry.
    pub fn pending(
        id: QueueId,
        task_type: impl Into<String>,
        payload: serde_json::Value,
        priority: i32,
        enqueued_at: EpochMs,
    ) -> Self {
        Self {
            id,
            task_type: task_type.into(),
            payload,
            state: QueueState::Pending,
            priority,
            enqueued_at,
            started_at: None,
            completed_at: None,
            error: None,
            failure_kind: None,
            retry_count: 0,
            external_task_id: None,
            pid: None,
            fingerprint: None,
        }
    }
}

/// Fields written alongside a state transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionPatch {
    /// Claim time.
    pub started_at: Option<EpochMs>,
    /// Settle time.
    pub completed_at: Option<EpochMs>,
    /// Failure message.
    pub error: Option<String>,
    /// Failure classification.
    pub failure_kind: Option<FailureKind>,
}

/// Status of the user-facing task projection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a dispatcher slot.
    Queued,
    /// Handler running.
    Running,
    /// Last run succeeded.
    Completed,
    /// Last run failed.
    Failed,
}

str_enum!(TaskStatus, "task status", {
    Queued => "queued",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

impl TaskStatus {
    /// Whether the current run is over.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// User-visible task record. Outlives the queue entries that execute it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Task id, a UUID.
    pub id: TaskId,
    /// Display title.
    pub title: String,
    /// Status of the current run.
    pub status: TaskStatus,
    /// Priority used for the next enqueue.
    pub priority: i32,
    /// Handler key.
    pub task_type: String,
    /// Creation time.
    pub created_at: EpochMs,
    /// Last projection change.
    pub updated_at: EpochMs,
    /// Start of the current run.
    pub started_at: Option<EpochMs>,
    /// End of the current run.
    pub completed_at: Option<EpochMs>,
    /// Why the current run failed.
    pub error_message: Option<String>,
    /// Failure classification of the current run.
    pub failure_kind: Option<FailureKind>,
    /// Handler summary of the current run.
    pub execution_summary: Option<String>,
    /// Exit code of the current run.
    pub exit_code: Option<i32>,
    /// Duration of the current run.
    pub duration_ms: Option<i64>,
    /// Current queue entry executing this task.
    pub queue_id: Option<QueueId>,
}

/// Which stream a log line came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

str_enum!(LogSource, "log source", {
    Stdout => "stdout",
    Stderr => "stderr",
});

/// A persisted output line. `id` is assigned by the store and strictly
/// increases, so "everything after id N" is a gap-free resume point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskLog {
    /// Store-assigned, strictly increasing.
    pub id: i64,
    /// Owning queue entry id. Not enforced as a foreign key.
    pub task_id: String,
    /// Capture time.
    pub timestamp: EpochMs,
    /// Stream the line came from.
    pub source: LogSource,
    /// Line text without the newline.
    pub line: String,
}

/// A line not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLogLine {
    /// Capture time.
    pub timestamp: EpochMs,
    /// Line text without the newline.
    pub line: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_transition() {
        for from in QueueState::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in QueueState::ALL {
                assert!(!is_valid_transition(from, to), "{from} -> {to} must be invalid");
            }
        }
    }

    #[test]
    fn pending_cannot_skip_running() {
        assert!(!is_valid_transition(QueueState::Pending, QueueState::Completed));
        assert!(!is_valid_transition(QueueState::Pending, QueueState::Failed));
        assert!(!is_valid_transition(QueueState::Running, QueueState::Pending));
        assert!(!is_valid_transition(QueueState::Running, QueueState::Running));
    }

    #[test]
    fn forward_path_is_valid() {
        assert!(is_valid_transition(QueueState::Pending, QueueState::Running));
        assert!(is_valid_transition(QueueState::Running, QueueState::Completed));
        assert!(is_valid_transition(QueueState::Running, QueueState::Failed));
    }

    #[test]
    fn unknown_state_string_is_rejected() {
        let err = "paused".parse::<QueueState>().unwrap_err();
        assert_eq!(err.kind, "queue state");
        assert_eq!("running".parse::<QueueState>().unwrap(), QueueState::Running);
    }
}

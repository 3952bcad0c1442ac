//! Bus event envelope and the typed lifecycle payload.

use serde::{Deserialize, Serialize};

use crate::ids::QueueId;
use crate::model::{FailureKind, QueuedTask};
use crate::util::{now_ms, EpochMs};

/// A message on the in-process event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Dotted type, e.g. `task.started` or `loops.merge.failed`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Type-specific body.
    pub payload: serde_json::Value,
    /// Publish time.
    pub timestamp: EpochMs,
}

impl Event {
    /// Build an event stamped with the current time.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp: now_ms(),
        }
    }

    /// Wrap a lifecycle event. Its type is derived from the phase.
    pub fn lifecycle(event: &LifecycleEvent) -> Self {
        Self {
            event_type: event.phase.event_type().to_string(),
            payload: serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
            timestamp: event.at,
        }
    }

    /// Decode the payload as a lifecycle event, if it is one.
    pub fn as_lifecycle(&self) -> Option<LifecycleEvent> {
        if !self.event_type.starts_with(LIFECYCLE_PREFIX) {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// Prefix shared by every lifecycle event type.
pub const LIFECYCLE_PREFIX: &str = "task.";

/// One state transition of a queue entry, as seen by subscribers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    /// Entry accepted into the queue.
    Queued,
    /// Entry claimed and handed to its handler.
    Started,
    /// Handler finished successfully.
    Completed,
    /// Run failed for any reason other than the timeout.
    Failed,
    /// Run exceeded its time budget.
    Timeout,
}

impl LifecyclePhase {
    /// Event type string published on the bus.
    pub fn event_type(self) -> &'static str {
        match self {
            Self::Queued => "task.queued",
            Self::Started => "task.started",
            Self::Completed => "task.completed",
            Self::Failed => "task.failed",
            Self::Timeout => "task.timeout",
        }
    }
}

/// Payload of every `task.*` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecycleEvent {
    /// Entry the event is about.
    pub queue_id: QueueId,
    /// Handler key of the entry.
    pub task_type: String,
    /// Correlated user-facing task id.
    pub external_task_id: Option<String>,
    /// Transition being reported.
    pub phase: LifecyclePhase,
    /// When it happened.
    pub at: EpochMs,
    /// Failure message, for failed and timeout phases.
    #[serde(default)]
    pub error: Option<String>,
    /// Failure classification.
    #[serde(default)]
    pub failure_kind: Option<FailureKind>,
    /// Exit code reported by the handler.
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Run duration.
    #[serde(default)]
    pub duration_ms: Option<i64>,
    /// Handler summary.
    #[serde(default)]
    pub summary: Option<String>,
}

impl LifecycleEvent {
    /// Event for `entry` entering `phase`, with no outcome fields set.
    pub fn for_entry(entry: &QueuedTask, phase: LifecyclePhase) -> Self {
        Self {
            queue_id: entry.id.clone(),
            task_type: entry.task_type.clone(),
            external_task_id: entry.external_task_id.clone(),
            phase,
            at: now_ms(),
            error: None,
            failure_kind: None,
            exit_code: None,
            duration_ms: None,
            summary: None,
        }
    }

    /// Attach a failure.
    pub fn with_failure(mut self, kind: FailureKind, error: impl Into<String>) -> Self {
        self.failure_kind = Some(kind);
        self.error = Some(error.into());
        self
    }
}

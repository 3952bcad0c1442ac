//! Durable priority queue with the `pending -> running -> terminal` state
//! machine.

use std::sync::{Arc, Mutex};

use runq_core::{
    is_valid_transition, lock_unpoisoned, now_ms, Event, FailureKind, LifecycleEvent,
    LifecyclePhase, ProcessFingerprint, QueueId, QueueState, QueuedTask, TransitionPatch,
};
use runq_storage::Store;
use serde::Serialize;

use crate::bus::{EventBus, PublishOptions};
use crate::error::QueueError;

/// Optional fields for [`TaskQueueService::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Use this id instead of generating one.
    pub id: Option<QueueId>,
    /// User-facing task this entry executes.
    pub external_task_id: Option<String>,
    /// Attempt number, zero for the first run.
    pub retry_count: u32,
}

/// Result of [`TaskQueueService::hydrate`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct HydrateReport {
    /// All persisted entries.
    pub total: usize,
    /// Entries waiting for a slot.
    pub pending: usize,
    /// Entries finished successfully.
    pub completed: usize,
    /// Entries finished unsuccessfully.
    pub failed: usize,
    /// Entries that were running when the previous process stopped. They
    /// need reconciliation, not a verdict.
    pub running: Vec<QueuedTask>,
}

/// All queue state mutation goes through here.
pub struct TaskQueueService {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    // Shared by enqueue and dequeue: `task.queued` is published before the
    // entry becomes claimable.
    commit_lock: Mutex<()>,
}

impl TaskQueueService {
    /// Service over `store`, publishing lifecycle events on `bus`.
    pub fn new(store: Arc<dyn Store>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus,
            commit_lock: Mutex::new(()),
        }
    }

    /// Persist a pending entry and announce it.
    pub fn enqueue(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        priority: i32,
        options: EnqueueOptions,
    ) -> Result<QueueId, QueueError> {
        let _commit = lock_unpoisoned(&self.commit_lock);
        let id = options.id.unwrap_or_default();
        let mut entry = QueuedTask::pending(id.clone(), task_type, payload, priority, now_ms());
        entry.external_task_id = options.external_task_id;
        entry.retry_count = options.retry_count;
        self.store.insert_queued(&entry)?;
        tracing::debug!(queue_id = %id, task_type, priority, "enqueued");
        self.publish(LifecycleEvent::for_entry(&entry, LifecyclePhase::Queued));
        Ok(id)
    }

    /// Claim the most urgent pending entry, marking it `running`.
    pub fn dequeue(&self) -> Result<Option<QueuedTask>, QueueError> {
        let _commit = lock_unpoisoned(&self.commit_lock);
        Ok(self.store.claim_next_pending(now_ms())?)
    }

    /// `running -> completed`.
    pub fn mark_completed(&self, id: &QueueId) -> Result<QueuedTask, QueueError> {
        let patch = TransitionPatch {
            completed_at: Some(now_ms()),
            ..Default::default()
        };
        self.transition(id, QueueState::Completed, &patch)
    }

    /// `running -> failed`, recording why.
    pub fn mark_failed(
        &self,
        id: &QueueId,
        kind: FailureKind,
        error: impl Into<String>,
    ) -> Result<QueuedTask, QueueError> {
        let patch = TransitionPatch {
            completed_at: Some(now_ms()),
            error: Some(error.into()),
            failure_kind: Some(kind),
            ..Default::default()
        };
        self.transition(id, QueueState::Failed, &patch)
    }

    /// Validate against the state machine, then compare-and-set on the
    /// observed state. The stored entry is untouched on error.
    pub fn transition(
        &self,
        id: &QueueId,
        to: QueueState,
        patch: &TransitionPatch,
    ) -> Result<QueuedTask, QueueError> {
        let current = self
            .store
            .get_queued(id)?
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        if !is_valid_transition(current.state, to) {
            return Err(QueueError::InvalidTransition {
                id: id.clone(),
                from: current.state,
                to,
            });
        }
        if !self.store.transition(id, current.state, to, patch)? {
            let now = self
                .store
                .get_queued(id)?
                .map(|e| e.state)
                .unwrap_or(current.state);
            return Err(QueueError::InvalidTransition {
                id: id.clone(),
                from: now,
                to,
            });
        }
        self.store
            .get_queued(id)?
            .ok_or_else(|| QueueError::NotFound(id.clone()))
    }

    /// Remember which process a running entry spawned.
    pub fn record_process(
        &self,
        id: &QueueId,
        pid: u32,
        fingerprint: &ProcessFingerprint,
    ) -> Result<(), QueueError> {
        if self.store.record_process(id, pid, fingerprint)? {
            return Ok(());
        }
        match self.store.get_queued(id)? {
            None => Err(QueueError::NotFound(id.clone())),
            Some(entry) => Err(QueueError::InvalidTransition {
                id: id.clone(),
                from: entry.state,
                to: QueueState::Running,
            }),
        }
    }

    /// Entry by id.
    pub fn get(&self, id: &QueueId) -> Result<Option<QueuedTask>, QueueError> {
        Ok(self.store.get_queued(id)?)
    }

    /// All entries in dispatch order.
    pub fn list(&self) -> Result<Vec<QueuedTask>, QueueError> {
        Ok(self.store.list_queued()?)
    }

    /// Reload persisted entries after a restart.
    pub fn hydrate(&self) -> Result<HydrateReport, QueueError> {
        let entries = self.store.list_queued()?;
        let mut report = HydrateReport {
            total: entries.len(),
            ..Default::default()
        };
        for entry in entries {
            match entry.state {
                QueueState::Pending => report.pending += 1,
                QueueState::Completed => report.completed += 1,
                QueueState::Failed => report.failed += 1,
                QueueState::Running => report.running.push(entry),
            }
        }
        tracing::info!(
            total = report.total,
            pending = report.pending,
            running = report.running.len(),
            "queue hydrated"
        );
        Ok(report)
    }

    /// Publish a lifecycle event on the shared bus.
    pub fn publish(&self, event: LifecycleEvent) {
        let report = self.bus.publish(Event::lifecycle(&event), PublishOptions::default());
        if report.failed > 0 {
            tracing::debug!(queue_id = %event.queue_id, failed = report.failed, "lifecycle subscribers failed");
        }
    }
}

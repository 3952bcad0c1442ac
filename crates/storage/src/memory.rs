use std::collections::HashMap;
use std::sync::Mutex;

use runq_core::{
    lock_unpoisoned, EpochMs, LogSource, NewLogLine, ProcessFingerprint, QueueId, QueueState,
    QueuedTask, Task, TaskId, TaskLog, TransitionPatch,
};

use crate::traits::Store;

/// In-memory store for tests. Not durable.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    // insertion order doubles as the tie-breaking sequence
    queued: Vec<QueuedTask>,
    tasks: Vec<Task>,
    logs: Vec<TaskLog>,
    next_log_id: i64,
    offsets: HashMap<(String, LogSource), u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_patch(entry: &mut QueuedTask, patch: &TransitionPatch) {
    if let Some(at) = patch.started_at {
        entry.started_at = Some(at);
    }
    if let Some(at) = patch.completed_at {
        entry.completed_at = Some(at);
    }
    if let Some(error) = &patch.error {
        entry.error = Some(error.clone());
    }
    if let Some(kind) = patch.failure_kind {
        entry.failure_kind = Some(kind);
    }
}

impl Store for MemoryStore {
    fn insert_queued(&self, entry: &QueuedTask) -> anyhow::Result<()> {
        let mut inner = lock_unpoisoned(&self.inner);
        if inner.queued.iter().any(|e| e.id == entry.id) {
            anyhow::bail!("queue entry {} already exists", entry.id);
        }
        inner.queued.push(entry.clone());
        Ok(())
    }

    fn get_queued(&self, id: &QueueId) -> anyhow::Result<Option<QueuedTask>> {
        let inner = lock_unpoisoned(&self.inner);
        Ok(inner.queued.iter().find(|e| &e.id == id).cloned())
    }

    fn list_queued(&self) -> anyhow::Result<Vec<QueuedTask>> {
        Ok(lock_unpoisoned(&self.inner).queued.clone())
    }

    fn claim_next_pending(&self, started_at: EpochMs) -> anyhow::Result<Option<QueuedTask>> {
        let mut inner = lock_unpoisoned(&self.inner);
        let next = inner
            .queued
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state == QueueState::Pending)
            .min_by_key(|(seq, e)| (e.priority, e.enqueued_at, *seq))
            .map(|(seq, _)| seq);
        let Some(seq) = next else {
            return Ok(None);
        };
        let entry = &mut inner.queued[seq];
        entry.state = QueueState::Running;
        entry.started_at = Some(started_at);
        Ok(Some(entry.clone()))
    }

    fn transition(
        &self,
        id: &QueueId,
        from: QueueState,
        to: QueueState,
        patch: &TransitionPatch,
    ) -> anyhow::Result<bool> {
        let mut inner = lock_unpoisoned(&self.inner);
        match inner.queued.iter_mut().find(|e| &e.id == id) {
            Some(entry) if entry.state == from => {
                entry.state = to;
                apply_patch(entry, patch);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn record_process(
        &self,
        id: &QueueId,
        pid: u32,
        fingerprint: &ProcessFingerprint,
    ) -> anyhow::Result<bool> {
        let mut inner = lock_unpoisoned(&self.inner);
        match inner.queued.iter_mut().find(|e| &e.id == id) {
            Some(entry) if entry.state == QueueState::Running => {
                entry.pid = Some(pid);
                entry.fingerprint = Some(fingerprint.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn insert_task(&self, task: &Task) -> anyhow::Result<()> {
        let mut inner = lock_unpoisoned(&self.inner);
        if inner.tasks.iter().any(|t| t.id == task.id) {
            anyhow::bail!("task {} already exists", task.id);
        }
        inner.tasks.push(task.clone());
        Ok(())
    }

    fn get_task(&self, id: &TaskId) -> anyhow::Result<Option<Task>> {
        let inner = lock_unpoisoned(&self.inner);
        Ok(inner.tasks.iter().find(|t| &t.id == id).cloned())
    }

    fn list_tasks(&self) -> anyhow::Result<Vec<Task>> {
        Ok(lock_unpoisoned(&self.inner).tasks.clone())
    }

    fn update_task(&self, task: &Task) -> anyhow::Result<bool> {
        let mut inner = lock_unpoisoned(&self.inner);
        match inner.tasks.iter_mut().find(|t| t.id == task.id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn append_logs(
        &self,
        task_id: &str,
        source: LogSource,
        lines: &[NewLogLine],
        offset: u64,
    ) -> anyhow::Result<Vec<TaskLog>> {
        let mut inner = lock_unpoisoned(&self.inner);
        let mut stored = Vec::with_capacity(lines.len());
        for line in lines {
            inner.next_log_id += 1;
            let row = TaskLog {
                id: inner.next_log_id,
                task_id: task_id.to_string(),
                timestamp: line.timestamp,
                source,
                line: line.line.clone(),
            };
            inner.logs.push(row.clone());
            stored.push(row);
        }
        inner.offsets.insert((task_id.to_string(), source), offset);
        Ok(stored)
    }

    fn logs_after(&self, task_id: &str, after: i64, limit: usize) -> anyhow::Result<Vec<TaskLog>> {
        let inner = lock_unpoisoned(&self.inner);
        Ok(inner
            .logs
            .iter()
            .filter(|l| l.task_id == task_id && l.id > after)
            .take(limit)
            .cloned()
            .collect())
    }

    fn stream_offset(&self, task_id: &str, source: LogSource) -> anyhow::Result<u64> {
        let inner = lock_unpoisoned(&self.inner);
        Ok(inner
            .offsets
            .get(&(task_id.to_string(), source))
            .copied()
            .unwrap_or(0))
    }
}

use runq_core::{
    EpochMs, LogSource, NewLogLine, ProcessFingerprint, QueueId, QueueState, QueuedTask, Task,
    TaskId, TaskLog, TransitionPatch,
};

/// Durable record of queue entries, task projections, log lines and stream
/// offsets.
///
/// Implementations must make `claim_next_pending` and `transition` atomic:
/// callers rely on them as the only compare-and-set primitives.
pub trait Store: Send + Sync {
    fn insert_queued(&self, entry: &QueuedTask) -> anyhow::Result<()>;
    fn get_queued(&self, id: &QueueId) -> anyhow::Result<Option<QueuedTask>>;
    /// Every entry, in insertion order.
    fn list_queued(&self) -> anyhow::Result<Vec<QueuedTask>>;

    /// Mark the most urgent pending entry `running` and return it.
    ///
    /// Order: lowest priority number, then earliest `enqueued_at`, then
    /// insertion order.
    fn claim_next_pending(&self, started_at: EpochMs) -> anyhow::Result<Option<QueuedTask>>;

    /// Move `id` from `from` to `to` if it is still in `from`. Patch fields
    /// that are `Some` overwrite the stored ones. Returns whether a row changed.
    fn transition(
        &self,
        id: &QueueId,
        from: QueueState,
        to: QueueState,
        patch: &TransitionPatch,
    ) -> anyhow::Result<bool>;

    /// Attach a spawned process to a running entry. Returns false if the
    /// entry is not running.
    fn record_process(
        &self,
        id: &QueueId,
        pid: u32,
        fingerprint: &ProcessFingerprint,
    ) -> anyhow::Result<bool>;

    fn insert_task(&self, task: &Task) -> anyhow::Result<()>;
    fn get_task(&self, id: &TaskId) -> anyhow::Result<Option<Task>>;
    /// Every task, oldest first.
    fn list_tasks(&self) -> anyhow::Result<Vec<Task>>;
    /// Replace the stored projection. Returns false if the task is unknown.
    fn update_task(&self, task: &Task) -> anyhow::Result<bool>;

    /// Persist `lines` and advance the stream offset for `(task_id, source)`
    /// to `offset` in one commit. Returns the stored rows with their ids.
    fn append_logs(
        &self,
        task_id: &str,
        source: LogSource,
        lines: &[NewLogLine],
        offset: u64,
    ) -> anyhow::Result<Vec<TaskLog>>;

    /// Lines for `task_id` with id strictly greater than `after`, ascending.
    fn logs_after(&self, task_id: &str, after: i64, limit: usize) -> anyhow::Result<Vec<TaskLog>>;

    /// Byte offset up to which output has been persisted. Zero if unknown.
    fn stream_offset(&self, task_id: &str, source: LogSource) -> anyhow::Result<u64>;
}

//! Glue between the user-facing task projection and the queue, including
//! restart recovery.

use std::sync::{Arc, Mutex};

use runq_core::{
    lock_unpoisoned, now_ms, Event, FailureKind, LifecycleEvent, LifecyclePhase, QueueId,
    QueuedTask, Task, TaskId, TaskLog, TaskStatus,
};
use runq_storage::Store;
use serde::{Deserialize, Serialize};

use crate::bus::{EventBus, SubscribeOptions, Subscription};
use crate::dispatcher::Dispatcher;
use crate::error::BridgeError;
use crate::output::OutputStreamer;
use crate::queue::{EnqueueOptions, TaskQueueService};
use crate::supervisor::{ProcessSupervisor, Reconciliation};

/// Input of [`TaskBridge::create_task`].
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    /// Display title. Must not be blank.
    pub title: String,
    /// Selects the handler.
    pub task_type: String,
    /// Handed to the handler unchanged.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Lower runs first.
    #[serde(default)]
    pub priority: i32,
}

/// Input of [`TaskBridge::update_task`]. Absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTaskRequest {
    /// New title.
    pub title: Option<String>,
    /// New projection priority.
    pub priority: Option<i32>,
}

/// Result of [`TaskBridge::reconnect_running_tasks`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconnectReport {
    /// Processes reattached and adopted by the dispatcher.
    pub reconnected: usize,
    /// Entries settled as failed.
    pub failed: usize,
    /// Ids of the failed entries.
    pub lost: Vec<QueueId>,
}

/// Owns the user-facing [`Task`] records and keeps them in step with their
/// queue entries.
pub struct TaskBridge {
    store: Arc<dyn Store>,
    queue: Arc<TaskQueueService>,
    bus: Arc<EventBus>,
    supervisor: Arc<ProcessSupervisor>,
    streamer: Arc<OutputStreamer>,
    dispatcher: Arc<Dispatcher>,
    // serializes read-modify-write of projections
    projection: Mutex<()>,
    subscription: Mutex<Option<Subscription>>,
}

impl TaskBridge {
    /// Bridge over the given components. Call [`TaskBridge::attach`] to follow events.
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<TaskQueueService>,
        bus: Arc<EventBus>,
        supervisor: Arc<ProcessSupervisor>,
        streamer: Arc<OutputStreamer>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            store,
            queue,
            bus,
            supervisor,
            streamer,
            dispatcher,
            projection: Mutex::new(()),
            subscription: Mutex::new(None),
        }
    }

    /// Apply `task.*` lifecycle events to the projection.
    pub fn attach(self: &Arc<Self>) {
        let mut slot = lock_unpoisoned(&self.subscription);
        if slot.is_some() {
            return;
        }
        let bridge = Arc::downgrade(self);
        *slot = Some(self.bus.subscribe("task.*", SubscribeOptions::default(), move |event| {
            match bridge.upgrade() {
                Some(bridge) => bridge.apply_event(event),
                None => Ok(()),
            }
        }));
    }

    /// Stop following lifecycle events.
    pub fn detach(&self) {
        if let Some(sub) = lock_unpoisoned(&self.subscription).take() {
            sub.unsubscribe();
        }
    }

    fn apply_event(&self, event: &Event) -> anyhow::Result<()> {
        let Some(lifecycle) = event.as_lifecycle() else {
            return Ok(());
        };
        let Some(task_id) = lifecycle.external_task_id.as_deref() else {
            return Ok(());
        };
        let _guard = lock_unpoisoned(&self.projection);
        let Some(mut task) = self.store.get_task(&TaskId::from_string(task_id))? else {
            tracing::debug!(task_id, queue_id = %lifecycle.queue_id, "event for unknown task");
            return Ok(());
        };
        if task.queue_id.as_ref() != Some(&lifecycle.queue_id) {
            tracing::debug!(task_id, queue_id = %lifecycle.queue_id, "event from superseded queue entry");
            return Ok(());
        }
        if !apply_lifecycle(&mut task, &lifecycle) {
            return Ok(());
        }
        self.store.update_task(&task)?;
        Ok(())
    }

    /// Record a task and queue its first run.
    pub fn create_task(&self, req: CreateTaskRequest) -> Result<Task, BridgeError> {
        if req.title.trim().is_empty() {
            return Err(BridgeError::Invalid("title must not be empty".into()));
        }
        if req.task_type.trim().is_empty() {
            return Err(BridgeError::Invalid("task_type must not be empty".into()));
        }
        let now = now_ms();
        let queue_id = QueueId::new();
        let mut task = Task {
            id: TaskId::new(),
            title: req.title,
            status: TaskStatus::Queued,
            priority: req.priority,
            task_type: req.task_type,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            failure_kind: None,
            execution_summary: None,
            exit_code: None,
            duration_ms: None,
            queue_id: Some(queue_id.clone()),
        };
        self.store.insert_task(&task)?;

        let options = EnqueueOptions {
            id: Some(queue_id),
            external_task_id: Some(task.id.to_string()),
            retry_count: 0,
        };
        if let Err(e) = self
            .queue
            .enqueue(&task.task_type, req.payload, task.priority, options)
        {
            task.status = TaskStatus::Failed;
            task.error_message = Some(format!("enqueue failed: {e}"));
            task.queue_id = None;
            task.updated_at = now_ms();
            self.store.update_task(&task)?;
            return Err(e.into());
        }
        tracing::info!(task_id = %task.id, task_type = %task.task_type, "task created");
        self.get_task(&task.id)
    }

    /// Change title and/or priority of the projection. A queued entry keeps
    /// its original priority.
    pub fn update_task(&self, id: &TaskId, req: UpdateTaskRequest) -> Result<Task, BridgeError> {
        if req.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(BridgeError::Invalid("title must not be empty".into()));
        }
        let _guard = lock_unpoisoned(&self.projection);
        let mut task = self
            .store
            .get_task(id)?
            .ok_or_else(|| BridgeError::NotFound(id.clone()))?;
        if let Some(title) = req.title {
            task.title = title;
        }
        if let Some(priority) = req.priority {
            task.priority = priority;
        }
        task.updated_at = now_ms();
        self.store.update_task(&task)?;
        Ok(task)
    }

    /// Queue another run of a finished task with the same payload.
    pub fn retry_task(&self, id: &TaskId) -> Result<Task, BridgeError> {
        let guard = lock_unpoisoned(&self.projection);
        let mut task = self
            .store
            .get_task(id)?
            .ok_or_else(|| BridgeError::NotFound(id.clone()))?;
        if !task.status.is_terminal() {
            return Err(BridgeError::NotRetryable {
                id: id.clone(),
                status: task.status,
            });
        }
        let previous = match &task.queue_id {
            Some(queue_id) => self.queue.get(queue_id)?,
            None => None,
        };
        let Some(previous) = previous else {
            return Err(BridgeError::Invalid(format!("task {id} has no queue entry to retry")));
        };

        let queue_id = QueueId::new();
        task.status = TaskStatus::Queued;
        task.queue_id = Some(queue_id.clone());
        task.started_at = None;
        task.completed_at = None;
        task.error_message = None;
        task.failure_kind = None;
        task.execution_summary = None;
        task.exit_code = None;
        task.duration_ms = None;
        task.updated_at = now_ms();
        self.store.update_task(&task)?;
        drop(guard);

        let options = EnqueueOptions {
            id: Some(queue_id),
            external_task_id: Some(task.id.to_string()),
            retry_count: previous.retry_count + 1,
        };
        self.queue
            .enqueue(&previous.task_type, previous.payload, task.priority, options)?;
        tracing::info!(task_id = %task.id, retry = previous.retry_count + 1, "task retried");
        self.get_task(&task.id)
    }

    /// Current projection of `id`.
    pub fn get_task(&self, id: &TaskId) -> Result<Task, BridgeError> {
        self.store
            .get_task(id)?
            .ok_or_else(|| BridgeError::NotFound(id.clone()))
    }

    /// Every task, newest first.
    pub fn list_tasks(&self) -> Result<Vec<Task>, BridgeError> {
        Ok(self.store.list_tasks()?)
    }

    /// Output of the task's current run after watermark `after`.
    pub fn task_logs(&self, id: &TaskId, after: i64, limit: usize) -> Result<Vec<TaskLog>, BridgeError> {
        let task = self.get_task(id)?;
        match task.queue_id {
            Some(queue_id) => Ok(self.streamer.read(queue_id.as_str(), after, limit)?),
            None => Ok(Vec::new()),
        }
    }

    /// Reconcile entries left `running` by the previous process: reattach
    /// and hand them to the dispatcher, or fail them as lost.
    pub async fn reconnect_running_tasks(&self, running: Vec<QueuedTask>) -> ReconnectReport {
        let mut report = ReconnectReport::default();
        for entry in running {
            let verdict = match entry.pid {
                Some(pid) => {
                    self.supervisor
                        .reconcile(&entry.id, pid, entry.fingerprint.as_ref())
                        .await
                }
                None => Reconciliation::Lost("no process was recorded before restart".into()),
            };
            match verdict {
                Reconciliation::Reattached(handle) => {
                    self.streamer.attach(&handle);
                    self.dispatcher.adopt(entry, handle);
                    report.reconnected += 1;
                }
                Reconciliation::Lost(reason) => {
                    tracing::warn!(queue_id = %entry.id, %reason, "running entry lost");
                    // keep whatever output it left behind
                    if entry.pid.is_some() {
                        self.streamer
                            .attach(&self.supervisor.finished_handle(&entry.id, entry.pid));
                    }
                    match self.queue.mark_failed(&entry.id, FailureKind::ProcessLost, reason.clone()) {
                        Ok(_) => {
                            self.queue.publish(
                                LifecycleEvent::for_entry(&entry, LifecyclePhase::Failed)
                                    .with_failure(FailureKind::ProcessLost, reason),
                            );
                        }
                        Err(e) => {
                            tracing::warn!(queue_id = %entry.id, error = %e, "could not fail lost entry");
                        }
                    }
                    report.failed += 1;
                    report.lost.push(entry.id);
                }
            }
        }
        tracing::info!(
            reconnected = report.reconnected,
            failed = report.failed,
            "running entries reconciled"
        );
        report
    }
}

/// Fold one lifecycle event into the projection. Returns false when the
/// event does not change anything.
fn apply_lifecycle(task: &mut Task, event: &LifecycleEvent) -> bool {
    match event.phase {
        LifecyclePhase::Queued | LifecyclePhase::Started if task.status.is_terminal() => return false,
        LifecyclePhase::Queued => {
            task.status = TaskStatus::Queued;
        }
        LifecyclePhase::Started => {
            task.status = TaskStatus::Running;
            task.started_at = Some(event.at);
        }
        LifecyclePhase::Completed => {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(event.at);
            task.exit_code = event.exit_code;
            task.duration_ms = event.duration_ms;
            task.execution_summary = event.summary.clone();
            task.error_message = None;
            task.failure_kind = None;
        }
        LifecyclePhase::Failed | LifecyclePhase::Timeout => {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(event.at);
            task.exit_code = event.exit_code;
            task.duration_ms = event.duration_ms;
            task.execution_summary = event.summary.clone();
            task.error_message = event.error.clone();
            task.failure_kind = event.failure_kind;
        }
    }
    task.updated_at = now_ms();
    true
}

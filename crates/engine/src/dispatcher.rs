//! Poll-and-dispatch loop under a concurrency ceiling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use runq_core::{
    lock_unpoisoned, now_ms, FailureKind, LifecycleEvent, LifecyclePhase, QueueId, QueuedTask,
};
use serde::Serialize;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};

use crate::error::{QueueError, SupervisorError};
use crate::handler::{HandlerContext, HandlerOutcome, TaskHandler};
use crate::output::OutputStreamer;
use crate::queue::TaskQueueService;
use crate::supervisor::{ProcessHandle, ProcessSupervisor};

/// Scheduling knobs.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Handlers allowed to run at once.
    pub max_concurrent: usize,
    /// Delay between dequeue attempts.
    pub poll_interval: Duration,
    /// Budget of a single run.
    pub task_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            poll_interval: Duration::from_millis(100),
            task_timeout: Duration::from_secs(4 * 60 * 60),
        }
    }
}

/// Result of [`Dispatcher::stop`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// In flight at stop time and finished within the grace period.
    pub finished_naturally: usize,
    /// Still running when the grace period ran out.
    pub aborted: usize,
}

/// Resolves once the flag is set. Never resolves if the sender is gone.
pub(crate) async fn raised(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

enum Verdict {
    Finished(Result<anyhow::Result<HandlerOutcome>, JoinError>),
    TimedOut,
    Aborted,
}

/// Dequeues pending entries while permits are available and supervises each
/// run: timeout, outcome classification, lifecycle events.
pub struct Dispatcher {
    queue: Arc<TaskQueueService>,
    supervisor: Arc<ProcessSupervisor>,
    streamer: Arc<OutputStreamer>,
    config: DispatcherConfig,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashMap<QueueId, tokio::time::Instant>>,
    drained: Notify,
    stopping: watch::Sender<bool>,
    abort: watch::Sender<bool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Stopped dispatcher with no handlers.
    pub fn new(
        queue: Arc<TaskQueueService>,
        supervisor: Arc<ProcessSupervisor>,
        streamer: Arc<OutputStreamer>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            queue,
            supervisor,
            streamer,
            config,
            handlers: RwLock::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            in_flight: Mutex::new(HashMap::new()),
            drained: Notify::new(),
            stopping: watch::Sender::new(false),
            abort: watch::Sender::new(false),
            poller: Mutex::new(None),
        }
    }

    /// Route entries of `task_type` to `handler`. Replaces any previous one.
    pub fn register_handler(&self, task_type: &str, handler: Arc<dyn TaskHandler>) {
        let previous = self
            .handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(task_type.to_string(), handler);
        if previous.is_some() {
            tracing::warn!(task_type, "handler replaced");
        }
    }

    fn handler_for(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(task_type)
            .cloned()
    }

    /// Spawn the poll loop. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut poller = lock_unpoisoned(&self.poller);
        if poller.is_some() {
            tracing::warn!("dispatcher already started");
            return;
        }
        let this = Arc::clone(self);
        let mut stopping = self.stopping.subscribe();
        *poller = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(this.config.poll_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = raised(&mut stopping) => break,
                }
                if let Err(e) = this.dispatch_once() {
                    tracing::warn!(error = %e, "dispatch tick failed");
                }
            }
            tracing::debug!("dispatcher poll loop stopped");
        }));
        tracing::info!(
            max_concurrent = self.config.max_concurrent,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "dispatcher started"
        );
    }

    /// One tick: claim pending entries while permits last. Returns how many
    /// were dispatched.
    pub fn dispatch_once(self: &Arc<Self>) -> Result<usize, QueueError> {
        let mut dispatched = 0;
        while !*self.stopping.borrow() {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };
            let Some(entry) = self.queue.dequeue()? else {
                break;
            };
            self.launch(entry, permit);
            dispatched += 1;
        }
        Ok(dispatched)
    }

    fn launch(self: &Arc<Self>, entry: QueuedTask, permit: OwnedSemaphorePermit) {
        let Some(handler) = self.handler_for(&entry.task_type) else {
            let error = format!("no handler registered for task type {:?}", entry.task_type);
            tracing::warn!(queue_id = %entry.id, %error, "cannot dispatch");
            self.settle_failure(&entry, FailureKind::HandlerNotFound, LifecyclePhase::Failed, error, None);
            return;
        };

        self.queue
            .publish(LifecycleEvent::for_entry(&entry, LifecyclePhase::Started));
        tracing::info!(queue_id = %entry.id, task_type = %entry.task_type, priority = entry.priority, "dispatched");

        let ctx = HandlerContext::new(
            entry.id.clone(),
            entry.task_type.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.supervisor),
            Arc::clone(&self.streamer),
        );
        let payload = entry.payload.clone();
        let work = tokio::spawn(async move { handler.run(payload, ctx).await });
        self.supervise(entry, Some(permit), self.config.task_timeout, work);
    }

    /// Take over a process found alive at boot. It gets a permit when one is
    /// free and runs over the ceiling otherwise. Its timeout is what remains
    /// of the budget since the persisted start.
    pub fn adopt(self: &Arc<Self>, entry: QueuedTask, process: ProcessHandle) {
        let permit = Arc::clone(&self.permits).try_acquire_owned().ok();
        if permit.is_none() {
            tracing::warn!(queue_id = %entry.id, "adopting reattached process above the concurrency ceiling");
        }
        let elapsed_ms = entry
            .started_at
            .map(|at| (now_ms() - at).max(0) as u64)
            .unwrap_or(0);
        let remaining = self
            .config
            .task_timeout
            .saturating_sub(Duration::from_millis(elapsed_ms));
        let started_at = entry.started_at.unwrap_or_else(now_ms);
        let work = tokio::spawn(async move {
            let exit = process.wait().await;
            Ok(HandlerOutcome {
                exit_code: exit.code,
                duration_ms: now_ms() - started_at,
                summary: Some(format!("reattached process {} exited", process.pid)),
            })
        });
        tracing::info!(queue_id = %entry.id, remaining_ms = remaining.as_millis() as u64, "adopted running entry");
        self.supervise(entry, permit, remaining, work);
    }

    fn supervise(
        self: &Arc<Self>,
        entry: QueuedTask,
        permit: Option<OwnedSemaphorePermit>,
        timeout: Duration,
        mut work: JoinHandle<anyhow::Result<HandlerOutcome>>,
    ) {
        lock_unpoisoned(&self.in_flight).insert(entry.id.clone(), tokio::time::Instant::now());
        let this = Arc::clone(self);
        let mut abort = self.abort.subscribe();
        tokio::spawn(async move {
            let _permit = permit;
            let verdict = tokio::select! {
                res = &mut work => Verdict::Finished(res),
                _ = tokio::time::sleep(timeout) => Verdict::TimedOut,
                _ = raised(&mut abort) => Verdict::Aborted,
            };
            if matches!(verdict, Verdict::TimedOut | Verdict::Aborted) {
                if let Err(e) = this.supervisor.terminate_task(&entry.id).await {
                    tracing::warn!(queue_id = %entry.id, error = %e, "terminate failed");
                }
                work.abort();
            }
            this.settle(&entry, verdict, timeout);

            let mut in_flight = lock_unpoisoned(&this.in_flight);
            in_flight.remove(&entry.id);
            if in_flight.is_empty() {
                this.drained.notify_waiters();
            }
        });
    }

    fn settle(&self, entry: &QueuedTask, verdict: Verdict, timeout: Duration) {
        let started_at = entry.started_at.unwrap_or_else(now_ms);
        let elapsed = Some(now_ms() - started_at);
        match verdict {
            Verdict::Finished(Ok(Ok(outcome))) => match outcome.exit_code {
                Some(code) if code != 0 => {
                    let error = format!("exited with code {code}");
                    self.settle_failure(entry, FailureKind::HandlerFailed, LifecyclePhase::Failed, error, Some(outcome));
                }
                _ => match self.queue.mark_completed(&entry.id) {
                    Ok(_) => {
                        tracing::info!(queue_id = %entry.id, duration_ms = outcome.duration_ms, "completed");
                        let mut event = LifecycleEvent::for_entry(entry, LifecyclePhase::Completed);
                        event.exit_code = outcome.exit_code;
                        event.duration_ms = Some(outcome.duration_ms);
                        event.summary = outcome.summary;
                        self.queue.publish(event);
                    }
                    Err(e) => tracing::warn!(queue_id = %entry.id, error = %e, "could not mark completed"),
                },
            },
            Verdict::Finished(Ok(Err(e))) => {
                let kind = match e.downcast_ref::<SupervisorError>() {
                    Some(SupervisorError::Spawn { .. }) => FailureKind::ProcessSpawnFailure,
                    _ => FailureKind::HandlerFailed,
                };
                let outcome = HandlerOutcome { duration_ms: elapsed.unwrap_or(0), ..Default::default() };
                self.settle_failure(entry, kind, LifecyclePhase::Failed, format!("{e:#}"), Some(outcome));
            }
            Verdict::Finished(Err(join)) => {
                let error = if join.is_panic() {
                    "handler panicked".to_string()
                } else {
                    format!("handler task ended: {join}")
                };
                let outcome = HandlerOutcome { duration_ms: elapsed.unwrap_or(0), ..Default::default() };
                self.settle_failure(entry, FailureKind::HandlerFailed, LifecyclePhase::Failed, error, Some(outcome));
            }
            Verdict::TimedOut => {
                let error = format!("timed out after {} ms", timeout.as_millis());
                let outcome = HandlerOutcome { duration_ms: elapsed.unwrap_or(0), ..Default::default() };
                self.settle_failure(entry, FailureKind::Timeout, LifecyclePhase::Timeout, error, Some(outcome));
            }
            Verdict::Aborted => {
                let outcome = HandlerOutcome { duration_ms: elapsed.unwrap_or(0), ..Default::default() };
                self.settle_failure(
                    entry,
                    FailureKind::ShutdownAbort,
                    LifecyclePhase::Failed,
                    "aborted by shutdown".to_string(),
                    Some(outcome),
                );
            }
        }
    }

    fn settle_failure(
        &self,
        entry: &QueuedTask,
        kind: FailureKind,
        phase: LifecyclePhase,
        error: String,
        outcome: Option<HandlerOutcome>,
    ) {
        if let Err(e) = self.queue.mark_failed(&entry.id, kind, error.clone()) {
            tracing::warn!(queue_id = %entry.id, error = %e, "could not mark failed");
            return;
        }
        tracing::warn!(queue_id = %entry.id, failure_kind = %kind, %error, "failed");
        let mut event = LifecycleEvent::for_entry(entry, phase).with_failure(kind, error);
        if let Some(outcome) = outcome {
            event.exit_code = outcome.exit_code;
            event.duration_ms = Some(outcome.duration_ms);
            event.summary = outcome.summary;
        }
        self.queue.publish(event);
    }

    /// Entries currently being supervised.
    pub fn in_flight(&self) -> usize {
        lock_unpoisoned(&self.in_flight).len()
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop dequeuing, give in-flight work `grace` to finish, then terminate
    /// and fail what is left.
    pub async fn stop(&self, grace: Duration) -> ShutdownReport {
        self.stopping.send_replace(true);
        let poller = lock_unpoisoned(&self.poller).take();
        if let Some(poller) = poller {
            if let Err(e) = poller.await {
                tracing::warn!(error = %e, "poll loop ended abnormally");
            }
        }

        let at_stop = self.in_flight();
        tracing::info!(in_flight = at_stop, grace_ms = grace.as_millis() as u64, "dispatcher stopping");
        if tokio::time::timeout(grace, self.wait_idle()).await.is_ok() {
            return ShutdownReport {
                finished_naturally: at_stop,
                aborted: 0,
            };
        }

        let aborted = self.in_flight();
        tracing::warn!(aborted, "grace period elapsed; aborting in-flight work");
        self.abort.send_replace(true);
        self.wait_idle().await;
        ShutdownReport {
            finished_naturally: at_stop.saturating_sub(aborted),
            aborted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::handler::handler_fn;
    use crate::queue::EnqueueOptions;
    use runq_core::QueueState;
    use runq_storage::MemoryStore;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        queue: Arc<TaskQueueService>,
        bus: Arc<EventBus>,
        dispatcher: Arc<Dispatcher>,
    }

    fn fixture(config: DispatcherConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new(100));
        let queue = Arc::new(TaskQueueService::new(store.clone(), Arc::clone(&bus)));
        let supervisor = Arc::new(ProcessSupervisor::new(
            dir.path().to_path_buf(),
            Duration::from_millis(200),
            Duration::from_millis(50),
        ));
        let streamer = Arc::new(OutputStreamer::new(store, Duration::from_millis(20), 64));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&queue), supervisor, streamer, config));
        Fixture { _dir: dir, queue, bus, dispatcher }
    }

    fn phases(bus: &EventBus) -> Vec<String> {
        bus.recent("task.*", 100).into_iter().map(|e| e.event_type).collect()
    }

    #[tokio::test]
    async fn missing_handler_fails_entry() {
        let fx = fixture(DispatcherConfig::default());
        let id = fx.queue.enqueue("unknown", json!({}), 0, EnqueueOptions::default()).unwrap();
        assert_eq!(fx.dispatcher.dispatch_once().unwrap(), 1);
        let entry = fx.queue.get(&id).unwrap().unwrap();
        assert_eq!(entry.state, QueueState::Failed);
        assert_eq!(entry.failure_kind, Some(FailureKind::HandlerNotFound));
        assert_eq!(phases(&fx.bus), vec!["task.queued", "task.failed"]);
    }

    #[tokio::test]
    async fn non_zero_exit_code_fails_and_zero_completes() {
        let fx = fixture(DispatcherConfig::default());
        fx.dispatcher.register_handler(
            "exit",
            handler_fn(|payload, _ctx| async move {
                Ok(HandlerOutcome {
                    exit_code: payload["code"].as_i64().map(|c| c as i32),
                    duration_ms: 1,
                    summary: None,
                })
            }),
        );
        let ok = fx.queue.enqueue("exit", json!({"code": 0}), 0, EnqueueOptions::default()).unwrap();
        let bad = fx.queue.enqueue("exit", json!({"code": 2}), 1, EnqueueOptions::default()).unwrap();
        let unknown = fx.queue.enqueue("exit", json!({}), 2, EnqueueOptions::default()).unwrap();
        fx.dispatcher.dispatch_once().unwrap();
        fx.dispatcher.wait_idle().await;

        assert_eq!(fx.queue.get(&ok).unwrap().unwrap().state, QueueState::Completed);
        assert_eq!(fx.queue.get(&unknown).unwrap().unwrap().state, QueueState::Completed);
        let bad = fx.queue.get(&bad).unwrap().unwrap();
        assert_eq!(bad.state, QueueState::Failed);
        assert_eq!(bad.failure_kind, Some(FailureKind::HandlerFailed));
        assert_eq!(bad.error.as_deref(), Some("exited with code 2"));
    }

    #[tokio::test]
    async fn handler_panic_is_isolated() {
        let fx = fixture(DispatcherConfig::default());
        fx.dispatcher.register_handler(
            "boom",
            handler_fn(|_payload, _ctx| async move {
                if true {
                    panic!("handler exploded");
                }
                Ok(HandlerOutcome::default())
            }),
        );
        fx.dispatcher.register_handler(
            "fine",
            handler_fn(|_payload, _ctx| async move { Ok(HandlerOutcome::default()) }),
        );
        let boom = fx.queue.enqueue("boom", json!({}), 0, EnqueueOptions::default()).unwrap();
        let fine = fx.queue.enqueue("fine", json!({}), 0, EnqueueOptions::default()).unwrap();
        fx.dispatcher.dispatch_once().unwrap();
        fx.dispatcher.wait_idle().await;

        let boom = fx.queue.get(&boom).unwrap().unwrap();
        assert_eq!(boom.state, QueueState::Failed);
        assert_eq!(boom.error.as_deref(), Some("handler panicked"));
        assert_eq!(fx.queue.get(&fine).unwrap().unwrap().state, QueueState::Completed);
    }

    #[tokio::test]
    async fn stop_aborts_stragglers_after_grace() {
        let fx = fixture(DispatcherConfig { max_concurrent: 2, ..Default::default() });
        fx.dispatcher.register_handler(
            "sleepy",
            handler_fn(|payload, _ctx| async move {
                let ms = payload["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(HandlerOutcome::default())
            }),
        );
        let quick = fx.queue.enqueue("sleepy", json!({"ms": 10}), 0, EnqueueOptions::default()).unwrap();
        let slow = fx.queue.enqueue("sleepy", json!({"ms": 60_000}), 0, EnqueueOptions::default()).unwrap();
        // only two permits; the third stays pending
        let waiting = fx.queue.enqueue("sleepy", json!({"ms": 0}), 9, EnqueueOptions::default()).unwrap();
        assert_eq!(fx.dispatcher.dispatch_once().unwrap(), 2);

        let report = fx.dispatcher.stop(Duration::from_millis(300)).await;
        assert_eq!(report, ShutdownReport { finished_naturally: 1, aborted: 1 });
        assert_eq!(fx.queue.get(&quick).unwrap().unwrap().state, QueueState::Completed);
        let slow = fx.queue.get(&slow).unwrap().unwrap();
        assert_eq!(slow.failure_kind, Some(FailureKind::ShutdownAbort));
        assert_eq!(fx.queue.get(&waiting).unwrap().unwrap().state, QueueState::Pending);
        assert_eq!(fx.dispatcher.dispatch_once().unwrap(), 0);
        assert!(phases(&fx.bus).contains(&"task.failed".to_string()));
    }
}

//! Handler contract and the built-in agent runner.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use runq_core::QueueId;
use serde::Serialize;

use crate::output::OutputStreamer;
use crate::queue::TaskQueueService;
use crate::supervisor::{ProcessHandle, ProcessSupervisor, SpawnSpec, TermSignal};

/// What a handler reports when it finishes without error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HandlerOutcome {
    /// Zero or `None` means success.
    pub exit_code: Option<i32>,
    /// Wall-clock run time.
    pub duration_ms: i64,
    /// Free-form result line.
    pub summary: Option<String>,
}

/// Executes queue entries of one task type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run to completion. Errors fail the entry; a non-zero exit code in the
    /// outcome does too.
    async fn run(&self, payload: serde_json::Value, ctx: HandlerContext) -> anyhow::Result<HandlerOutcome>;
}

/// Per-run context. `spawn` is the only way a handler reaches the process
/// supervisor.
#[derive(Clone)]
pub struct HandlerContext {
    queue_id: QueueId,
    task_type: String,
    queue: Arc<TaskQueueService>,
    supervisor: Arc<ProcessSupervisor>,
    streamer: Arc<OutputStreamer>,
}

impl HandlerContext {
    pub(crate) fn new(
        queue_id: QueueId,
        task_type: String,
        queue: Arc<TaskQueueService>,
        supervisor: Arc<ProcessSupervisor>,
        streamer: Arc<OutputStreamer>,
    ) -> Self {
        Self {
            queue_id,
            task_type,
            queue,
            supervisor,
            streamer,
        }
    }

    /// Entry being run.
    pub fn queue_id(&self) -> &QueueId {
        &self.queue_id
    }

    /// Task type of the entry.
    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    /// Start a supervised process for this entry, record it for restart
    /// recovery and begin streaming its output.
    pub async fn spawn(&self, spec: &SpawnSpec) -> anyhow::Result<ProcessHandle> {
        let handle = self.supervisor.spawn(&self.queue_id, spec).await?;
        if let Err(e) = self
            .queue
            .record_process(&self.queue_id, handle.pid, &handle.fingerprint)
        {
            // entry already settled (timeout or shutdown); don't leave an orphan
            tracing::warn!(queue_id = %self.queue_id, pid = handle.pid, error = %e, "entry no longer running; killing process");
            if let Err(kill_err) = self.supervisor.terminate(&handle, TermSignal::Terminate).await {
                tracing::warn!(queue_id = %self.queue_id, error = %kill_err, "terminate failed");
            }
            return Err(e.into());
        }
        self.streamer.attach(&handle);
        Ok(handle)
    }
}

/// Adapts an async closure into a [`TaskHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F, Fut>
where
    F: Fn(serde_json::Value, HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HandlerOutcome>> + Send + 'static,
{
    async fn run(&self, payload: serde_json::Value, ctx: HandlerContext) -> anyhow::Result<HandlerOutcome> {
        (self.f)(payload, ctx).await
    }
}

/// Build a handler from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(serde_json::Value, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HandlerOutcome>> + Send + 'static,
{
    Arc::new(FnHandler { f, _fut: PhantomData })
}

/// Runs the `agent_run` task type: one external CLI invocation described by
/// a [`SpawnSpec`] payload.
#[derive(Debug, Default)]
pub struct AgentRunHandler;

impl AgentRunHandler {
    /// Task type this handler is registered under.
    pub const TASK_TYPE: &'static str = "agent_run";
}

#[async_trait]
impl TaskHandler for AgentRunHandler {
    async fn run(&self, payload: serde_json::Value, ctx: HandlerContext) -> anyhow::Result<HandlerOutcome> {
        let spec: SpawnSpec = serde_json::from_value(payload)
            .map_err(|e| anyhow::anyhow!("invalid agent_run payload: {e}"))?;
        let started = Instant::now();
        let handle = ctx.spawn(&spec).await?;
        let exit = handle.wait().await;
        let duration_ms = started.elapsed().as_millis() as i64;

        // shell convention for signal deaths, so they do not read as success
        let exit_code = exit.code.or(exit.signal.map(|s| 128 + s));
        let summary = match (exit.code, exit.signal) {
            (Some(code), _) => format!("{} exited with code {code}", spec.program),
            (None, Some(signal)) => format!("{} killed by signal {signal}", spec.program),
            (None, None) => format!("{} exited", spec.program),
        };
        Ok(HandlerOutcome {
            exit_code,
            duration_ms,
            summary: Some(summary),
        })
    }
}

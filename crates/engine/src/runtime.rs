//! Explicit wiring of every engine component, plus the boot and shutdown
//! sequences.

use std::sync::Arc;
use std::time::Duration;

use runq_storage::Store;

use crate::bridge::{ReconnectReport, TaskBridge};
use crate::bus::EventBus;
use crate::config::EngineConfig;
use crate::dispatcher::{Dispatcher, DispatcherConfig, ShutdownReport};
use crate::error::{ConfigError, QueueError};
use crate::handler::AgentRunHandler;
use crate::loops::{GitWorktreeMerger, LoopsManager};
use crate::output::OutputStreamer;
use crate::queue::{HydrateReport, TaskQueueService};
use crate::supervisor::ProcessSupervisor;

/// All components of one engine instance.
pub struct Runtime {
    config: EngineConfig,
    bus: Arc<EventBus>,
    queue: Arc<TaskQueueService>,
    supervisor: Arc<ProcessSupervisor>,
    streamer: Arc<OutputStreamer>,
    dispatcher: Arc<Dispatcher>,
    bridge: Arc<TaskBridge>,
    loops: Option<Arc<LoopsManager>>,
}

impl Runtime {
    /// Construct and connect the components over `store`. Nothing runs until
    /// [`Runtime::boot`]. The `agent_run` handler is registered.
    pub fn build(config: EngineConfig, store: Arc<dyn Store>) -> Result<Self, ConfigError> {
        config.validate()?;
        let ms = Duration::from_millis;

        let bus = Arc::new(EventBus::new(config.event_history));
        let queue = Arc::new(TaskQueueService::new(Arc::clone(&store), Arc::clone(&bus)));
        let supervisor = Arc::new(ProcessSupervisor::new(
            config.logs_root(),
            ms(config.terminate_grace_ms),
            ms(config.liveness_poll_ms),
        ));
        let streamer = Arc::new(OutputStreamer::new(
            Arc::clone(&store),
            ms(config.output_poll_ms),
            config.log_channel_capacity,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&supervisor),
            Arc::clone(&streamer),
            DispatcherConfig {
                max_concurrent: config.max_concurrent,
                poll_interval: ms(config.poll_interval_ms),
                task_timeout: ms(config.task_timeout_ms),
            },
        ));
        dispatcher.register_handler(AgentRunHandler::TASK_TYPE, Arc::new(AgentRunHandler));

        let bridge = Arc::new(TaskBridge::new(
            store,
            Arc::clone(&queue),
            Arc::clone(&bus),
            Arc::clone(&supervisor),
            Arc::clone(&streamer),
            Arc::clone(&dispatcher),
        ));

        let loops = config.merge.as_ref().map(|merge| {
            let source = GitWorktreeMerger::new(
                merge.repo_root.clone(),
                merge.worktrees_root.clone(),
                merge.marker_file.clone(),
            );
            Arc::new(LoopsManager::new(
                Arc::new(source),
                Arc::clone(&bus),
                ms(config.merge_interval_ms),
            ))
        });

        Ok(Self {
            config,
            bus,
            queue,
            supervisor,
            streamer,
            dispatcher,
            bridge,
            loops,
        })
    }

    /// Hydrate the queue, follow lifecycle events, recover entries left
    /// running, then start the dispatcher and the merge loop.
    pub async fn boot(&self) -> Result<(HydrateReport, ReconnectReport), QueueError> {
        let mut hydrated = self.queue.hydrate()?;
        self.bridge.attach();
        let running = std::mem::take(&mut hydrated.running);
        let reconnected = self.bridge.reconnect_running_tasks(running).await;
        self.dispatcher.start();
        if let Some(loops) = &self.loops {
            loops.start();
        }
        tracing::info!(
            max_concurrent = self.config.max_concurrent,
            data_dir = %self.config.data_dir.display(),
            merge_loop = self.loops.is_some(),
            "runtime booted"
        );
        Ok((hydrated, reconnected))
    }

    /// Drain the dispatcher within `grace`, then stop the merge loop.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let report = self.dispatcher.stop(grace).await;
        if let Some(loops) = &self.loops {
            loops.stop().await;
        }
        self.bridge.detach();
        tracing::info!(
            finished = report.finished_naturally,
            aborted = report.aborted,
            "runtime stopped"
        );
        report
    }

    /// Effective configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared event bus.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Queue state machine.
    pub fn queue(&self) -> &Arc<TaskQueueService> {
        &self.queue
    }

    /// Process supervisor.
    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Output streamer for live log subscriptions.
    pub fn streamer(&self) -> &Arc<OutputStreamer> {
        &self.streamer
    }

    /// Dispatcher, for registering further handlers before boot.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Task projection API.
    pub fn bridge(&self) -> &Arc<TaskBridge> {
        &self.bridge
    }

    /// Merge loop, when configured.
    pub fn loops(&self) -> Option<&Arc<LoopsManager>> {
        self.loops.as_ref()
    }
}

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! The runq execution engine: queue state machine, event bus, dispatcher,
//! process supervision, output streaming, task projection and the merge loop.
//!
//! Every component is an explicit value wired together by [`Runtime::build`];
//! nothing here is global.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod loops;
pub mod output;
pub mod queue;
pub mod runtime;
pub mod supervisor;

pub use bridge::{CreateTaskRequest, ReconnectReport, TaskBridge, UpdateTaskRequest};
pub use bus::{EventBus, PublishOptions, PublishReport, SubscribeOptions, Subscription};
pub use config::EngineConfig;
pub use dispatcher::{Dispatcher, DispatcherConfig, ShutdownReport};
pub use error::{BridgeError, ConfigError, QueueError, SupervisorError};
pub use handler::{handler_fn, AgentRunHandler, HandlerContext, HandlerOutcome, TaskHandler};
pub use loops::{GitWorktreeMerger, LoopTickReport, LoopsManager, MergeOutcome, MergeSource, WorkUnit};
pub use output::{LogSubscription, OutputStreamer};
pub use queue::{EnqueueOptions, HydrateReport, TaskQueueService};
pub use runtime::Runtime;
pub use supervisor::{ProcessExit, ProcessHandle, ProcessSupervisor, Reconciliation, SpawnSpec, TermSignal};

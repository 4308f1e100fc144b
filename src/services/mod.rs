//! Service layer: the event-driven execution engine.
//!
//! The bus, the node/group/status stores, the framework handler chain,
//! and the task runner that drives them.

pub mod business;
pub mod config;
pub mod event_bus;
pub mod group_store;
pub mod handlers;
pub mod loop_detector;
pub mod node_store;
pub mod runtime_state;
pub mod status_store;
pub mod task_runner;

pub use business::{AgentPolicyHandler, ControlRelayHandler, ToolStepHandler};
pub use config::{ConfigError, ConfigLoader, LoggingConfig, RunnerConfig, RuntimeConfig};
pub use event_bus::{BusinessHandler, EventBus, MessageTransformer};
pub use group_store::GroupStore;
pub use handlers::{
    BackgroundTaskHandler, FrameworkHandler, GroupHandler, MemoryHandler, MergeMode,
    OutputHandler, TaskControlHandler,
};
pub use loop_detector::{LoopDetector, LoopSignal};
pub use node_store::RunNodeStore;
pub use runtime_state::{BackgroundTasks, ControlState};
pub use status_store::{TaskStatusEntry, TaskStatusStore};
pub use task_runner::TaskRunner;

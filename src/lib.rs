//! Overmind - Event-Driven Multi-Agent Task Execution Runtime
//!
//! Overmind decomposes user tasks into a graph of cooperating agents and
//! tools and drives execution to completion with an event-driven runner:
//! a message bus with per-message lifecycle tracking, fan-out/fan-in group
//! aggregation, and a cooperative cancellation/interruption/timeout
//! control plane.
//!
//! # Architecture
//!
//! This crate follows Clean Architecture / Hexagonal Architecture principles:
//!
//! - **Domain Layer** (`domain`): Pure models, error taxonomy, and the
//!   ports external collaborators implement (agents, tools, memory,
//!   checkpoints, output streams)
//! - **Service Layer** (`services`): The execution engine — message bus,
//!   node state store, framework handler chain, group aggregator, task
//!   runner, and the task status store external callers mutate
//!
//! # Example
//!
//! ```ignore
//! use overmind::domain::models::{Swarm, Task};
//! use overmind::services::{TaskRunner, TaskStatusStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let swarm = Swarm::builder()
//!         .agent(my_agent)
//!         .entry_agent("my_agent")
//!         .build();
//!     let status = TaskStatusStore::new();
//!     let mut runner = TaskRunner::new(Task::new("do the thing", swarm), status);
//!     let response = runner.run().await?;
//!     println!("{:?}", response.answer);
//!     Ok(())
//! }
//! ```

pub mod domain;
pub mod services;

// Re-export commonly used types for convenience
pub use domain::errors::{BusError, GroupError, HandlerError, NodeError, RuntimeError};
pub use domain::models::{
    ActionModel, ActionResult, Context, ConversationTurn, Headers, Message, MessageCategory,
    Observation, Payload, RunConf, Swarm, Task, TaskResponse, TaskRuntimeStatus, Topic, Usage,
};
pub use domain::ports::{
    AgentPolicy, CheckpointSink, MemorySink, OutputSink, PolicyInfo, Tool,
};
pub use services::{
    ConfigLoader, EventBus, RunNodeStore, RuntimeConfig, TaskRunner, TaskStatusStore,
};

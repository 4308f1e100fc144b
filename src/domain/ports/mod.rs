//! Collaborator interfaces consumed by the core.
//!
//! Everything outside the event-driven engine — LLM-backed agents, tool
//! implementations, memory persistence, checkpoints, output streaming —
//! is reached through these ports. Each port ships a `Null*`
//! implementation so the runtime works without external services.

pub mod agent;
pub mod checkpoint;
pub mod memory;
pub mod output;
pub mod tool;

pub use agent::{AgentPolicy, PolicyInfo};
pub use checkpoint::{
    CheckpointHandle, CheckpointSink, NullCheckpointSink, RecordingCheckpointSink,
};
pub use memory::{InMemoryMemorySink, MemoryFilters, MemorySink, MemoryWriteConfig, NullMemorySink};
pub use output::{ChannelOutputSink, NullOutputSink, OutputSink};
pub use tool::Tool;

//! Pure domain models: messages, actions, nodes, groups, tasks, contexts,
//! and the swarm topology.

pub mod action;
pub mod context;
pub mod message;
pub mod node;
pub mod swarm;
pub mod task;

pub use action::{ActionModel, ActionResult, ConversationTurn, Observation, TurnRole};
pub use context::{Context, Usage, UsageRecorder};
pub use message::{
    BackgroundResult, Headers, Message, MessageCategory, MessageId, Payload, SenderSlice,
    TaskControl, Topic,
};
pub use node::{Group, HandleResult, NodeSpec, NodeStatus, RunNode};
pub use swarm::{Swarm, SwarmBuilder};
pub use task::{LoopDetectionConf, RunConf, Task, TaskResponse, TaskRuntimeStatus};

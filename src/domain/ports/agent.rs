//! Agent invocation port.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::domain::models::action::{ActionModel, Observation};
use crate::domain::models::context::UsageRecorder;
use crate::domain::models::message::Message;

/// Ambient call information handed to a policy invocation.
#[derive(Debug, Clone)]
pub struct PolicyInfo {
    /// Owning task.
    pub task_id: String,
    /// Owning session.
    pub session_id: String,
    /// Nesting level of the triggering message.
    pub level: u32,
    /// Shared handle for reporting token usage to the runner.
    pub usage: UsageRecorder,
    /// Free-form extras.
    pub extra: HashMap<String, Value>,
}

/// Port for agent policy invocation.
///
/// The core treats this as an opaque async call that may itself perform
/// nested LLM/tool calls and return either tool-dispatch actions or
/// agent-handoff actions. Implementations must be stateless per call:
/// branch-local state travels in the message's context, never in the
/// agent object, so one instance can serve parallel fan-out branches.
#[async_trait]
pub trait AgentPolicy: Send + Sync {
    /// The agent's registered name.
    fn name(&self) -> &str;

    /// Decide the next action(s) for an observation.
    async fn policy(
        &self,
        observation: &Observation,
        info: &PolicyInfo,
        message: &Message,
    ) -> anyhow::Result<Vec<ActionModel>>;
}

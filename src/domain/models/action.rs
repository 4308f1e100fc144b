//! Actions, observations, and conversational turns.
//!
//! An agent's policy decision is a list of [`ActionModel`]s: tool calls,
//! handoffs to other agents, or a final answer. Tools answer with an
//! [`Observation`] carrying one [`ActionResult`] per input action.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One action produced by an agent's policy call.
///
/// Exactly one of `tool_name` / `agent_name` is set for dispatchable
/// actions; neither set means the action carries the final answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionModel {
    /// Target tool, for tool actions.
    pub tool_name: Option<String>,
    /// Sub-operation within the tool, when the tool exposes several.
    pub action_name: Option<String>,
    /// Target agent, for handoff actions.
    pub agent_name: Option<String>,
    /// Arbitrary call parameters.
    pub params: Value,
    /// Correlation id linking this action to its eventual result.
    pub tool_call_id: Option<String>,
    /// Free-form policy annotation (model name, stop reason, ...).
    pub policy_info: Option<String>,
}

impl ActionModel {
    /// Build a tool-call action.
    pub fn tool_call(
        tool_name: impl Into<String>,
        action_name: Option<String>,
        params: Value,
        tool_call_id: impl Into<String>,
    ) -> Self {
        Self {
            tool_name: Some(tool_name.into()),
            action_name,
            agent_name: None,
            params,
            tool_call_id: Some(tool_call_id.into()),
            policy_info: None,
        }
    }

    /// Build an agent-handoff action.
    pub fn handoff(agent_name: impl Into<String>, params: Value) -> Self {
        Self {
            tool_name: None,
            action_name: None,
            agent_name: Some(agent_name.into()),
            params,
            tool_call_id: None,
            policy_info: None,
        }
    }

    /// Build a final-answer action.
    pub fn finish(content: impl Into<String>) -> Self {
        Self {
            tool_name: None,
            action_name: None,
            agent_name: None,
            params: serde_json::json!({ "content": content.into() }),
            tool_call_id: None,
            policy_info: None,
        }
    }

    /// Whether this action dispatches to a tool.
    pub fn is_tool_action(&self) -> bool {
        self.tool_name.is_some()
    }

    /// Whether this action delegates to another agent.
    pub fn is_agent_action(&self) -> bool {
        self.agent_name.is_some() && self.tool_name.is_none()
    }

    /// Whether this action carries the final answer.
    pub fn is_final(&self) -> bool {
        self.tool_name.is_none() && self.agent_name.is_none()
    }

    /// Extract the textual content of the params, if any.
    pub fn content(&self) -> Option<&str> {
        self.params.get("content").and_then(Value::as_str)
    }
}

/// Outcome of one action inside a tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Correlation id copied from the originating [`ActionModel`].
    pub tool_call_id: Option<String>,
    /// Result content (tool output, agent answer).
    pub content: String,
    /// Whether the action succeeded.
    pub success: bool,
    /// Failure reason when `success` is false.
    pub error: Option<String>,
}

impl ActionResult {
    /// Build a successful result.
    pub fn ok(tool_call_id: Option<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id,
            content: content.into(),
            success: true,
            error: None,
        }
    }

    /// Build a failed result.
    pub fn failed(tool_call_id: Option<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            tool_call_id,
            content: String::new(),
            success: false,
            error: Some(error),
        }
    }
}

/// What an agent sees: task input or the results of its previous actions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Free-text content (the task input, or synthesized branch output).
    pub content: Option<String>,
    /// Per-action results, in the order the actions were issued.
    pub action_results: Vec<ActionResult>,
}

impl Observation {
    /// Observation carrying only text content.
    pub fn from_content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            action_results: Vec::new(),
        }
    }

    /// Observation carrying action results.
    pub fn from_results(action_results: Vec<ActionResult>) -> Self {
        Self {
            content: None,
            action_results,
        }
    }
}

/// Role of a conversational turn written to the memory sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    /// System / framework bookkeeping.
    System,
    /// User or task input.
    Human,
    /// Agent output.
    Ai,
    /// Tool output.
    Tool,
}

impl TurnRole {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Human => "human",
            Self::Ai => "ai",
            Self::Tool => "tool",
        }
    }
}

/// One conversational turn persisted by the memory handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Who produced the turn.
    pub role: TurnRole,
    /// Turn content.
    pub content: String,
    /// Agent whose conversation this turn belongs to.
    pub agent_id: Option<String>,
    /// Session the turn belongs to.
    pub session_id: String,
    /// Tool-call correlation for tool turns.
    pub tool_call_id: Option<String>,
    /// When the turn was produced.
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    /// Create a turn stamped with the current time.
    pub fn new(
        role: TurnRole,
        content: impl Into<String>,
        agent_id: Option<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            role,
            content: content.into(),
            agent_id,
            session_id: session_id.into(),
            tool_call_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach a tool-call correlation id.
    pub fn with_tool_call_id(mut self, id: impl Into<String>) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }
}

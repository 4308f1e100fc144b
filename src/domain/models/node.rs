//! Run nodes and groups: per-message execution-state records.
//!
//! A node tracks one message's full handling lifecycle; a group names the
//! sibling nodes spawned from one multi-action decision so their results
//! can be aggregated once every member is terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::message::{Headers, Message, MessageCategory};

/// Lifecycle status of a run node. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Created but not yet dispatched.
    Created,
    /// Handlers are processing the message.
    Running,
    /// All bound handlers reported success.
    Success,
    /// At least one handler failed with no recovery.
    Failed,
}

impl NodeStatus {
    /// Whether this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self::Created
    }
}

/// One handler's recorded outcome for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleResult {
    /// Which handler reported.
    pub handler_name: String,
    /// The message the handler produced, if any.
    pub message: Option<Message>,
    /// Success or Failed.
    pub status: NodeStatus,
    /// When the result was recorded.
    pub created_at: DateTime<Utc>,
}

impl HandleResult {
    /// Record a successful handler completion.
    pub fn success(handler_name: impl Into<String>, message: Option<Message>) -> Self {
        Self {
            handler_name: handler_name.into(),
            message,
            status: NodeStatus::Success,
            created_at: Utc::now(),
        }
    }

    /// Record a failed handler completion.
    pub fn failed(handler_name: impl Into<String>, message: Option<Message>) -> Self {
        Self {
            handler_name: handler_name.into(),
            message,
            status: NodeStatus::Failed,
            created_at: Utc::now(),
        }
    }
}

/// Per-message execution-state record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunNode {
    /// Node id; equals the message id in the common case.
    pub node_id: String,
    /// Business type, derived from the message category.
    pub busi_type: MessageCategory,
    /// Business id, usually the receiver.
    pub busi_id: String,
    /// Owning session.
    pub session_id: String,
    /// Owning task.
    pub task_id: Option<String>,
    /// Structural parent in a fan-out tree.
    pub parent_node_id: Option<String>,
    /// Group membership.
    pub group_id: Option<String>,
    /// Root node of a nested sub-group, when applicable.
    pub sub_group_root_id: Option<String>,
    /// Who sent the originating message.
    pub msg_from: Option<String>,
    /// Free-form metadata (root agent id, root tool call id, group sender).
    pub metadata: HashMap<String, Value>,
    /// Current status; monotonic once terminal.
    pub status: NodeStatus,
    /// Ordered handler outcomes.
    pub results: Vec<HandleResult>,
    /// How many bound handlers must report before the node is terminal.
    pub handler_count: usize,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last transition time.
    pub updated_at: DateTime<Utc>,
}

impl RunNode {
    /// The last produced message among this node's results, if any.
    ///
    /// Group aggregation treats this as the node's terminal result.
    pub fn result_message(&self) -> Option<&Message> {
        self.results.iter().rev().find_map(|r| r.message.as_ref())
    }

    /// Whether any handler reported failure.
    pub fn has_failed_result(&self) -> bool {
        self.results.iter().any(|r| r.status == NodeStatus::Failed)
    }
}

/// Parameters for idempotent node creation.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    /// Node id (message id in the common case).
    pub node_id: String,
    /// Business type, derived from the message category.
    pub busi_type: MessageCategory,
    /// Business id, usually the receiver.
    pub busi_id: String,
    /// Owning session.
    pub session_id: String,
    /// Owning task.
    pub task_id: Option<String>,
    /// Structural parent in a fan-out tree.
    pub parent_node_id: Option<String>,
    /// Sender of the originating message.
    pub msg_from: Option<String>,
    /// Group membership.
    pub group_id: Option<String>,
    /// Free-form metadata.
    pub metadata: HashMap<String, Value>,
    /// How many bound handlers must report before the node is terminal.
    pub handler_count: usize,
}

impl NodeSpec {
    /// Spec with the required fields; the rest default.
    pub fn new(
        node_id: impl Into<String>,
        busi_type: MessageCategory,
        busi_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            busi_type,
            busi_id: busi_id.into(),
            session_id: session_id.into(),
            task_id: None,
            parent_node_id: None,
            msg_from: None,
            group_id: None,
            metadata: HashMap::new(),
            handler_count: 1,
        }
    }

    /// Set the owning task.
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Set the structural parent.
    pub fn with_parent_node_id(mut self, parent: impl Into<String>) -> Self {
        self.parent_node_id = Some(parent.into());
        self
    }

    /// Set the originating sender.
    pub fn with_msg_from(mut self, from: impl Into<String>) -> Self {
        self.msg_from = Some(from.into());
        self
    }

    /// Set the group membership.
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Set the bound-handler count.
    pub fn with_handler_count(mut self, count: usize) -> Self {
        self.handler_count = count.max(1);
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A named set of sibling nodes created for one fan-out event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Unique group id.
    pub group_id: String,
    /// Owning session.
    pub session_id: String,
    /// Member node ids in registration order. Aggregation preserves this
    /// order regardless of completion order.
    pub node_ids: Vec<String>,
    /// Enclosing group for nested fan-outs.
    pub parent_group_id: Option<String>,
    /// The agent that initiated the fan-out; results addressed to it are
    /// merged into the root aggregate.
    pub sender: String,
    /// Headers snapshot from the originating message, including a deep
    /// copy of the execution context.
    pub headers: Headers,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Group {
    /// Create a group record from the originating message's headers.
    pub fn new(
        group_id: impl Into<String>,
        session_id: impl Into<String>,
        sender: impl Into<String>,
        node_ids: Vec<String>,
        headers: Headers,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            session_id: session_id.into(),
            node_ids,
            parent_group_id: headers.parent_group_id.clone(),
            sender: sender.into(),
            headers,
            created_at: Utc::now(),
        }
    }
}

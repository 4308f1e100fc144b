//! The message: unit of work on the bus.
//!
//! Every message carries a category (which handler family processes it),
//! an optional topic (fine-grained selector within the category), routing
//! identifiers, a typed payload, and headers holding the ambient execution
//! context. Forwarding a message always goes through
//! [`Headers::forwarded`], which increments the nesting level by exactly
//! one, so depth is always inferable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use super::action::{ActionModel, ActionResult, Observation};
use super::context::Context;

/// Unique, immutable identifier assigned at message creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Generate a fresh id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handler family a message dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageCategory {
    /// Agent policy invocation.
    Agent,
    /// Tool step invocation.
    Tool,
    /// Task lifecycle control.
    Task,
    /// Fan-out / fan-in coordination.
    Group,
    /// Conversational memory writes.
    Memory,
    /// External output mirroring.
    Output,
    /// Detached sub-task results.
    BackgroundTask,
    /// Streaming fragments.
    Chunk,
}

impl MessageCategory {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Tool => "tool",
            Self::Task => "task",
            Self::Group => "group",
            Self::Memory => "memory",
            Self::Output => "output",
            Self::BackgroundTask => "background_task",
            Self::Chunk => "chunk",
        }
    }

    /// Parse from a string form.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "agent" => Some(Self::Agent),
            "tool" => Some(Self::Tool),
            "task" => Some(Self::Task),
            "group" => Some(Self::Group),
            "memory" => Some(Self::Memory),
            "output" => Some(Self::Output),
            "background_task" => Some(Self::BackgroundTask),
            "chunk" => Some(Self::Chunk),
            _ => None,
        }
    }
}

impl fmt::Display for MessageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fine-grained selector within a category.
///
/// A message with a topic dispatches only to handlers registered for that
/// exact topic; a message without a topic dispatches by receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Re-emit the runner's seed messages.
    Start,
    /// Task completed with an answer.
    Finished,
    /// Task failed.
    Error,
    /// External or in-band cancellation.
    Cancel,
    /// External or in-band interruption.
    Interrupt,
    /// Deadline exceeded; treated as a cancellation variant.
    Timeout,
    /// Register a newly discovered tool into the live bus.
    SubscribeTool,
    /// Fan a multi-action decision out into parallel branches.
    GroupActions,
    /// A group's members all reached a terminal state; aggregate.
    GroupResults,
    /// Terminal task response, mirrored to the output stream.
    TaskResponse,
    /// Loop-exit marker emitted during shutdown.
    Done,
}

impl Topic {
    /// Stable string form, used as the bus registry key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Cancel => "cancel",
            Self::Interrupt => "interrupt",
            Self::Timeout => "timeout",
            Self::SubscribeTool => "subscribe_tool",
            Self::GroupActions => "group_actions",
            Self::GroupResults => "group_results",
            Self::TaskResponse => "task_response",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task-control payload for TASK-category messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskControl {
    /// Human-readable reason (cancel reason, error description, ...).
    pub reason: Option<String>,
    /// Final answer, for FINISHED control items.
    pub answer: Option<String>,
    /// Auxiliary data (e.g. the tool name for SUBSCRIBE_TOOL).
    pub data: Option<Value>,
}

impl TaskControl {
    /// Control item carrying only a reason.
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            answer: None,
            data: None,
        }
    }

    /// Control item carrying a final answer.
    pub fn finished(answer: impl Into<String>) -> Self {
        Self {
            reason: None,
            answer: Some(answer.into()),
            data: None,
        }
    }
}

/// Result of a detached sub-task, delivered as a BACKGROUND_TASK message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundResult {
    /// The sub-task that produced this result.
    pub task_id: String,
    /// The parent task the result should merge into.
    pub parent_task_id: String,
    /// The sub-task's answer.
    pub answer: String,
    /// Whether the sub-task succeeded.
    pub success: bool,
    /// Checkpoint to restore from when the parent already completed.
    pub checkpoint_id: Option<String>,
}

/// One sender's contribution inside a merged multi-sender message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderSlice {
    /// Which branch produced this slice.
    pub sender: String,
    /// The branch's observation.
    pub observation: Observation,
}

/// Typed message payload.
///
/// A tagged union rather than an "any" field so handlers can match
/// exhaustively instead of sniffing shapes at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// A policy decision: one or more actions.
    Actions(Vec<ActionModel>),
    /// Tool output or task input.
    Observation(Observation),
    /// Task lifecycle control.
    Control(TaskControl),
    /// Detached sub-task result.
    Background(BackgroundResult),
    /// A conversational turn destined for the memory sink.
    Memory(super::action::ConversationTurn),
    /// Several branch results merged for a single receiver.
    Merged(Vec<SenderSlice>),
    /// Escape hatch for framework-internal data.
    Raw(Value),
    /// No payload.
    Empty,
}

/// Ambient execution metadata copied (and depth-incremented) at every hop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    /// Nesting level; strictly +1 per forwarding hop.
    pub level: u32,
    /// Owning task.
    pub task_id: String,
    /// Execution context snapshot (owned; deep copy on clone).
    pub context: Context,
    /// Enclosing group, for fan-out branches.
    pub parent_group_id: Option<String>,
    /// The message that started the current causal chain.
    pub root_message_id: Option<MessageId>,
    /// Free-form extras (root agent id, root tool call id, group sender).
    pub extra: HashMap<String, Value>,
}

impl Headers {
    /// Headers for a fresh causal chain at level zero.
    pub fn root(task_id: impl Into<String>, context: Context) -> Self {
        Self {
            level: 0,
            task_id: task_id.into(),
            context,
            parent_group_id: None,
            root_message_id: None,
            extra: HashMap::new(),
        }
    }

    /// Copy these headers for a forwarded message, incrementing the level
    /// by exactly one.
    pub fn forwarded(&self) -> Self {
        let mut next = self.clone();
        next.level += 1;
        next
    }
}

/// The unit of work passing through the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique, immutable id.
    pub id: MessageId,
    /// Handler family.
    pub category: MessageCategory,
    /// Optional fine-grained selector.
    pub topic: Option<Topic>,
    /// Who produced the message.
    pub sender: String,
    /// Who should process it (agent id, tool name, handler name).
    pub receiver: Option<String>,
    /// On whose behalf the sender acted, for RPC-style chains.
    pub caller: Option<String>,
    /// Owning session.
    pub session_id: String,
    /// Fan-out membership, when this message is a group branch.
    pub group_id: Option<String>,
    /// Ambient execution metadata.
    pub headers: Headers,
    /// Typed payload.
    pub payload: Payload,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Build a message with a fresh id and the current timestamp.
    pub fn new(
        category: MessageCategory,
        sender: impl Into<String>,
        session_id: impl Into<String>,
        headers: Headers,
        payload: Payload,
    ) -> Self {
        Self {
            id: MessageId::new(),
            category,
            topic: None,
            sender: sender.into(),
            receiver: None,
            caller: None,
            session_id: session_id.into(),
            group_id: None,
            headers,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Set the topic.
    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topic = Some(topic);
        self
    }

    /// Set the receiver.
    pub fn with_receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    /// Set the caller.
    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    /// Set the group membership.
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// AGENT message addressed to a named agent.
    pub fn agent(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        session_id: impl Into<String>,
        headers: Headers,
        payload: Payload,
    ) -> Self {
        Self::new(MessageCategory::Agent, sender, session_id, headers, payload)
            .with_receiver(receiver)
    }

    /// TOOL message addressed to a named tool.
    pub fn tool(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        session_id: impl Into<String>,
        headers: Headers,
        actions: Vec<ActionModel>,
    ) -> Self {
        Self::new(
            MessageCategory::Tool,
            sender,
            session_id,
            headers,
            Payload::Actions(actions),
        )
        .with_receiver(receiver)
    }

    /// TASK control message with a topic.
    pub fn control(
        topic: Topic,
        sender: impl Into<String>,
        session_id: impl Into<String>,
        headers: Headers,
        control: TaskControl,
    ) -> Self {
        Self::new(
            MessageCategory::Task,
            sender,
            session_id,
            headers,
            Payload::Control(control),
        )
        .with_topic(topic)
    }

    /// GROUP/GROUP_ACTIONS message fanning a decision out.
    pub fn group_actions(
        sender: impl Into<String>,
        session_id: impl Into<String>,
        headers: Headers,
        actions: Vec<ActionModel>,
    ) -> Self {
        Self::new(
            MessageCategory::Group,
            sender,
            session_id,
            headers,
            Payload::Actions(actions),
        )
        .with_topic(Topic::GroupActions)
    }

    /// GROUP/GROUP_RESULTS message announcing a finished group.
    pub fn group_results(
        group_id: impl Into<String>,
        sender: impl Into<String>,
        session_id: impl Into<String>,
        headers: Headers,
    ) -> Self {
        Self::new(
            MessageCategory::Group,
            sender,
            session_id,
            headers,
            Payload::Empty,
        )
        .with_topic(Topic::GroupResults)
        .with_group_id(group_id)
    }

    /// Tool result message addressed back to the invoking agent.
    ///
    /// Helper for [`Tool`](crate::domain::ports::Tool) implementations:
    /// preserves the origin's caller/group linkage and forwards headers.
    pub fn tool_result(origin: &Message, tool_name: &str, results: Vec<ActionResult>) -> Self {
        let receiver = origin
            .caller
            .clone()
            .unwrap_or_else(|| origin.sender.clone());
        let mut msg = Self::new(
            MessageCategory::Agent,
            tool_name,
            origin.session_id.clone(),
            origin.headers.forwarded(),
            Payload::Observation(Observation::from_results(results)),
        )
        .with_receiver(receiver);
        msg.group_id = origin.group_id.clone();
        msg
    }

    /// The key this message dispatches under: topic first, else receiver.
    ///
    /// `None` means the message is unroutable and will be dropped with a
    /// warning by the bus.
    pub fn routing_key(&self) -> Option<String> {
        match self.topic {
            Some(topic) => Some(topic.as_str().to_string()),
            None => self.receiver.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> Headers {
        Headers::root("task-1", Context::new())
    }

    #[test]
    fn test_forwarded_increments_level_by_one() {
        let a = headers();
        let b = a.forwarded();
        let c = b.forwarded();
        assert_eq!(b.level, a.level + 1);
        assert_eq!(c.level, b.level + 1);
    }

    #[test]
    fn test_routing_key_prefers_topic() {
        let msg = Message::control(
            Topic::Cancel,
            "external",
            "session-1",
            headers(),
            TaskControl::reason("user request"),
        )
        .with_receiver("someone");
        assert_eq!(msg.routing_key().as_deref(), Some("cancel"));

        let msg = Message::agent("tool", "researcher", "session-1", headers(), Payload::Empty);
        assert_eq!(msg.routing_key().as_deref(), Some("researcher"));

        let msg = Message::new(
            MessageCategory::Output,
            "runner",
            "session-1",
            headers(),
            Payload::Empty,
        );
        assert!(msg.routing_key().is_none());
    }

    #[test]
    fn test_tool_result_preserves_group_linkage() {
        let mut origin = Message::tool(
            "researcher",
            "search",
            "session-1",
            headers(),
            vec![ActionModel::tool_call(
                "search",
                None,
                serde_json::json!({}),
                "call-1",
            )],
        );
        origin.group_id = Some("group-7".into());

        let result = Message::tool_result(
            &origin,
            "search",
            vec![ActionResult::ok(Some("call-1".into()), "found it")],
        );

        assert_eq!(result.group_id.as_deref(), Some("group-7"));
        assert_eq!(result.receiver.as_deref(), Some("researcher"));
        assert_eq!(result.headers.level, origin.headers.level + 1);
    }

    #[test]
    fn test_message_round_trips_through_json() {
        let msg = Message::group_actions(
            "researcher",
            "session-1",
            headers(),
            vec![ActionModel::handoff("planner", serde_json::json!({}))],
        );
        let encoded = serde_json::to_string(&msg).expect("serialize");
        let decoded: Message = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded, msg);
    }
}

//! Business handler wrappers: agent policy and tool step functions.
//!
//! These adapt the swarm's capabilities to the bus's
//! [`BusinessHandler`] contract. The wrapper owns the translation from a
//! policy decision to the next message: a single tool call dispatches
//! directly, anything with fan-out or delegation goes through the group
//! machinery, and a final action finishes the task.

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::models::action::{ActionModel, ConversationTurn, Observation, TurnRole};
use crate::domain::models::message::{Message, MessageCategory, Payload, TaskControl, Topic};
use crate::domain::ports::{AgentPolicy, PolicyInfo, Tool};
use crate::services::event_bus::{BusinessHandler, EventBus};
use crate::services::handlers::FrameworkHandler;
use crate::services::runtime_state::ControlState;

/// Build the observation an agent sees from any payload shape.
pub fn extract_observation(message: &Message) -> Observation {
    match &message.payload {
        Payload::Observation(obs) => obs.clone(),
        Payload::Merged(slices) => {
            // Flatten a multi-sender merge into one observation, keeping
            // per-branch results in order.
            let mut merged = Observation::default();
            let mut parts = Vec::new();
            for slice in slices {
                if let Some(content) = &slice.observation.content {
                    parts.push(format!("{}: {}", slice.sender, content));
                }
                merged
                    .action_results
                    .extend(slice.observation.action_results.iter().cloned());
            }
            if !parts.is_empty() {
                merged.content = Some(parts.join("\n"));
            }
            merged
        }
        Payload::Actions(actions) => Observation {
            content: actions
                .first()
                .and_then(|a| a.content())
                .map(str::to_string)
                .or_else(|| serde_json::to_string(actions).ok()),
            action_results: Vec::new(),
        },
        Payload::Control(control) => Observation {
            content: control.answer.clone().or_else(|| control.reason.clone()),
            action_results: Vec::new(),
        },
        Payload::Raw(value) => Observation {
            content: Some(value.to_string()),
            action_results: Vec::new(),
        },
        Payload::Background(result) => Observation::from_content(result.answer.clone()),
        Payload::Memory(turn) => Observation::from_content(turn.content.clone()),
        Payload::Empty => Observation::default(),
    }
}

/// Translate a policy decision into the next message.
///
/// - no actions, or one final action → TASK/FINISHED
/// - exactly one tool action → TOOL message to that tool
/// - anything else (multiple actions, or any delegation) → GROUP/GROUP_ACTIONS
pub fn decision_to_message(agent_name: &str, origin: &Message, actions: Vec<ActionModel>) -> Message {
    let mut headers = origin.headers.forwarded();
    if !headers.extra.contains_key("root_agent_id") {
        headers.extra.insert(
            "root_agent_id".into(),
            serde_json::Value::String(agent_name.to_string()),
        );
    }
    if let Some(id) = actions.iter().find_map(|a| a.tool_call_id.clone()) {
        headers
            .extra
            .entry("root_tool_call_id".to_string())
            .or_insert(serde_json::Value::String(id));
    }
    let session_id = origin.session_id.clone();

    if actions.is_empty() {
        return Message::control(
            Topic::Finished,
            agent_name,
            session_id,
            headers,
            TaskControl {
                reason: Some(format!("agent '{agent_name}' returned no actions")),
                answer: None,
                data: None,
            },
        );
    }

    if actions.len() == 1 && actions[0].is_final() {
        let answer = actions[0].content().unwrap_or_default().to_string();
        return Message::control(
            Topic::Finished,
            agent_name,
            session_id,
            headers,
            TaskControl::finished(answer),
        );
    }

    if actions.len() == 1 && actions[0].is_tool_action() {
        let tool_name = actions[0].tool_name.clone().unwrap_or_default();
        return Message::tool(agent_name, tool_name, session_id, headers, actions)
            .with_caller(agent_name);
    }

    // Multiple simultaneous actions, or a delegation that needs group
    // bookkeeping even when it is the only action.
    Message::group_actions(agent_name, session_id, headers, actions)
}

/// Bus adapter invoking one agent's policy function.
pub struct AgentPolicyHandler {
    name: String,
    agent: Arc<dyn AgentPolicy>,
    bus: Arc<EventBus>,
    state: Arc<ControlState>,
}

impl AgentPolicyHandler {
    /// Wrap an agent capability for bus registration.
    pub fn new(agent: Arc<dyn AgentPolicy>, bus: Arc<EventBus>, state: Arc<ControlState>) -> Self {
        Self {
            name: format!("agent:{}", agent.name()),
            agent,
            bus,
            state,
        }
    }

    fn memory_message(&self, origin: &Message, turn: ConversationTurn) -> Message {
        Message::new(
            MessageCategory::Memory,
            self.agent.name(),
            origin.session_id.clone(),
            origin.headers.forwarded(),
            Payload::Memory(turn),
        )
        .with_receiver(self.agent.name())
    }
}

#[async_trait]
impl BusinessHandler for AgentPolicyHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, message: Message) -> anyhow::Result<Option<Message>> {
        let agent_name = self.agent.name().to_string();
        let observation = extract_observation(&message);

        // Conversational bookkeeping rides the bus as MEMORY messages;
        // emission failures only mean the run is already shutting down.
        if let Some(content) = &observation.content {
            let turn = ConversationTurn::new(
                TurnRole::Human,
                content.clone(),
                Some(agent_name.clone()),
                message.session_id.clone(),
            );
            let _ = self.bus.emit(self.memory_message(&message, turn));
        }

        let info = PolicyInfo {
            task_id: self.state.task_id.clone(),
            session_id: message.session_id.clone(),
            level: message.headers.level,
            usage: self.state.usage.clone(),
            extra: Default::default(),
        };

        let actions = self.agent.policy(&observation, &info, &message).await?;
        tracing::debug!(
            agent = %agent_name,
            action_count = actions.len(),
            level = message.headers.level,
            "policy decision"
        );

        let decision = decision_to_message(&agent_name, &message, actions);

        let ai_content = match &decision.payload {
            Payload::Control(control) => control.answer.clone(),
            Payload::Actions(actions) => serde_json::to_string(actions).ok(),
            _ => None,
        };
        if let Some(content) = ai_content {
            let turn = ConversationTurn::new(
                TurnRole::Ai,
                content,
                Some(agent_name),
                message.session_id.clone(),
            );
            let _ = self.bus.emit(self.memory_message(&message, turn));
        }

        Ok(Some(decision))
    }
}

/// Bus adapter invoking one tool's step function.
pub struct ToolStepHandler {
    name: String,
    tool: Arc<dyn Tool>,
}

impl ToolStepHandler {
    /// Wrap a tool capability for bus registration.
    pub fn new(tool: Arc<dyn Tool>) -> Self {
        Self {
            name: format!("tool:{}", tool.name()),
            tool,
        }
    }
}

#[async_trait]
impl BusinessHandler for ToolStepHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, message: Message) -> anyhow::Result<Option<Message>> {
        let mut result = self.tool.step(&message).await?;

        // Normalize linkage regardless of how the tool built its result:
        // the answer goes back to the caller, stays inside the origin's
        // group, and sits one level deeper than the origin.
        if result.receiver.is_none() {
            result.receiver = message
                .caller
                .clone()
                .or_else(|| Some(message.sender.clone()));
        }
        if result.group_id.is_none() {
            result.group_id = message.group_id.clone();
        }
        if result.headers.level <= message.headers.level {
            let context = result.headers.context.clone();
            result.headers = message.headers.forwarded();
            result.headers.context = context;
        }
        Ok(Some(result))
    }
}

/// Bus adapter exposing a framework handler on a control topic.
///
/// `pre_run` binds the cancel/interrupt topics to the task-control
/// handler through this relay, so in-band control messages dispatch
/// exactly like any business-handled message.
pub struct ControlRelayHandler {
    name: String,
    inner: Arc<dyn FrameworkHandler>,
    bus: Arc<EventBus>,
}

impl ControlRelayHandler {
    /// Expose `inner` under a control-topic binding.
    pub fn new(topic: Topic, inner: Arc<dyn FrameworkHandler>, bus: Arc<EventBus>) -> Self {
        Self {
            name: format!("control:{topic}"),
            inner,
            bus,
        }
    }
}

#[async_trait]
impl BusinessHandler for ControlRelayHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, message: Message) -> anyhow::Result<Option<Message>> {
        if !self.inner.is_valid_message(&message) {
            return Ok(None);
        }
        let follow_ups = self
            .inner
            .handle(&message)
            .await
            .map_err(anyhow::Error::from)?;
        for follow_up in follow_ups {
            let _ = self.bus.emit(follow_up);
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::context::Context;
    use crate::domain::models::message::Headers;
    use serde_json::json;

    fn origin() -> Message {
        Message::agent(
            "seed",
            "researcher",
            "session-1",
            Headers::root("task-1", Context::new()),
            Payload::Observation(Observation::from_content("find the answer")),
        )
    }

    #[test]
    fn test_single_tool_action_dispatches_directly() {
        let decision = decision_to_message(
            "researcher",
            &origin(),
            vec![ActionModel::tool_call("search", None, json!({}), "call-1")],
        );
        assert_eq!(decision.category, MessageCategory::Tool);
        assert_eq!(decision.receiver.as_deref(), Some("search"));
        assert_eq!(decision.caller.as_deref(), Some("researcher"));
        assert_eq!(decision.headers.level, 1);
    }

    #[test]
    fn test_single_handoff_still_goes_through_group() {
        let decision = decision_to_message(
            "researcher",
            &origin(),
            vec![ActionModel::handoff("planner", json!({"content": "plan"}))],
        );
        assert_eq!(decision.category, MessageCategory::Group);
        assert_eq!(decision.topic, Some(Topic::GroupActions));
    }

    #[test]
    fn test_multi_action_decision_fans_out() {
        let decision = decision_to_message(
            "researcher",
            &origin(),
            vec![
                ActionModel::tool_call("search", None, json!({}), "call-1"),
                ActionModel::tool_call("browser", None, json!({}), "call-2"),
            ],
        );
        assert_eq!(decision.category, MessageCategory::Group);
        assert_eq!(
            decision.headers.extra.get("root_tool_call_id"),
            Some(&json!("call-1"))
        );
    }

    #[test]
    fn test_final_action_finishes() {
        let decision =
            decision_to_message("researcher", &origin(), vec![ActionModel::finish("42")]);
        assert_eq!(decision.category, MessageCategory::Task);
        assert_eq!(decision.topic, Some(Topic::Finished));
        match decision.payload {
            Payload::Control(control) => assert_eq!(control.answer.as_deref(), Some("42")),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_extract_observation_from_merged_payload() {
        let mut msg = origin();
        msg.payload = Payload::Merged(vec![
            crate::domain::models::message::SenderSlice {
                sender: "a".into(),
                observation: Observation::from_content("left"),
            },
            crate::domain::models::message::SenderSlice {
                sender: "b".into(),
                observation: Observation::from_results(vec![
                    crate::domain::models::action::ActionResult::ok(None, "right"),
                ]),
            },
        ]);

        let obs = extract_observation(&msg);
        assert_eq!(obs.content.as_deref(), Some("a: left"));
        assert_eq!(obs.action_results.len(), 1);
    }
}

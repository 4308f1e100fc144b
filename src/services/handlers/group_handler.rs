//! Group handler: fan-out / fan-in coordination.
//!
//! GROUP_ACTIONS splits one multi-action decision into parallel branches:
//! tool actions batch into one TOOL message per distinct tool, agent
//! actions each become an independent concurrent sub-invocation with an
//! owned context copy. GROUP_RESULTS fires once every member node is
//! terminal and merges branch outputs back into follow-up messages,
//! preserving member registration order and failing fast on any failed
//! branch. Branch results carrying a group id are absorbed here instead
//! of reaching their receiver directly; the aggregate is what the
//! receiver sees.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::errors::{GroupError, HandlerError};
use crate::domain::models::action::{
    ActionModel, ActionResult, ConversationTurn, Observation, TurnRole,
};
use crate::domain::models::message::{
    Headers, Message, MessageCategory, Payload, SenderSlice, TaskControl, Topic,
};
use crate::domain::models::node::{Group, NodeSpec, NodeStatus, RunNode};
use crate::domain::models::swarm::Swarm;
use crate::domain::ports::{MemorySink, MemoryWriteConfig, PolicyInfo};
use crate::services::business::extract_observation;
use crate::services::event_bus::EventBus;
use crate::services::group_store::GroupStore;
use crate::services::handlers::FrameworkHandler;
use crate::services::node_store::RunNodeStore;
use crate::services::runtime_state::{BackgroundTasks, ControlState};

/// Framework handler for the GROUP category.
pub struct GroupHandler {
    swarm: Swarm,
    bus: Arc<EventBus>,
    nodes: Arc<RunNodeStore>,
    groups: Arc<GroupStore>,
    memory: Arc<dyn MemorySink>,
    state: Arc<ControlState>,
    background: BackgroundTasks,
    node_wait_timeout: Duration,
}

enum BranchPlan {
    Tool { name: String, actions: Vec<ActionModel> },
    Agent { action: ActionModel },
}

impl GroupHandler {
    /// Wire the handler to one run's coordination state.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        swarm: Swarm,
        bus: Arc<EventBus>,
        nodes: Arc<RunNodeStore>,
        groups: Arc<GroupStore>,
        memory: Arc<dyn MemorySink>,
        state: Arc<ControlState>,
        background: BackgroundTasks,
        node_wait_timeout: Duration,
    ) -> Self {
        Self {
            swarm,
            bus,
            nodes,
            groups,
            memory,
            state,
            background,
            node_wait_timeout,
        }
    }

    /// Partition an action list into branch plans, preserving original
    /// order. Tool actions collapse into one plan per distinct tool (at
    /// the tool's first position); agent actions each get their own plan.
    fn plan_branches(actions: &[ActionModel]) -> Vec<BranchPlan> {
        let mut plans: Vec<BranchPlan> = Vec::new();
        for action in actions {
            if action.is_tool_action() {
                let name = action.tool_name.clone().unwrap_or_default();
                let existing = plans.iter().position(
                    |p| matches!(p, BranchPlan::Tool { name: n, .. } if *n == name),
                );
                match existing {
                    Some(i) => {
                        if let BranchPlan::Tool { actions, .. } = &mut plans[i] {
                            actions.push(action.clone());
                        }
                    }
                    None => plans.push(BranchPlan::Tool {
                        name,
                        actions: vec![action.clone()],
                    }),
                }
            } else if action.is_agent_action() {
                plans.push(BranchPlan::Agent {
                    action: action.clone(),
                });
            } else {
                tracing::warn!("final action inside a fan-out decision; ignored");
            }
        }
        plans
    }

    async fn fan_out(&self, message: &Message) -> Result<Vec<Message>, HandlerError> {
        let Payload::Actions(actions) = &message.payload else {
            return Err(HandlerError::new(
                self.name(),
                "group_actions message without an action list",
            ));
        };

        let group_id = Uuid::new_v4().to_string();
        let mut base = message.headers.forwarded();
        base.parent_group_id = Some(group_id.clone());
        base.extra.insert(
            "group_sender".into(),
            serde_json::Value::String(message.sender.clone()),
        );

        let plans = Self::plan_branches(actions);
        let mut member_ids = Vec::with_capacity(plans.len());
        let mut tool_messages = Vec::new();
        let mut agent_branches = Vec::new();

        for plan in plans {
            // Each branch owns a deep copy of the context; branches must
            // never share mutable per-call state.
            let mut headers = base.clone();
            headers.context = message.headers.context.child();

            match plan {
                BranchPlan::Tool { name, actions } => {
                    let tool_msg = Message::tool(
                        message.sender.clone(),
                        name.clone(),
                        message.session_id.clone(),
                        headers,
                        actions,
                    )
                    .with_caller(message.sender.clone())
                    .with_group_id(group_id.clone());
                    let node_id = tool_msg.id.to_string();

                    // Pre-create the node so the waiter can subscribe before
                    // the runner dispatches the emitted message.
                    self.nodes
                        .create_node(
                            NodeSpec::new(
                                node_id.clone(),
                                MessageCategory::Tool,
                                name,
                                message.session_id.clone(),
                            )
                            .with_task_id(self.state.task_id.clone())
                            .with_group_id(group_id.clone())
                            .with_msg_from(message.sender.clone())
                            .with_metadata(
                                "group_sender",
                                serde_json::Value::String(message.sender.clone()),
                            ),
                        )
                        .await;
                    member_ids.push(node_id);
                    tool_messages.push(tool_msg);
                }
                BranchPlan::Agent { action } => {
                    let agent_name = action.agent_name.clone().unwrap_or_default();
                    let observation = Observation::from_content(
                        action
                            .content()
                            .map(str::to_string)
                            .unwrap_or_else(|| action.params.to_string()),
                    );
                    let branch_msg = Message::agent(
                        message.sender.clone(),
                        agent_name.clone(),
                        message.session_id.clone(),
                        headers,
                        Payload::Observation(observation),
                    )
                    .with_caller(message.sender.clone())
                    .with_group_id(group_id.clone());
                    let node_id = branch_msg.id.to_string();

                    self.nodes
                        .create_node(
                            NodeSpec::new(
                                node_id.clone(),
                                MessageCategory::Agent,
                                agent_name,
                                message.session_id.clone(),
                            )
                            .with_task_id(self.state.task_id.clone())
                            .with_group_id(group_id.clone())
                            .with_msg_from(message.sender.clone())
                            .with_metadata(
                                "group_sender",
                                serde_json::Value::String(message.sender.clone()),
                            ),
                        )
                        .await;
                    member_ids.push(node_id);
                    agent_branches.push((branch_msg, action));
                }
            }
        }

        if member_ids.is_empty() {
            return Err(HandlerError::new(
                self.name(),
                "group_actions produced no dispatchable branches",
            ));
        }

        let group = Group::new(
            group_id.clone(),
            message.session_id.clone(),
            message.sender.clone(),
            member_ids.clone(),
            message.headers.clone(),
        );
        self.groups.create(group.clone()).await;
        tracing::info!(
            group_id = %group_id,
            members = member_ids.len(),
            sender = %message.sender,
            "fan-out"
        );

        // Agent sub-invocations run to completion in parallel, each as an
        // independently tracked background unit.
        for (branch_msg, action) in agent_branches {
            let swarm = self.swarm.clone();
            let nodes = self.nodes.clone();
            let state = self.state.clone();
            let group_sender = message.sender.clone();
            self.background
                .spawn(async move {
                    run_agent_branch(swarm, nodes, state, branch_msg, action, group_sender).await;
                })
                .await;
        }

        // The waiter turns "all members terminal" into GROUP_RESULTS:
        // every branch is awaited together, then completions are
        // recorded in registration order.
        {
            let nodes = self.nodes.clone();
            let groups = self.groups.clone();
            let bus = self.bus.clone();
            let timeout = self.node_wait_timeout;
            let members = member_ids;
            let gid = group_id;
            self.background
                .spawn(async move {
                    let waits = members.iter().map(|member| {
                        let nodes = nodes.clone();
                        let gid = gid.clone();
                        async move {
                            if let Err(e) =
                                nodes.wait_for_completion(member, Some(timeout)).await
                            {
                                tracing::warn!(
                                    group_id = %gid,
                                    node_id = %member,
                                    error = %e,
                                    "group member wait failed; marking branch failed"
                                );
                                nodes.run_failed(member).await;
                            }
                        }
                    });
                    futures::future::join_all(waits).await;

                    for member in &members {
                        if let Some(finished) = groups.mark_member_done(&gid, member).await {
                            let results_msg = Message::group_results(
                                gid.clone(),
                                finished.sender.clone(),
                                finished.session_id.clone(),
                                finished.headers.forwarded(),
                            );
                            if bus.emit(results_msg).is_err() {
                                tracing::warn!(group_id = %gid, "bus closed before group results");
                            }
                        }
                    }
                })
                .await;
        }

        // Tool messages dispatch immediately via the bus.
        Ok(tool_messages)
    }

    async fn aggregate(&self, message: &Message) -> Result<Vec<Message>, HandlerError> {
        let Some(group_id) = message.group_id.clone() else {
            return Err(HandlerError::new(
                self.name(),
                "group_results message without a group id",
            ));
        };

        let group = match self.groups.retire(&group_id).await {
            Ok(group) => group,
            Err(GroupError::Retired(_)) => {
                tracing::warn!(group_id = %group_id, "group already aggregated; ignoring");
                return Ok(Vec::new());
            }
            Err(e) => return Err(HandlerError::new(self.name(), e.to_string())),
        };

        // Member results in registration order, independent of completion
        // order, so aggregate content replays deterministically.
        let mut members: Vec<RunNode> = Vec::with_capacity(group.node_ids.len());
        for node_id in &group.node_ids {
            let node = self.nodes.find_node(node_id).await;
            let failed = match &node {
                Some(node) => {
                    node.status == NodeStatus::Failed || node.result_message().is_none()
                }
                None => true,
            };
            if failed {
                // Fail-fast: one unrecoverable branch fails the whole
                // group; no aggregate is ever emitted for it.
                let busi = node.as_ref().map(|n| n.busi_id.clone()).unwrap_or_default();
                let reason = format!("group {group_id} branch {node_id} ({busi}) failed");
                tracing::warn!(group_id = %group_id, node_id = %node_id, "group fail-fast");
                return Ok(vec![Message::control(
                    Topic::Error,
                    self.name(),
                    group.session_id.clone(),
                    group.headers.forwarded(),
                    TaskControl::reason(reason),
                )]);
            }
            members.push(node.expect("checked above"));
        }

        let mut root_results: Vec<ActionResult> = Vec::new();
        let mut agent_texts: Vec<(String, String)> = Vec::new();
        let mut other_buckets: Vec<(String, Vec<Message>)> = Vec::new();
        let mut merged_context = group.headers.context.clone();

        for node in &members {
            let result = node.result_message().expect("checked above").clone();
            merged_context.merge(&result.headers.context);

            let receiver = result
                .receiver
                .clone()
                .unwrap_or_else(|| group.sender.clone());
            if receiver == group.sender {
                match (&node.busi_type, &result.payload) {
                    (MessageCategory::Tool, Payload::Observation(obs)) => {
                        // Combined ActionResult list keeps per-branch
                        // tool_call_id linkage intact.
                        root_results.extend(obs.action_results.iter().cloned());
                    }
                    (_, payload) => {
                        let text = match payload {
                            Payload::Observation(obs) => obs.content.clone().unwrap_or_default(),
                            other => serde_json::to_string(other).unwrap_or_default(),
                        };
                        agent_texts.push((result.sender.clone(), text));
                    }
                }
            } else {
                match other_buckets.iter().position(|(r, _)| *r == receiver) {
                    Some(i) => other_buckets[i].1.push(result),
                    None => other_buckets.push((receiver, vec![result])),
                }
            }
        }

        if !agent_texts.is_empty() {
            // Agent branch outputs concatenate into one synthetic result,
            // tagged with the root caller's tool_call_id for correlation.
            let mut combined = serde_json::Map::new();
            for (sender, text) in &agent_texts {
                combined.insert(sender.clone(), serde_json::Value::String(text.clone()));
            }
            let root_tool_call_id = group
                .headers
                .extra
                .get("root_tool_call_id")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            root_results.push(ActionResult {
                tool_call_id: root_tool_call_id,
                content: serde_json::Value::Object(combined).to_string(),
                success: true,
                error: None,
            });
        }

        self.state.merge_context(&merged_context).await;

        let mut follow_ups = Vec::new();
        if !root_results.is_empty() {
            // Memory first: the receiver's next policy invocation must
            // already see these turns when the aggregate arrives.
            let config = MemoryWriteConfig {
                task_id: Some(self.state.task_id.clone()),
            };
            for result in &root_results {
                let mut turn = ConversationTurn::new(
                    TurnRole::Tool,
                    result.content.clone(),
                    Some(group.sender.clone()),
                    group.session_id.clone(),
                );
                if let Some(id) = &result.tool_call_id {
                    turn = turn.with_tool_call_id(id.clone());
                }
                if let Err(e) = self.memory.add(turn, &config).await {
                    tracing::warn!(group_id = %group_id, error = %e, "aggregate memory write failed; continuing");
                }
            }

            let mut headers = group.headers.forwarded();
            headers.context = merged_context.clone();
            headers.parent_group_id = group.parent_group_id.clone();
            follow_ups.push(Message::agent(
                self.name(),
                group.sender.clone(),
                group.session_id.clone(),
                headers,
                Payload::Observation(Observation::from_results(root_results)),
            ));
        }

        for (receiver, mut results) in other_buckets {
            if results.len() == 1 {
                // Cross-handoff discovered mid-group: delivered as-is,
                // outside the retired group.
                let mut msg = results.pop().expect("len checked");
                msg.group_id = None;
                msg.headers.parent_group_id = group.parent_group_id.clone();
                follow_ups.push(msg);
            } else {
                let mut context = group.headers.context.clone();
                let slices: Vec<SenderSlice> = results
                    .iter()
                    .map(|m| {
                        context.merge(&m.headers.context);
                        SenderSlice {
                            sender: m.sender.clone(),
                            observation: extract_observation(m),
                        }
                    })
                    .collect();
                let mut headers = group.headers.forwarded();
                headers.context = context;
                headers.parent_group_id = group.parent_group_id.clone();
                follow_ups.push(Message::agent(
                    self.name(),
                    receiver,
                    group.session_id.clone(),
                    headers,
                    Payload::Merged(slices),
                ));
            }
        }

        tracing::info!(
            group_id = %group_id,
            follow_ups = follow_ups.len(),
            "group aggregated"
        );
        Ok(follow_ups)
    }
}

/// One agent sub-invocation: an independent branch with its own context
/// copy, recorded against the member node when it completes.
async fn run_agent_branch(
    swarm: Swarm,
    nodes: Arc<RunNodeStore>,
    state: Arc<ControlState>,
    branch_msg: Message,
    action: ActionModel,
    group_sender: String,
) {
    let node_id = branch_msg.id.to_string();
    let agent_name = branch_msg.receiver.clone().unwrap_or_default();
    nodes.run_node(&node_id).await;

    let Some(agent) = swarm.agent(&agent_name) else {
        tracing::warn!(agent = %agent_name, "group branch references unknown agent");
        nodes
            .save_handle_result("group_branch", &node_id, None, false)
            .await;
        return;
    };

    let observation = extract_observation(&branch_msg);
    let info = PolicyInfo {
        task_id: state.task_id.clone(),
        session_id: branch_msg.session_id.clone(),
        level: branch_msg.headers.level,
        usage: state.usage.clone(),
        extra: Default::default(),
    };

    match agent.policy(&observation, &info, &branch_msg).await {
        Ok(actions) => {
            let result =
                branch_result_message(&agent_name, &branch_msg, actions, &action, &group_sender);
            nodes
                .save_handle_result(&format!("agent:{agent_name}"), &node_id, Some(result), true)
                .await;
        }
        Err(e) => {
            tracing::warn!(agent = %agent_name, node_id = %node_id, error = %e, "group branch failed");
            nodes
                .save_handle_result(&format!("agent:{agent_name}"), &node_id, None, false)
                .await;
        }
    }
}

/// Shape a branch's policy output into its terminal result message.
///
/// A lone handoff to a third party becomes a cross-handoff result
/// addressed to that receiver; everything else is a textual result
/// addressed back to the group sender, tagged with the originating
/// action's tool_call_id.
fn branch_result_message(
    agent_name: &str,
    branch_msg: &Message,
    actions: Vec<ActionModel>,
    origin_action: &ActionModel,
    group_sender: &str,
) -> Message {
    let headers: Headers = branch_msg.headers.forwarded();

    if actions.len() == 1 && actions[0].is_agent_action() {
        let target = actions[0].agent_name.clone().unwrap_or_default();
        if target != group_sender {
            return Message::agent(
                agent_name,
                target,
                branch_msg.session_id.clone(),
                headers,
                Payload::Actions(actions),
            );
        }
    }

    let content = if actions.len() == 1 && actions[0].is_final() {
        actions[0].content().unwrap_or_default().to_string()
    } else {
        serde_json::to_string(&actions).unwrap_or_default()
    };

    let result = ActionResult {
        tool_call_id: origin_action.tool_call_id.clone(),
        content: content.clone(),
        success: true,
        error: None,
    };
    Message::agent(
        agent_name,
        group_sender,
        branch_msg.session_id.clone(),
        headers,
        Payload::Observation(Observation {
            content: Some(content),
            action_results: vec![result],
        }),
    )
}

#[async_trait]
impl FrameworkHandler for GroupHandler {
    fn name(&self) -> &'static str {
        "group_handler"
    }

    fn is_valid_message(&self, message: &Message) -> bool {
        match message.topic {
            Some(Topic::GroupActions) | Some(Topic::GroupResults) => {
                message.category == MessageCategory::Group
            }
            // A branch result still inside a group is absorbed here; its
            // content reaches the receiver only through the aggregate.
            None => message.group_id.is_some() && message.category != MessageCategory::Group,
            _ => false,
        }
    }

    async fn handle(&self, message: &Message) -> Result<Vec<Message>, HandlerError> {
        match message.topic {
            Some(Topic::GroupActions) => self.fan_out(message).await,
            Some(Topic::GroupResults) => self.aggregate(message).await,
            _ => {
                tracing::debug!(
                    message_id = %message.id,
                    group_id = ?message.group_id,
                    "branch result absorbed pending aggregation"
                );
                Ok(Vec::new())
            }
        }
    }
}

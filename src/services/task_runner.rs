//! Task runner: the event-driven execution engine.
//!
//! One runner per task. `pre_run` validates the swarm, registers agent
//! and tool handlers into the bus, binds the cancel/interrupt control
//! topics, and builds the seed messages. `run` emits the seeds and drives
//! the consume-dispatch loop: every iteration reads external status,
//! checks the wall-clock budget, and dispatches the next message onto
//! tracked background units. Handler failures become in-band TASK/ERROR
//! messages; exceptions never escape the loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::errors::RuntimeError;
use crate::domain::models::action::{ActionModel, Observation};
use crate::domain::models::message::{
    Headers, Message, MessageCategory, Payload, TaskControl, Topic,
};
use crate::domain::models::node::NodeSpec;
use crate::domain::models::task::{RunConf, Task, TaskResponse, TaskRuntimeStatus};
use crate::domain::ports::{
    CheckpointSink, MemorySink, NullCheckpointSink, NullMemorySink, NullOutputSink, OutputSink,
};
use crate::services::business::{AgentPolicyHandler, ControlRelayHandler, ToolStepHandler};
use crate::services::config::RunnerConfig;
use crate::services::event_bus::EventBus;
use crate::services::group_store::GroupStore;
use crate::services::handlers::{
    BackgroundTaskHandler, FrameworkHandler, GroupHandler, MemoryHandler, OutputHandler,
    TaskControlHandler,
};
use crate::services::loop_detector::LoopDetector;
use crate::services::node_store::RunNodeStore;
use crate::services::runtime_state::{BackgroundTasks, ControlState};
use crate::services::status_store::TaskStatusStore;

/// Event-loop driver for one task.
pub struct TaskRunner {
    task: Task,
    conf: RunConf,
    runner_conf: RunnerConfig,
    bus: Arc<EventBus>,
    nodes: Arc<RunNodeStore>,
    groups: Arc<GroupStore>,
    status: TaskStatusStore,
    memory: Arc<dyn MemorySink>,
    checkpoints: Arc<dyn CheckpointSink>,
    output: Arc<dyn OutputSink>,
    state: Arc<ControlState>,
    background: BackgroundTasks,
    handlers: Vec<Arc<dyn FrameworkHandler>>,
    detector: Mutex<LoopDetector>,
    steps: AtomicU64,
    prepared: bool,
}

impl TaskRunner {
    /// Create a runner for one task, sharing the external status store.
    pub fn new(task: Task, status: TaskStatusStore) -> Self {
        let conf = task.conf.clone();
        let state = ControlState::new(
            task.id.clone(),
            task.session_id.clone(),
            task.is_sub_task,
            task.context.clone(),
        );
        let detector = Mutex::new(LoopDetector::new(conf.loop_detection.clone()));
        Self {
            task,
            conf,
            runner_conf: RunnerConfig::default(),
            bus: EventBus::shared(),
            nodes: Arc::new(RunNodeStore::new()),
            groups: GroupStore::shared(),
            status,
            memory: Arc::new(NullMemorySink),
            checkpoints: Arc::new(NullCheckpointSink),
            output: Arc::new(NullOutputSink),
            state,
            background: BackgroundTasks::new(),
            handlers: Vec::new(),
            detector,
            steps: AtomicU64::new(0),
            prepared: false,
        }
    }

    /// Use a memory backend.
    pub fn with_memory(mut self, memory: Arc<dyn MemorySink>) -> Self {
        self.memory = memory;
        self
    }

    /// Use a checkpoint backend.
    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointSink>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    /// Use an output stream.
    pub fn with_output(mut self, output: Arc<dyn OutputSink>) -> Self {
        self.output = output;
        self
    }

    /// Override the runner loop knobs.
    pub fn with_runner_conf(mut self, runner_conf: RunnerConfig) -> Self {
        self.runner_conf = runner_conf;
        self
    }

    /// The run's node store (trajectory, RPC-style waits).
    pub fn nodes(&self) -> Arc<RunNodeStore> {
        self.nodes.clone()
    }

    /// The run's bus.
    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Request a stop; observed at the top of the next loop iteration.
    pub fn stop(&self) {
        self.state.stop();
    }

    /// Validate the swarm, register handlers, and build seed messages.
    pub async fn pre_run(&mut self) -> Result<(), RuntimeError> {
        if self.prepared {
            return Ok(());
        }
        self.task.swarm.validate().await?;

        // Business handlers: one per agent and tool capability.
        for (name, agent) in self.task.swarm.agents() {
            self.bus
                .register(
                    MessageCategory::Agent,
                    name.clone(),
                    Arc::new(AgentPolicyHandler::new(
                        agent.clone(),
                        self.bus.clone(),
                        self.state.clone(),
                    )),
                )
                .await;
        }
        for (name, tool) in self.task.swarm.tools().await {
            self.bus
                .register(
                    MessageCategory::Tool,
                    name,
                    Arc::new(ToolStepHandler::new(tool)),
                )
                .await;
        }

        // Framework chain, in dispatch order.
        let task_handler = Arc::new(TaskControlHandler::new(
            self.state.clone(),
            self.status.clone(),
            self.checkpoints.clone(),
            self.task.swarm.clone(),
            self.bus.clone(),
        ));
        let group_handler = Arc::new(GroupHandler::new(
            self.task.swarm.clone(),
            self.bus.clone(),
            self.nodes.clone(),
            self.groups.clone(),
            self.memory.clone(),
            self.state.clone(),
            self.background.clone(),
            Duration::from_millis(self.conf.node_wait_timeout_ms),
        ));
        self.handlers = vec![
            task_handler.clone(),
            group_handler,
            Arc::new(MemoryHandler::new(
                self.memory.clone(),
                self.task.id.clone(),
            )),
            Arc::new(BackgroundTaskHandler::new(
                self.state.clone(),
                self.memory.clone(),
                self.checkpoints.clone(),
                self.task.swarm.clone(),
            )),
            Arc::new(OutputHandler::new(self.output.clone())),
        ];

        // Cancel/interrupt arrive in-band as well as via the status
        // store; bind both topics so they dispatch like any business
        // message.
        for topic in [Topic::Cancel, Topic::Interrupt] {
            self.bus
                .register(
                    MessageCategory::Task,
                    topic.as_str(),
                    Arc::new(ControlRelayHandler::new(
                        topic,
                        task_handler.clone(),
                        self.bus.clone(),
                    )),
                )
                .await;
        }

        // Seed messages: one per entry agent, or one per distinct entry
        // tool for tool-oriented tasks.
        let headers = Headers::root(self.task.id.clone(), self.task.context.clone());
        let mut seeds = Vec::new();
        if self.task.swarm.is_tool_oriented() {
            let mut seen = std::collections::HashSet::new();
            for tool in self.task.swarm.entry_tools() {
                if !seen.insert(tool.clone()) {
                    continue;
                }
                seeds.push(Message::tool(
                    "runner",
                    tool.clone(),
                    self.task.session_id.clone(),
                    headers.clone(),
                    vec![ActionModel::tool_call(
                        tool.clone(),
                        None,
                        serde_json::json!({ "content": self.task.input.clone() }),
                        Uuid::new_v4().to_string(),
                    )],
                ));
            }
        } else {
            for agent in self.task.swarm.entry_agents() {
                seeds.push(Message::agent(
                    "runner",
                    agent.clone(),
                    self.task.session_id.clone(),
                    headers.clone(),
                    Payload::Observation(Observation::from_content(self.task.input.clone())),
                ));
            }
        }
        if seeds.is_empty() {
            return Err(RuntimeError::NoSeedMessages);
        }
        self.state.set_seeds(seeds).await;

        self.status
            .register(self.task.id.clone(), TaskRuntimeStatus::Init)
            .await;
        self.prepared = true;
        tracing::info!(task_id = %self.task.id, "pre_run complete");
        Ok(())
    }

    /// Execute the task to completion and assemble its response.
    pub async fn run(&mut self) -> Result<TaskResponse, RuntimeError> {
        self.pre_run().await?;
        let seeds = self.state.seeds().await;
        if seeds.is_empty() {
            return Err(RuntimeError::NoSeedMessages);
        }

        let start = Instant::now();
        self.status
            .set_status(&self.task.id, TaskRuntimeStatus::Running, None)
            .await;
        for seed in seeds {
            self.bus.emit(seed)?;
        }

        self.run_loop(start).await;

        // Shutdown: drain tracked background work, then assemble the
        // response from the slot and the run's state.
        self.background
            .shutdown(Duration::from_millis(self.runner_conf.drain_timeout_ms))
            .await;

        let mut response = match self.state.take_response().await {
            Some(response) => response,
            None => TaskResponse::terminal(
                self.task.id.clone(),
                TaskRuntimeStatus::Failed,
                "runner exited without a terminal response",
            ),
        };
        response.time_cost_ms = start.elapsed().as_millis() as u64;
        let context = self.state.context_snapshot().await;
        let mut usage = self.state.usage.snapshot().await;
        usage.add(context.usage());
        response.usage = usage;
        response.trajectory = Some(self.nodes.trajectory().await);
        response.context = Some(context);

        self.status
            .set_status(&self.task.id, response.status, response.msg.clone())
            .await;

        if !self.task.is_sub_task {
            if let Err(e) = self.output.mark_completed().await {
                tracing::warn!(task_id = %self.task.id, error = %e, "output completion failed");
            }
        }

        tracing::info!(
            task_id = %self.task.id,
            status = response.status.as_str(),
            time_cost_ms = response.time_cost_ms,
            "run finished"
        );
        Ok(response)
    }

    async fn run_loop(&self, start: Instant) {
        let poll = Duration::from_millis(self.runner_conf.poll_interval_ms.max(1));
        loop {
            // External control plane, polled every iteration.
            if let Some(entry) = self.status.get(&self.task.id).await {
                match entry.status {
                    TaskRuntimeStatus::Cancelled | TaskRuntimeStatus::Interrupted => {
                        let reason = entry
                            .reason
                            .clone()
                            .unwrap_or_else(|| entry.status.as_str().to_string());
                        self.state.checkpoint_once(&self.checkpoints, &reason).await;
                        self.state
                            .offer_response(TaskResponse::terminal(
                                self.task.id.clone(),
                                entry.status,
                                reason,
                            ))
                            .await;
                        self.state.stop();
                    }
                    _ => {}
                }
            }

            // Wall-clock budget, computed each iteration.
            if self.conf.timeout_ms > 0
                && start.elapsed() >= Duration::from_millis(self.conf.timeout_ms)
                && !self.state.is_stopped()
            {
                let reason = format!("timeout after {}ms", self.conf.timeout_ms);
                tracing::warn!(task_id = %self.task.id, %reason, "task timed out");
                self.status.cancel(&self.task.id, reason.clone()).await;
                self.state.checkpoint_once(&self.checkpoints, &reason).await;
                self.state
                    .offer_response(TaskResponse::terminal(
                        self.task.id.clone(),
                        TaskRuntimeStatus::Cancelled,
                        reason,
                    ))
                    .await;
                self.state.stop();
            }

            if self.state.is_stopped() {
                let headers = Headers::root(self.task.id.clone(), Default::default());
                let _ = self.bus.emit(Message::control(
                    Topic::Done,
                    "runner",
                    self.task.session_id.clone(),
                    headers,
                    TaskControl::default(),
                ));
                break;
            }

            tokio::select! {
                consumed = self.bus.consume() => match consumed {
                    Ok(message) => self.dispatch(message).await,
                    Err(_) => self.state.stop(),
                },
                _ = self.state.stopped_wait() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Dispatch one consumed message onto background units.
    async fn dispatch(&self, message: Message) {
        let message = self.bus.transform(message).await;

        // Stream handlers mirror in parallel with normal handling.
        for handler in self.handlers.iter().filter(|h| h.is_stream_handler()) {
            if handler.is_valid_message(&message) {
                let handler = handler.clone();
                let mirrored = message.clone();
                self.background
                    .spawn(async move {
                        if let Err(e) = handler.handle(&mirrored).await {
                            tracing::warn!(error = %e, "stream handler failed");
                        }
                    })
                    .await;
            }
        }

        // Endless-loop guard over agent invocations.
        if message.category == MessageCategory::Agent {
            if let Some(receiver) = &message.receiver {
                let signal = self.detector.lock().await.record(receiver);
                if let Some(signal) = signal {
                    tracing::warn!(task_id = %self.task.id, "{}", signal.describe());
                    let _ = self.bus.emit(Message::control(
                        Topic::Error,
                        "runner",
                        message.session_id.clone(),
                        message.headers.forwarded(),
                        TaskControl::reason(signal.describe()),
                    ));
                    return;
                }
            }
        }

        // Step budget.
        let step = self.steps.fetch_add(1, Ordering::SeqCst) + 1;
        if self.conf.max_steps > 0 && step > self.conf.max_steps {
            self.status
                .cancel(&self.task.id, format!("max steps ({}) exceeded", self.conf.max_steps))
                .await;
            return;
        }

        let business = self.bus.handlers_for(&message).await;
        if business.is_empty() && message.routing_key().is_none() {
            // Unroutable and unclaimed by any topic or receiver binding:
            // still run the framework chain so nothing is silently
            // dropped, but say so.
            tracing::warn!(
                message_id = %message.id,
                category = %message.category,
                "message has neither topic nor receiver"
            );
        }

        let node_id = message.id.to_string();
        let busi_id = message
            .receiver
            .clone()
            .unwrap_or_else(|| message.sender.clone());
        let mut spec = NodeSpec::new(
            node_id.clone(),
            message.category,
            busi_id,
            message.session_id.clone(),
        )
        .with_task_id(self.task.id.clone())
        .with_msg_from(message.sender.clone())
        .with_handler_count(business.len().max(1));
        if let Some(group_id) = &message.group_id {
            spec = spec.with_group_id(group_id.clone());
        }
        self.nodes.create_node(spec).await;
        self.nodes.run_node(&node_id).await;

        if business.is_empty() {
            // Raw path: the framework chain is the no-handler fallback.
            let chain = self.handlers.clone();
            let bus = self.bus.clone();
            let nodes = self.nodes.clone();
            let msg = message;
            self.background
                .spawn(async move {
                    let claimed = framework_chain(&chain, &bus, &msg, false).await;
                    if !claimed {
                        tracing::debug!(
                            message_id = %msg.id,
                            category = %msg.category,
                            "no handler claimed message; logged and mirrored only"
                        );
                    }
                    nodes
                        .save_handle_result("framework", &msg.id.to_string(), None, true)
                        .await;
                })
                .await;
            return;
        }

        // Each business handler runs as an independent background unit;
        // its produced message passes through the framework chain before
        // re-emission.
        for handler in business {
            let chain = self.handlers.clone();
            let bus = self.bus.clone();
            let nodes = self.nodes.clone();
            let msg = message.clone();
            let node_id = node_id.clone();
            self.background
                .spawn(async move {
                    let handler_name = handler.name().to_string();
                    match handler.call(msg.clone()).await {
                        Ok(Some(produced)) => {
                            framework_chain(&chain, &bus, &produced, true).await;
                            nodes
                                .save_handle_result(&handler_name, &node_id, Some(produced), true)
                                .await;
                        }
                        Ok(None) => {
                            nodes
                                .save_handle_result(&handler_name, &node_id, None, true)
                                .await;
                        }
                        Err(e) => {
                            // Handler failure never escapes: it becomes an
                            // in-band TASK/ERROR message for the task handler.
                            tracing::warn!(handler = %handler_name, error = %e, "business handler failed");
                            nodes
                                .save_handle_result(&handler_name, &node_id, None, false)
                                .await;
                            let _ = bus.emit(Message::control(
                                Topic::Error,
                                handler_name.clone(),
                                msg.session_id.clone(),
                                msg.headers.forwarded(),
                                TaskControl::reason(format!(
                                    "handler '{handler_name}' failed: {e}"
                                )),
                            ));
                        }
                    }
                })
                .await;
        }
    }
}

/// Run one message through the framework chain.
///
/// Returns whether any non-stream handler claimed it. Unclaimed messages
/// are re-emitted when `reemit_unclaimed` is set (business handler
/// output on its way back to the bus); otherwise the caller owns the
/// no-handler fallback.
async fn framework_chain(
    handlers: &[Arc<dyn FrameworkHandler>],
    bus: &Arc<EventBus>,
    message: &Message,
    reemit_unclaimed: bool,
) -> bool {
    let mut claimed = false;
    for handler in handlers.iter().filter(|h| !h.is_stream_handler()) {
        if !handler.is_valid_message(message) {
            continue;
        }
        claimed = true;
        match handler.handle(message).await {
            Ok(follow_ups) => {
                for follow_up in follow_ups {
                    if bus.emit(follow_up).is_err() {
                        tracing::warn!("bus closed while emitting follow-ups");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(handler = e.handler.as_str(), error = %e, "framework handler failed");
                let _ = bus.emit(Message::control(
                    Topic::Error,
                    e.handler.clone(),
                    message.session_id.clone(),
                    message.headers.forwarded(),
                    TaskControl::reason(e.to_string()),
                ));
            }
        }
    }
    if !claimed && reemit_unclaimed {
        let _ = bus.emit(message.clone());
    }
    claimed
}

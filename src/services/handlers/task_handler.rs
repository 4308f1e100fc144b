//! Task-control handler: interprets TASK-topic messages.
//!
//! Every terminal topic converges on the same path: build the terminal
//! response, offer it to the run's response slot (first offer wins),
//! converge the external status store, request stop, and yield a
//! TASK_RESPONSE message for the output stream. Cancel, interrupt, and
//! timeout additionally take the pre-stop checkpoint.

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::errors::HandlerError;
use crate::domain::models::message::{
    Message, MessageCategory, Payload, TaskControl, Topic,
};
use crate::domain::models::swarm::Swarm;
use crate::domain::models::task::{TaskResponse, TaskRuntimeStatus};
use crate::domain::ports::CheckpointSink;
use crate::services::business::ToolStepHandler;
use crate::services::event_bus::EventBus;
use crate::services::handlers::FrameworkHandler;
use crate::services::runtime_state::ControlState;
use crate::services::status_store::TaskStatusStore;

/// Framework handler for the TASK category.
pub struct TaskControlHandler {
    state: Arc<ControlState>,
    status: TaskStatusStore,
    checkpoints: Arc<dyn CheckpointSink>,
    swarm: Swarm,
    bus: Arc<EventBus>,
}

impl TaskControlHandler {
    /// Wire the handler to one run's control plane.
    pub fn new(
        state: Arc<ControlState>,
        status: TaskStatusStore,
        checkpoints: Arc<dyn CheckpointSink>,
        swarm: Swarm,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            state,
            status,
            checkpoints,
            swarm,
            bus,
        }
    }

    fn response_message(&self, origin: &Message, response: &TaskResponse) -> Message {
        Message::new(
            MessageCategory::Output,
            "task_handler",
            origin.session_id.clone(),
            origin.headers.forwarded(),
            Payload::Raw(serde_json::to_value(response).unwrap_or_default()),
        )
        .with_topic(Topic::TaskResponse)
    }

    fn control_of(message: &Message) -> TaskControl {
        match &message.payload {
            Payload::Control(control) => control.clone(),
            _ => TaskControl::default(),
        }
    }

    /// Terminate with a status, converging response slot, status store,
    /// and stop signal.
    async fn terminate(
        &self,
        origin: &Message,
        status: TaskRuntimeStatus,
        answer: Option<String>,
        msg: Option<String>,
    ) -> Vec<Message> {
        let response = match status {
            TaskRuntimeStatus::Success => {
                let mut r = TaskResponse::succeeded(self.state.task_id.clone(), answer);
                r.msg = msg.clone();
                r
            }
            other => TaskResponse::terminal(
                self.state.task_id.clone(),
                other,
                msg.clone().unwrap_or_else(|| other.as_str().to_string()),
            ),
        };

        self.status
            .set_status(&self.state.task_id, status, msg)
            .await;
        let offered = self.state.offer_response(response.clone()).await;
        self.state.stop();

        if offered {
            tracing::info!(
                task_id = %self.state.task_id,
                status = status.as_str(),
                "task terminal"
            );
            vec![self.response_message(origin, &response)]
        } else {
            // A terminal response already exists; this path only confirms
            // the stop request.
            Vec::new()
        }
    }

    async fn subscribe_tool(&self, message: &Message) -> Result<Vec<Message>, HandlerError> {
        let control = Self::control_of(message);
        let tool_name = control
            .data
            .as_ref()
            .and_then(|d| d.get("tool_name"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                HandlerError::new(self.name(), "subscribe_tool message missing tool_name")
            })?;

        let Some(tool) = self.swarm.tool(tool_name).await else {
            return Err(HandlerError::new(
                self.name(),
                format!("subscribe_tool: tool '{tool_name}' not in catalog"),
            ));
        };

        self.bus
            .register(
                MessageCategory::Tool,
                tool_name,
                Arc::new(ToolStepHandler::new(tool)),
            )
            .await;
        tracing::info!(tool = tool_name, "tool subscribed at runtime");
        Ok(Vec::new())
    }
}

#[async_trait]
impl FrameworkHandler for TaskControlHandler {
    fn name(&self) -> &'static str {
        "task_handler"
    }

    fn is_valid_message(&self, message: &Message) -> bool {
        message.category == MessageCategory::Task && message.topic.is_some()
    }

    async fn handle(&self, message: &Message) -> Result<Vec<Message>, HandlerError> {
        let control = Self::control_of(message);
        match message.topic {
            Some(Topic::Start) => {
                // Override seeds when the payload carries messages;
                // otherwise re-emit the precomputed ones.
                if let Payload::Raw(value) = &message.payload {
                    if let Ok(seeds) = serde_json::from_value::<Vec<Message>>(value.clone()) {
                        return Ok(seeds);
                    }
                }
                Ok(self.state.seeds().await)
            }
            Some(Topic::Finished) => Ok(self
                .terminate(
                    message,
                    TaskRuntimeStatus::Success,
                    control.answer,
                    control.reason,
                )
                .await),
            Some(Topic::Error) => {
                let reason = control
                    .reason
                    .unwrap_or_else(|| "unspecified handler error".to_string());
                Ok(self
                    .terminate(message, TaskRuntimeStatus::Failed, None, Some(reason))
                    .await)
            }
            Some(Topic::Cancel) => {
                let reason = control.reason.unwrap_or_else(|| "cancelled".to_string());
                self.state.checkpoint_once(&self.checkpoints, &reason).await;
                Ok(self
                    .terminate(message, TaskRuntimeStatus::Cancelled, None, Some(reason))
                    .await)
            }
            Some(Topic::Interrupt) => {
                let reason = control.reason.unwrap_or_else(|| "interrupted".to_string());
                self.state.checkpoint_once(&self.checkpoints, &reason).await;
                Ok(self
                    .terminate(message, TaskRuntimeStatus::Interrupted, None, Some(reason))
                    .await)
            }
            Some(Topic::Timeout) => {
                // A timeout is a cancellation variant with its own reason.
                let reason = control.reason.unwrap_or_else(|| "timeout".to_string());
                self.state.checkpoint_once(&self.checkpoints, &reason).await;
                Ok(self
                    .terminate(message, TaskRuntimeStatus::Cancelled, None, Some(reason))
                    .await)
            }
            Some(Topic::SubscribeTool) => self.subscribe_tool(message).await,
            Some(Topic::Done) | Some(Topic::TaskResponse) => Ok(Vec::new()),
            Some(Topic::GroupActions) | Some(Topic::GroupResults) | None => Ok(Vec::new()),
        }
    }
}

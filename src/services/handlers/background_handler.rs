//! Background-task handler: folds detached sub-task results into a parent.
//!
//! Two merge modes, resolved once when the message is received by
//! comparing the background task's declared parent against the handling
//! runner's own task id: a "hot" merge while the parent is still running,
//! and a "wake" merge that first restores state from the sub-task's
//! checkpoint because the parent already completed.

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::errors::HandlerError;
use crate::domain::models::action::{ConversationTurn, Observation, TurnRole};
use crate::domain::models::message::{Message, MessageCategory, Payload};
use crate::domain::models::swarm::Swarm;
use crate::domain::ports::{CheckpointSink, MemorySink, MemoryWriteConfig};
use crate::services::handlers::FrameworkHandler;
use crate::services::runtime_state::ControlState;

/// How a background result merges into the handling runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeMode {
    /// The parent is this runner and still in flight.
    Hot,
    /// The parent already completed; restore from the checkpoint first.
    Wake {
        /// Checkpoint to restore, when the sub-task saved one.
        checkpoint_id: Option<String>,
    },
}

impl MergeMode {
    /// Resolve the mode for a background result handled by `task_id`.
    pub fn resolve(parent_task_id: &str, task_id: &str, checkpoint_id: Option<String>) -> Self {
        if parent_task_id == task_id {
            Self::Hot
        } else {
            Self::Wake { checkpoint_id }
        }
    }
}

/// Framework handler for the BACKGROUND_TASK category.
pub struct BackgroundTaskHandler {
    state: Arc<ControlState>,
    memory: Arc<dyn MemorySink>,
    checkpoints: Arc<dyn CheckpointSink>,
    swarm: Swarm,
}

impl BackgroundTaskHandler {
    /// Wire the handler to one run's control plane.
    pub fn new(
        state: Arc<ControlState>,
        memory: Arc<dyn MemorySink>,
        checkpoints: Arc<dyn CheckpointSink>,
        swarm: Swarm,
    ) -> Self {
        Self {
            state,
            memory,
            checkpoints,
            swarm,
        }
    }

    /// The agent invoked with the merged result: the first entry agent.
    fn merge_target(&self) -> Option<String> {
        self.swarm.entry_agents().first().cloned()
    }
}

#[async_trait]
impl FrameworkHandler for BackgroundTaskHandler {
    fn name(&self) -> &'static str {
        "background_task_handler"
    }

    fn is_valid_message(&self, message: &Message) -> bool {
        message.category == MessageCategory::BackgroundTask
    }

    async fn handle(&self, message: &Message) -> Result<Vec<Message>, HandlerError> {
        let Payload::Background(result) = &message.payload else {
            tracing::warn!(message_id = %message.id, "background message without result payload");
            return Ok(Vec::new());
        };

        let mode = MergeMode::resolve(
            &result.parent_task_id,
            &self.state.task_id,
            result.checkpoint_id.clone(),
        );
        tracing::info!(
            sub_task = %result.task_id,
            parent = %result.parent_task_id,
            mode = ?mode,
            success = result.success,
            "merging background result"
        );

        if let MergeMode::Wake { checkpoint_id } = &mode {
            if let Some(id) = checkpoint_id {
                match self.checkpoints.load_checkpoint(id).await {
                    Ok(Some(restored)) => self.state.merge_context(&restored).await,
                    Ok(None) => {
                        tracing::warn!(checkpoint_id = %id, "wake merge: checkpoint missing")
                    }
                    Err(e) => {
                        tracing::warn!(checkpoint_id = %id, error = %e, "wake merge: restore failed")
                    }
                }
            }
        }

        // The sub-task's answer lands in the parent's memory either way.
        let turn = ConversationTurn::new(
            TurnRole::Ai,
            result.answer.clone(),
            self.merge_target(),
            message.session_id.clone(),
        );
        let config = MemoryWriteConfig {
            task_id: Some(self.state.task_id.clone()),
        };
        if let Err(e) = self.memory.add(turn, &config).await {
            tracing::warn!(error = %e, "background merge memory write failed; continuing");
        }

        if !result.success {
            // A failed sub-task is recorded but does not wake the swarm.
            return Ok(Vec::new());
        }

        let Some(target) = self.merge_target() else {
            tracing::warn!("background merge with no entry agent to trigger");
            return Ok(Vec::new());
        };

        let mut headers = message.headers.forwarded();
        headers.context = self.state.context_snapshot().await;
        Ok(vec![Message::agent(
            format!("background:{}", result.task_id),
            target,
            message.session_id.clone(),
            headers,
            Payload::Observation(Observation::from_content(result.answer.clone())),
        )])
    }
}

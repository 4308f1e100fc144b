//! Memory handler: persists conversational turns as a side effect.
//!
//! A pure sink. It never yields framework messages, and a failed write is
//! logged and swallowed — conversational bookkeeping is best-effort and
//! must never abort task execution.

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::errors::HandlerError;
use crate::domain::models::message::{Message, MessageCategory, Payload};
use crate::domain::ports::{MemorySink, MemoryWriteConfig};
use crate::services::handlers::FrameworkHandler;

/// Framework handler for the MEMORY category.
pub struct MemoryHandler {
    memory: Arc<dyn MemorySink>,
    task_id: String,
}

impl MemoryHandler {
    /// Wire the handler to the run's memory sink.
    pub fn new(memory: Arc<dyn MemorySink>, task_id: impl Into<String>) -> Self {
        Self {
            memory,
            task_id: task_id.into(),
        }
    }
}

#[async_trait]
impl FrameworkHandler for MemoryHandler {
    fn name(&self) -> &'static str {
        "memory_handler"
    }

    fn is_valid_message(&self, message: &Message) -> bool {
        message.category == MessageCategory::Memory
    }

    async fn handle(&self, message: &Message) -> Result<Vec<Message>, HandlerError> {
        let Payload::Memory(turn) = &message.payload else {
            tracing::warn!(message_id = %message.id, "memory message without a turn payload");
            return Ok(Vec::new());
        };

        let config = MemoryWriteConfig {
            task_id: Some(self.task_id.clone()),
        };
        if let Err(e) = self.memory.add(turn.clone(), &config).await {
            tracing::warn!(
                message_id = %message.id,
                role = turn.role.as_str(),
                error = %e,
                "memory write failed; continuing"
            );
        }
        Ok(Vec::new())
    }
}

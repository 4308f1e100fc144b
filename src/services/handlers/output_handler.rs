//! Streaming output handler.
//!
//! Mirrors selected message categories onto the external output sink.
//! Runs in parallel with, not instead of, normal handling: as a stream
//! handler it never claims a message, so mirroring cannot affect the main
//! control flow.

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::errors::HandlerError;
use crate::domain::models::message::{Message, MessageCategory};
use crate::domain::ports::OutputSink;
use crate::services::handlers::FrameworkHandler;

/// Framework stream handler mirroring messages to the output sink.
pub struct OutputHandler {
    output: Arc<dyn OutputSink>,
    categories: Vec<MessageCategory>,
}

impl OutputHandler {
    /// Mirror the default categories (OUTPUT and CHUNK).
    pub fn new(output: Arc<dyn OutputSink>) -> Self {
        Self::with_categories(
            output,
            vec![MessageCategory::Output, MessageCategory::Chunk],
        )
    }

    /// Mirror an explicit category set.
    pub fn with_categories(output: Arc<dyn OutputSink>, categories: Vec<MessageCategory>) -> Self {
        Self { output, categories }
    }
}

#[async_trait]
impl FrameworkHandler for OutputHandler {
    fn name(&self) -> &'static str {
        "output_handler"
    }

    fn is_stream_handler(&self) -> bool {
        true
    }

    fn is_valid_message(&self, message: &Message) -> bool {
        self.categories.contains(&message.category)
    }

    async fn handle(&self, message: &Message) -> Result<Vec<Message>, HandlerError> {
        if let Err(e) = self.output.send(message).await {
            tracing::warn!(message_id = %message.id, error = %e, "output mirror failed");
        }
        Ok(Vec::new())
    }
}

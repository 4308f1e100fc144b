//! Tool invocation port.

use async_trait::async_trait;

use crate::domain::models::message::Message;

/// Port for tool invocation.
///
/// A tool consumes a TOOL message whose payload is a list of
/// [`ActionModel`](crate::domain::models::ActionModel)s and returns an
/// observation-bearing message with one
/// [`ActionResult`](crate::domain::models::ActionResult) per input action.
/// [`Message::tool_result`] builds a correctly-linked result message.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The tool's registered name.
    fn name(&self) -> &str;

    /// Execute all actions in the message and return the result message.
    async fn step(&self, message: &Message) -> anyhow::Result<Message>;
}

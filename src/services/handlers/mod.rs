//! Framework-level message processing chain.
//!
//! The chain runs for every message the dispatcher sees; each handler
//! opts in via `is_valid_message` and yields zero or more follow-up
//! messages that the dispatcher feeds back into the bus. Stream handlers
//! mirror traffic in parallel with, not instead of, normal handling.

use async_trait::async_trait;

use crate::domain::errors::HandlerError;
use crate::domain::models::message::Message;

pub mod background_handler;
pub mod group_handler;
pub mod memory_handler;
pub mod output_handler;
pub mod task_handler;

pub use background_handler::{BackgroundTaskHandler, MergeMode};
pub use group_handler::GroupHandler;
pub use memory_handler::MemoryHandler;
pub use output_handler::OutputHandler;
pub use task_handler::TaskControlHandler;

/// One link in the framework handler chain.
#[async_trait]
pub trait FrameworkHandler: Send + Sync {
    /// Name recorded in logs and error messages.
    fn name(&self) -> &'static str;

    /// Stream handlers mirror messages to an external sink and never
    /// claim them for normal processing.
    fn is_stream_handler(&self) -> bool {
        false
    }

    /// Category/topic opt-in filter; invoked for every message.
    fn is_valid_message(&self, message: &Message) -> bool;

    /// Process a message, yielding follow-up messages for the bus.
    async fn handle(&self, message: &Message) -> Result<Vec<Message>, HandlerError>;
}

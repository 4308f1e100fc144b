//! Output stream port.
//!
//! The streaming handler mirrors selected message categories onto this
//! sink without affecting the main control flow. `mark_completed` is
//! called exactly once during top-level task shutdown.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::domain::models::message::Message;

/// Port for the external output/streaming surface.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Mirror one message to the external consumer.
    async fn send(&self, message: &Message) -> anyhow::Result<()>;

    /// Signal that no further output will be produced.
    async fn mark_completed(&self) -> anyhow::Result<()>;
}

/// No-op output sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullOutputSink;

#[async_trait]
impl OutputSink for NullOutputSink {
    async fn send(&self, _message: &Message) -> anyhow::Result<()> {
        Ok(())
    }

    async fn mark_completed(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Output sink backed by an unbounded channel.
///
/// The receiving half is handed to the external consumer; sends after the
/// receiver is dropped are ignored (the consumer went away).
#[derive(Debug)]
pub struct ChannelOutputSink {
    tx: mpsc::UnboundedSender<Message>,
    completed: AtomicBool,
}

impl ChannelOutputSink {
    /// Create a sink and the receiver for its stream.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                completed: AtomicBool::new(false),
            }),
            rx,
        )
    }

    /// Whether `mark_completed` has been called.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutputSink for ChannelOutputSink {
    async fn send(&self, message: &Message) -> anyhow::Result<()> {
        if self.completed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.tx.send(message.clone());
        Ok(())
    }

    async fn mark_completed(&self) -> anyhow::Result<()> {
        self.completed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::context::Context;
    use crate::domain::models::message::{Headers, MessageCategory, Payload};

    #[tokio::test]
    async fn test_channel_sink_delivers_then_completes() {
        let (sink, mut rx) = ChannelOutputSink::new();
        let msg = Message::new(
            MessageCategory::Output,
            "runner",
            "s1",
            Headers::root("t1", Context::new()),
            Payload::Empty,
        );

        sink.send(&msg).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().id, msg.id);

        sink.mark_completed().await.unwrap();
        assert!(sink.is_completed());

        // Sends after completion are dropped.
        sink.send(&msg).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}

//! Message bus: typed publish-subscribe keyed by (category, topic-or-receiver).
//!
//! One logical input queue feeds the runner's consume loop; a lockable
//! registry binds business handlers (agent policy functions, tool step
//! functions, control-topic handlers) to dispatch keys. The registry
//! supports concurrent insertion while the consume loop is running, which
//! is how SUBSCRIBE_TOOL introduces new tools without a restart. The
//! registry is scoped to the bus instance owned by one runner; there is no
//! global mutable state.
//!
//! Dispatch is total: for every message either the handlers bound to its
//! topic run, or (no topic) the handlers bound to its receiver run, or no
//! handlers exist and the message takes the framework fallback path.
//! Nothing is silently swallowed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::domain::errors::BusError;
use crate::domain::models::message::{Message, MessageCategory};

/// A business handler: a user-visible capability bound to a dispatch key.
///
/// Returning `Ok(Some(message))` feeds the produced message through the
/// framework handler chain; `Ok(None)` means the handler consumed the
/// message without follow-up.
#[async_trait]
pub trait BusinessHandler: Send + Sync {
    /// Name recorded in the node's handle results.
    fn name(&self) -> &str;

    /// Process one message.
    async fn call(&self, message: Message) -> anyhow::Result<Option<Message>>;
}

/// Optional per-category pre-dispatch rewrite hook.
pub trait MessageTransformer: Send + Sync {
    /// Rewrite a message before handler lookup.
    fn transform(&self, message: Message) -> Message;
}

type HandlerMap = HashMap<MessageCategory, HashMap<String, Vec<Arc<dyn BusinessHandler>>>>;

/// The bus: input queue plus handler registry.
pub struct EventBus {
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<mpsc::UnboundedReceiver<Message>>,
    handlers: RwLock<HandlerMap>,
    transformers: RwLock<HashMap<MessageCategory, Arc<dyn MessageTransformer>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with an empty registry.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            handlers: RwLock::new(HashMap::new()),
            transformers: RwLock::new(HashMap::new()),
        }
    }

    /// Shared handle.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Enqueue a message for later consumption.
    ///
    /// Non-blocking; preserves FIFO order per calling context. Messages
    /// from concurrent producers may interleave.
    pub fn emit(&self, message: Message) -> Result<(), BusError> {
        tracing::debug!(
            message_id = %message.id,
            category = %message.category,
            topic = ?message.topic,
            receiver = ?message.receiver,
            "emit"
        );
        self.tx.send(message).map_err(|_| BusError::Closed)
    }

    /// Dequeue the next message, suspending until one is available.
    pub async fn consume(&self) -> Result<Message, BusError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(BusError::Closed)
    }

    /// Dequeue the next message without waiting.
    ///
    /// An empty queue surfaces [`BusError::NotReady`], which callers treat
    /// as "nothing to do" rather than a failure.
    pub async fn try_consume(&self) -> Result<Message, BusError> {
        let mut rx = self.rx.lock().await;
        match rx.try_recv() {
            Ok(message) => Ok(message),
            Err(mpsc::error::TryRecvError::Empty) => Err(BusError::NotReady),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(BusError::Closed),
        }
    }

    /// Bind a handler under (category, key), where key is a topic string
    /// or a receiver name. Multiple handlers may share a key; all run for
    /// a matching message.
    pub async fn register(
        &self,
        category: MessageCategory,
        key: impl Into<String>,
        handler: Arc<dyn BusinessHandler>,
    ) {
        let key = key.into();
        tracing::debug!(category = %category, key, handler = handler.name(), "handler registered");
        let mut handlers = self.handlers.write().await;
        handlers
            .entry(category)
            .or_default()
            .entry(key)
            .or_default()
            .push(handler);
    }

    /// Install the pre-dispatch rewrite hook for a category.
    pub async fn register_transformer(
        &self,
        category: MessageCategory,
        transformer: Arc<dyn MessageTransformer>,
    ) {
        self.transformers.write().await.insert(category, transformer);
    }

    /// Apply the category's transformer, if one is installed.
    pub async fn transform(&self, message: Message) -> Message {
        let transformers = self.transformers.read().await;
        match transformers.get(&message.category) {
            Some(t) => t.transform(message),
            None => message,
        }
    }

    /// Registered key → handler-list mapping for one category.
    pub async fn get_handlers(
        &self,
        category: MessageCategory,
    ) -> HashMap<String, Vec<Arc<dyn BusinessHandler>>> {
        self.handlers
            .read()
            .await
            .get(&category)
            .cloned()
            .unwrap_or_default()
    }

    /// Handlers bound to this message's dispatch key.
    ///
    /// Topic dispatch is exact: a message with a topic matches only
    /// handlers registered for that topic, never receiver bindings.
    /// An unroutable message (no topic, no receiver) matches nothing and
    /// is reported by the caller with a warning.
    pub async fn handlers_for(&self, message: &Message) -> Vec<Arc<dyn BusinessHandler>> {
        let Some(key) = message.routing_key() else {
            return Vec::new();
        };
        self.handlers
            .read()
            .await
            .get(&message.category)
            .and_then(|by_key| by_key.get(&key))
            .cloned()
            .unwrap_or_default()
    }
}

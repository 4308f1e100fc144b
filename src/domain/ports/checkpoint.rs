//! Checkpoint sink port.
//!
//! A checkpoint of the current execution context is taken before any
//! cancel/interrupt/timeout-induced stop so execution can in principle be
//! resumed later. Checkpoint failure is logged and swallowed, never
//! escalated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::models::context::Context;

/// Opaque handle to a saved checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointHandle {
    /// Checkpoint id, usable with [`CheckpointSink::load_checkpoint`].
    pub id: String,
    /// When the checkpoint was taken.
    pub created_at: DateTime<Utc>,
}

/// Port for the checkpoint backend.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    /// Persist a context snapshot with extra metadata.
    async fn save_checkpoint(
        &self,
        context: &Context,
        extra: &HashMap<String, Value>,
    ) -> anyhow::Result<CheckpointHandle>;

    /// Restore a previously saved context.
    async fn load_checkpoint(&self, id: &str) -> anyhow::Result<Option<Context>>;
}

/// No-op checkpoint sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCheckpointSink;

#[async_trait]
impl CheckpointSink for NullCheckpointSink {
    async fn save_checkpoint(
        &self,
        _context: &Context,
        _extra: &HashMap<String, Value>,
    ) -> anyhow::Result<CheckpointHandle> {
        Ok(CheckpointHandle {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
        })
    }

    async fn load_checkpoint(&self, _id: &str) -> anyhow::Result<Option<Context>> {
        Ok(None)
    }
}

/// In-memory checkpoint sink that records every save, for tests.
#[derive(Debug, Default)]
pub struct RecordingCheckpointSink {
    saved: Mutex<Vec<(String, Context, HashMap<String, Value>)>>,
}

impl RecordingCheckpointSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// How many checkpoints were saved.
    pub async fn save_count(&self) -> usize {
        self.saved.lock().await.len()
    }
}

#[async_trait]
impl CheckpointSink for RecordingCheckpointSink {
    async fn save_checkpoint(
        &self,
        context: &Context,
        extra: &HashMap<String, Value>,
    ) -> anyhow::Result<CheckpointHandle> {
        let id = Uuid::new_v4().to_string();
        self.saved
            .lock()
            .await
            .push((id.clone(), context.clone(), extra.clone()));
        Ok(CheckpointHandle {
            id,
            created_at: Utc::now(),
        })
    }

    async fn load_checkpoint(&self, id: &str) -> anyhow::Result<Option<Context>> {
        let saved = self.saved.lock().await;
        Ok(saved
            .iter()
            .find(|(saved_id, _, _)| saved_id == id)
            .map(|(_, ctx, _)| ctx.clone()))
    }
}

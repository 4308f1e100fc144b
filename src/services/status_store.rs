//! Task status store: the external-facing control plane.
//!
//! The runner polls this store at the top of every loop iteration;
//! external callers mutate it to request cancellation or interruption.
//! It is the only piece of task state shared with code outside the
//! runner's own execution, so every operation is atomic behind one lock.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domain::models::task::TaskRuntimeStatus;

/// One task's lifecycle entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatusEntry {
    /// Current status.
    pub status: TaskRuntimeStatus,
    /// Why the task reached this status, when relevant.
    pub reason: Option<String>,
    /// When the entry was registered.
    pub created_at: DateTime<Utc>,
    /// Last transition time.
    pub updated_at: DateTime<Utc>,
}

/// Concurrent task-id → status map. Cheap to clone; all clones share
/// the same state.
#[derive(Debug, Clone, Default)]
pub struct TaskStatusStore {
    inner: Arc<Mutex<HashMap<String, TaskStatusEntry>>>,
}

impl TaskStatusStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task with an initial status. Overwrites any previous
    /// entry for the same id.
    pub async fn register(&self, task_id: impl Into<String>, status: TaskRuntimeStatus) {
        let now = Utc::now();
        self.inner.lock().await.insert(
            task_id.into(),
            TaskStatusEntry {
                status,
                reason: None,
                created_at: now,
                updated_at: now,
            },
        );
    }

    /// Current entry for a task.
    pub async fn get(&self, task_id: &str) -> Option<TaskStatusEntry> {
        self.inner.lock().await.get(task_id).cloned()
    }

    /// Transition a task's status, recording an optional reason.
    ///
    /// Terminal statuses are sticky: once a task is terminal the
    /// transition is ignored and `false` is returned.
    pub async fn set_status(
        &self,
        task_id: &str,
        status: TaskRuntimeStatus,
        reason: Option<String>,
    ) -> bool {
        let mut guard = self.inner.lock().await;
        let Some(entry) = guard.get_mut(task_id) else {
            tracing::warn!(task_id, "status transition for unregistered task");
            return false;
        };
        if entry.status.is_terminal() {
            return false;
        }
        entry.status = status;
        entry.reason = reason;
        entry.updated_at = Utc::now();
        true
    }

    /// Request cancellation. The runner observes this on its next
    /// iteration; this call never blocks on the runner.
    pub async fn cancel(&self, task_id: &str, reason: impl Into<String>) -> bool {
        self.set_status(task_id, TaskRuntimeStatus::Cancelled, Some(reason.into()))
            .await
    }

    /// Request interruption.
    pub async fn interrupt(&self, task_id: &str, reason: impl Into<String>) -> bool {
        self.set_status(task_id, TaskRuntimeStatus::Interrupted, Some(reason.into()))
            .await
    }

    /// Whether the task has reached a terminal status.
    pub async fn is_finished(&self, task_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .get(task_id)
            .is_some_and(|e| e.status.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_get() {
        let store = TaskStatusStore::new();
        store.register("t1", TaskRuntimeStatus::Init).await;

        let entry = store.get("t1").await.unwrap();
        assert_eq!(entry.status, TaskRuntimeStatus::Init);
        assert!(entry.reason.is_none());
    }

    #[tokio::test]
    async fn test_cancel_records_reason() {
        let store = TaskStatusStore::new();
        store.register("t1", TaskRuntimeStatus::Running).await;

        assert!(store.cancel("t1", "user request").await);

        let entry = store.get("t1").await.unwrap();
        assert_eq!(entry.status, TaskRuntimeStatus::Cancelled);
        assert_eq!(entry.reason.as_deref(), Some("user request"));
        assert!(store.is_finished("t1").await);
    }

    #[tokio::test]
    async fn test_terminal_status_is_sticky() {
        let store = TaskStatusStore::new();
        store.register("t1", TaskRuntimeStatus::Running).await;
        store.cancel("t1", "first").await;

        assert!(!store.interrupt("t1", "second").await);
        assert!(
            !store
                .set_status("t1", TaskRuntimeStatus::Running, None)
                .await
        );

        let entry = store.get("t1").await.unwrap();
        assert_eq!(entry.status, TaskRuntimeStatus::Cancelled);
        assert_eq!(entry.reason.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = TaskStatusStore::new();
        let external = store.clone();
        store.register("t1", TaskRuntimeStatus::Running).await;

        external.cancel("t1", "from outside").await;
        assert!(store.is_finished("t1").await);
    }
}

//! Shared per-run control state and background-task tracking.
//!
//! One [`ControlState`] is owned by each runner and handed to the
//! framework handlers, so the stop signal, the terminal response slot,
//! the pre-stop checkpoint latch, and the authoritative task context all
//! live in one place.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;

use crate::domain::models::context::{Context, UsageRecorder};
use crate::domain::models::message::Message;
use crate::domain::models::task::TaskResponse;
use crate::domain::ports::CheckpointSink;

/// Control plane shared between a runner and its framework handlers.
pub struct ControlState {
    /// Owning task.
    pub task_id: String,
    /// Owning session.
    pub session_id: String,
    /// Whether the task reports into a parent.
    pub is_sub_task: bool,
    /// Shared token accounting.
    pub usage: UsageRecorder,
    stopped: AtomicBool,
    stop_notify: Notify,
    response: Mutex<Option<TaskResponse>>,
    checkpoint_taken: AtomicBool,
    seeds: Mutex<Vec<Message>>,
    context: Mutex<Context>,
}

impl ControlState {
    /// Create control state for one task run.
    pub fn new(
        task_id: impl Into<String>,
        session_id: impl Into<String>,
        is_sub_task: bool,
        context: Context,
    ) -> Arc<Self> {
        Arc::new(Self {
            task_id: task_id.into(),
            session_id: session_id.into(),
            is_sub_task,
            usage: UsageRecorder::new(),
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
            response: Mutex::new(None),
            checkpoint_taken: AtomicBool::new(false),
            seeds: Mutex::new(Vec::new()),
            context: Mutex::new(context),
        })
    }

    /// Signal the loop to stop. Idempotent; observed at the top of the
    /// next loop iteration.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!(task_id = %self.task_id, "stop requested");
        }
        self.stop_notify.notify_waiters();
    }

    /// Whether stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Suspend until stop is requested.
    pub async fn stopped_wait(&self) {
        loop {
            if self.is_stopped() {
                return;
            }
            let notified = self.stop_notify.notified();
            tokio::pin!(notified);
            // Register before the re-check so a concurrent stop() cannot
            // slip between the flag read and the wait.
            notified.as_mut().enable();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }

    /// Offer a terminal response. The first offer wins; both cancellation
    /// paths (status store and in-band message) converge here onto one
    /// response shape.
    pub async fn offer_response(&self, response: TaskResponse) -> bool {
        let mut slot = self.response.lock().await;
        if slot.is_some() {
            return false;
        }
        *slot = Some(response);
        true
    }

    /// Take the terminal response out of the slot.
    pub async fn take_response(&self) -> Option<TaskResponse> {
        self.response.lock().await.take()
    }

    /// Store the precomputed seed messages.
    pub async fn set_seeds(&self, seeds: Vec<Message>) {
        *self.seeds.lock().await = seeds;
    }

    /// Clone the precomputed seed messages.
    pub async fn seeds(&self) -> Vec<Message> {
        self.seeds.lock().await.clone()
    }

    /// Snapshot the authoritative task context.
    pub async fn context_snapshot(&self) -> Context {
        self.context.lock().await.clone()
    }

    /// Fold a completed branch or sub-task context back into the task
    /// context (union, overlay wins).
    pub async fn merge_context(&self, other: &Context) {
        self.context.lock().await.merge_sub_context(other);
    }

    /// Best-effort pre-stop checkpoint, taken at most once per run.
    ///
    /// Returns whether this call performed the save. Checkpoint failure
    /// is logged and swallowed, never escalated.
    pub async fn checkpoint_once(&self, sink: &Arc<dyn CheckpointSink>, reason: &str) -> bool {
        if self.checkpoint_taken.swap(true, Ordering::SeqCst) {
            return false;
        }
        let snapshot = self.context_snapshot().await;
        let mut extra = HashMap::new();
        extra.insert(
            "task_id".to_string(),
            serde_json::Value::String(self.task_id.clone()),
        );
        extra.insert(
            "reason".to_string(),
            serde_json::Value::String(reason.to_string()),
        );
        match sink.save_checkpoint(&snapshot, &extra).await {
            Ok(handle) => {
                tracing::info!(task_id = %self.task_id, checkpoint_id = %handle.id, reason, "checkpoint saved");
            }
            Err(e) => {
                tracing::warn!(task_id = %self.task_id, error = %e, "checkpoint failed; continuing");
            }
        }
        true
    }
}

/// Tracked set of background units of concurrency.
///
/// Every dispatched handler invocation and group waiter lands here so the
/// runner can drain or cancel outstanding work during shutdown.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    inner: Arc<Mutex<JoinSet<()>>>,
}

impl BackgroundTasks {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn and track one background unit.
    pub async fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.lock().await.spawn(future);
    }

    /// Number of tracked units still outstanding.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Drain outstanding work: wait up to `grace` for voluntary
    /// completion, then abort whatever remains.
    ///
    /// The set is detached before draining so in-flight units can keep
    /// spawning (into the next generation) without deadlocking shutdown;
    /// anything spawned after detachment is aborted when the set drops.
    pub async fn shutdown(&self, grace: Duration) {
        let mut set = {
            let mut guard = self.inner.lock().await;
            std::mem::take(&mut *guard)
        };
        let drained = tokio::time::timeout(grace, async {
            while set.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                outstanding = set.len(),
                "background tasks did not drain in time; aborting"
            );
            set.abort_all();
            while set.join_next().await.is_some() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::task::TaskRuntimeStatus;
    use crate::domain::ports::RecordingCheckpointSink;

    fn state() -> Arc<ControlState> {
        ControlState::new("task-1", "session-1", false, Context::new())
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_wakes_waiters() {
        let state = state();
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.stopped_wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        state.stop();
        state.stop();
        waiter.await.unwrap();
        assert!(state.is_stopped());
    }

    #[tokio::test]
    async fn test_first_response_wins() {
        let state = state();
        let first = TaskResponse::succeeded("task-1", Some("one".into()));
        let second = TaskResponse::terminal("task-1", TaskRuntimeStatus::Failed, "two");

        assert!(state.offer_response(first).await);
        assert!(!state.offer_response(second).await);

        let taken = state.take_response().await.unwrap();
        assert_eq!(taken.answer.as_deref(), Some("one"));
        assert!(state.take_response().await.is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_taken_exactly_once() {
        let state = state();
        let sink = RecordingCheckpointSink::shared();
        let as_dyn: Arc<dyn CheckpointSink> = sink.clone();

        assert!(state.checkpoint_once(&as_dyn, "cancel").await);
        assert!(!state.checkpoint_once(&as_dyn, "timeout").await);
        assert_eq!(sink.save_count().await, 1);
    }

    #[tokio::test]
    async fn test_background_shutdown_aborts_stragglers() {
        let tasks = BackgroundTasks::new();
        tasks
            .spawn(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .await;
        assert_eq!(tasks.len().await, 1);

        tasks.shutdown(Duration::from_millis(50)).await;
        assert_eq!(tasks.len().await, 0);
    }
}

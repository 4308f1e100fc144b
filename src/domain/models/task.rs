//! Task domain model: the top-level unit of work.
//!
//! A task owns exactly one runner for its execution; sub-tasks spawn child
//! task/runner pairs that report back into the parent via BACKGROUND_TASK
//! or GROUP messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::context::{Context, Usage};
use super::node::RunNode;
use super::swarm::Swarm;

/// Task lifecycle status. Terminal states are final; there is no
/// transition out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRuntimeStatus {
    /// Registered but not yet running.
    Init,
    /// The runner's consume-dispatch loop is active.
    Running,
    /// Completed with an answer.
    Success,
    /// Terminated by an error.
    Failed,
    /// Cancelled externally or by timeout.
    Cancelled,
    /// Interrupted; resumable from the pre-stop checkpoint.
    Interrupted,
}

impl TaskRuntimeStatus {
    /// Whether this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Cancelled | Self::Interrupted
        )
    }

    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
        }
    }

    /// Parse from a string form.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "init" => Some(Self::Init),
            "running" => Some(Self::Running),
            "success" | "succeeded" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            "interrupted" => Some(Self::Interrupted),
            _ => None,
        }
    }
}

/// Endless-loop detection knobs.
///
/// Both thresholds and the window are configurable rather than hard-coded;
/// detection applies at single-agent-repeat and two-agent-ping-pong
/// granularity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopDetectionConf {
    /// Whether detection runs at all.
    pub enabled: bool,
    /// How many recent agent invocations to retain.
    pub window: usize,
    /// Trailing identical invocations that count as a loop.
    pub single_repeat_threshold: usize,
    /// Trailing A/B alternations that count as a loop.
    pub pair_repeat_threshold: usize,
}

impl Default for LoopDetectionConf {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 32,
            single_repeat_threshold: 5,
            pair_repeat_threshold: 4,
        }
    }
}

/// Per-task run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConf {
    /// Wall-clock budget in milliseconds; 0 means unlimited.
    pub timeout_ms: u64,
    /// Maximum dispatched messages; 0 means unlimited.
    pub max_steps: u64,
    /// Deadline for group/RPC-style node waits.
    pub node_wait_timeout_ms: u64,
    /// Loop-detection knobs.
    pub loop_detection: LoopDetectionConf,
}

impl Default for RunConf {
    fn default() -> Self {
        Self {
            timeout_ms: 0,
            max_steps: 0,
            node_wait_timeout_ms: 60_000,
            loop_detection: LoopDetectionConf::default(),
        }
    }
}

/// The top-level unit of work submitted to a runner.
pub struct Task {
    /// Unique task id.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// Submitting user, when known.
    pub user_id: Option<String>,
    /// Starting observation (the user's request or a tool payload).
    pub input: String,
    /// Agent/tool topology the task executes against.
    pub swarm: Swarm,
    /// Run configuration.
    pub conf: RunConf,
    /// Whether this task reports into a parent.
    pub is_sub_task: bool,
    /// Parent task for sub-tasks.
    pub parent_task_id: Option<String>,
    /// Initial execution context.
    pub context: Context,
}

impl Task {
    /// Create a task with a generated id and default configuration.
    pub fn new(input: impl Into<String>, swarm: Swarm) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: Uuid::new_v4().to_string(),
            user_id: None,
            input: input.into(),
            swarm,
            conf: RunConf::default(),
            is_sub_task: false,
            parent_task_id: None,
            context: Context::new(),
        }
    }

    /// Set an explicit task id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set an explicit session id.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Set the run configuration.
    pub fn with_conf(mut self, conf: RunConf) -> Self {
        self.conf = conf;
        self
    }

    /// Set the initial context.
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Mark this task as a sub-task of `parent_task_id`.
    ///
    /// The parent's context should be specialized via
    /// [`Context::child`] so trajectory and token accounting flow upward.
    pub fn as_sub_task_of(mut self, parent_task_id: impl Into<String>) -> Self {
        self.is_sub_task = true;
        self.parent_task_id = Some(parent_task_id.into());
        self
    }
}

/// Terminal result of a task: the only externally observed completion shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    /// Task id.
    pub id: String,
    /// Whether the task succeeded.
    pub success: bool,
    /// Terminal status.
    pub status: TaskRuntimeStatus,
    /// The answer, when one was produced.
    pub answer: Option<String>,
    /// Human-readable reason. Raw stack info is logged, never surfaced here.
    pub msg: Option<String>,
    /// Wall-clock execution time in milliseconds.
    pub time_cost_ms: u64,
    /// Token accounting.
    pub usage: Usage,
    /// Ordered execution history, assembled from node state.
    pub trajectory: Option<Vec<RunNode>>,
    /// Final execution context.
    pub context: Option<Context>,
    /// When the response was assembled.
    pub finished_at: DateTime<Utc>,
}

impl TaskResponse {
    /// Successful response with an answer.
    pub fn succeeded(id: impl Into<String>, answer: Option<String>) -> Self {
        Self {
            id: id.into(),
            success: true,
            status: TaskRuntimeStatus::Success,
            answer,
            msg: None,
            time_cost_ms: 0,
            usage: Usage::default(),
            trajectory: None,
            context: None,
            finished_at: Utc::now(),
        }
    }

    /// Terminal response for a non-success status.
    pub fn terminal(
        id: impl Into<String>,
        status: TaskRuntimeStatus,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            success: false,
            status,
            answer: None,
            msg: Some(msg.into()),
            time_cost_ms: 0,
            usage: Usage::default(),
            trajectory: None,
            context: None,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(!TaskRuntimeStatus::Init.is_terminal());
        assert!(!TaskRuntimeStatus::Running.is_terminal());
        for s in [
            TaskRuntimeStatus::Success,
            TaskRuntimeStatus::Failed,
            TaskRuntimeStatus::Cancelled,
            TaskRuntimeStatus::Interrupted,
        ] {
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            TaskRuntimeStatus::Init,
            TaskRuntimeStatus::Running,
            TaskRuntimeStatus::Success,
            TaskRuntimeStatus::Failed,
            TaskRuntimeStatus::Cancelled,
            TaskRuntimeStatus::Interrupted,
        ] {
            assert_eq!(TaskRuntimeStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(
            TaskRuntimeStatus::from_str("canceled"),
            Some(TaskRuntimeStatus::Cancelled)
        );
    }

    #[test]
    fn test_sub_task_linkage() {
        let task = Task::new("do it", Swarm::builder().build()).as_sub_task_of("parent-1");
        assert!(task.is_sub_task);
        assert_eq!(task.parent_task_id.as_deref(), Some("parent-1"));
    }
}

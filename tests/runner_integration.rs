//! Integration tests for the event-driven execution engine.
//!
//! Tests verify:
//! 1. Fan-out: one multi-action decision becomes one group with one node
//!    per branch, branches run concurrently, and exactly one aggregate
//!    message reaches the initiating agent
//! 2. Timeout: an unresponsive handler cannot hold the task past its
//!    wall-clock budget
//! 3. Cancellation convergence: the status-store path and the in-band
//!    CANCEL path produce the same terminal response and exactly one
//!    checkpoint
//! 4. Endless-loop detection forces termination
//! 5. Header depth increases by exactly one per forwarding hop

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use overmind::domain::models::{
    ActionModel, ActionResult, Context, Headers, Message, MessageCategory, Observation, Payload,
    RunConf, Swarm, Task, TaskControl, TaskRuntimeStatus, Topic, TurnRole,
};
use overmind::domain::ports::{
    AgentPolicy, InMemoryMemorySink, MemoryFilters, MemorySink, PolicyInfo,
    RecordingCheckpointSink, Tool,
};
use overmind::services::{RunnerConfig, TaskRunner, TaskStatusStore};

// ---------------------------------------------------------------------------
// Test helpers: scripted agents and tools
// ---------------------------------------------------------------------------

/// Agent that fans out on its first call and finishes on its second.
struct FanOutAgent {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl AgentPolicy for FanOutAgent {
    fn name(&self) -> &str {
        "hive"
    }

    async fn policy(
        &self,
        observation: &Observation,
        _info: &PolicyInfo,
        _message: &Message,
    ) -> anyhow::Result<Vec<ActionModel>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if observation.action_results.is_empty() {
            Ok(vec![
                ActionModel::tool_call("search", None, json!({"content": "q1"}), "call-1"),
                ActionModel::tool_call("browser", None, json!({"content": "q2"}), "call-2"),
                ActionModel::handoff("scout", json!({"content": "explore"})),
            ])
        } else {
            let ids: Vec<String> = observation
                .action_results
                .iter()
                .map(|r| r.tool_call_id.clone().unwrap_or_default())
                .collect();
            Ok(vec![ActionModel::finish(format!(
                "done:{}:{}",
                observation.action_results.len(),
                ids.join(",")
            ))])
        }
    }
}

/// Agent that answers immediately.
struct ScoutAgent;

#[async_trait]
impl AgentPolicy for ScoutAgent {
    fn name(&self) -> &str {
        "scout"
    }

    async fn policy(
        &self,
        _observation: &Observation,
        _info: &PolicyInfo,
        _message: &Message,
    ) -> anyhow::Result<Vec<ActionModel>> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(vec![ActionModel::finish("scout report")])
    }
}

/// Tool that echoes its input after a fixed delay.
struct SlowEchoTool {
    name: String,
    delay: Duration,
}

#[async_trait]
impl Tool for SlowEchoTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn step(&self, message: &Message) -> anyhow::Result<Message> {
        tokio::time::sleep(self.delay).await;
        let Payload::Actions(actions) = &message.payload else {
            anyhow::bail!("tool message without actions");
        };
        let results = actions
            .iter()
            .map(|a| {
                ActionResult::ok(
                    a.tool_call_id.clone(),
                    format!("{}:{}", self.name, a.content().unwrap_or_default()),
                )
            })
            .collect();
        Ok(Message::tool_result(message, &self.name, results))
    }
}

/// Agent that never returns.
struct HangingAgent;

#[async_trait]
impl AgentPolicy for HangingAgent {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn policy(
        &self,
        _observation: &Observation,
        _info: &PolicyInfo,
        _message: &Message,
    ) -> anyhow::Result<Vec<ActionModel>> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(vec![])
    }
}

/// Agent that calls the same tool forever.
struct LoopingAgent;

#[async_trait]
impl AgentPolicy for LoopingAgent {
    fn name(&self) -> &str {
        "looper"
    }

    async fn policy(
        &self,
        _observation: &Observation,
        _info: &PolicyInfo,
        _message: &Message,
    ) -> anyhow::Result<Vec<ActionModel>> {
        Ok(vec![ActionModel::tool_call(
            "noop",
            None,
            json!({"content": "again"}),
            "call-loop",
        )])
    }
}

fn fast_runner_conf() -> RunnerConfig {
    RunnerConfig {
        poll_interval_ms: 20,
        drain_timeout_ms: 100,
        ..Default::default()
    }
}

/// Opt-in runtime tracing for debugging, driven by RUST_LOG.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

// ---------------------------------------------------------------------------
// Scenario 1: fan-out group with 2 tool actions + 1 agent handoff
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_fanout_creates_one_group_and_one_aggregate() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let memory = InMemoryMemorySink::shared();
    let swarm = Swarm::builder()
        .agent(Arc::new(FanOutAgent {
            calls: calls.clone(),
        }))
        .agent(Arc::new(ScoutAgent))
        .tool(Arc::new(SlowEchoTool {
            name: "search".into(),
            delay: Duration::from_millis(300),
        }))
        .tool(Arc::new(SlowEchoTool {
            name: "browser".into(),
            delay: Duration::from_millis(300),
        }))
        .entry_agent("hive")
        .build();

    let task = Task::new("seed question", swarm);
    let started = Instant::now();
    let mut runner = TaskRunner::new(task, TaskStatusStore::new())
        .with_memory(memory.clone())
        .with_runner_conf(fast_runner_conf());
    let response = runner.run().await.expect("run succeeds");
    let elapsed = started.elapsed();

    // The three branches (two 300ms tools, one 300ms agent) ran in
    // parallel: serial execution would need at least 900ms.
    assert!(
        elapsed < Duration::from_millis(800),
        "branches did not run concurrently: {elapsed:?}"
    );

    // Exactly one aggregate reached the initiating agent: two policy
    // calls total, and the aggregate carried all three branch results in
    // registration order.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(response.status, TaskRuntimeStatus::Success);
    let answer = response.answer.expect("answer");
    assert!(answer.starts_with("done:3:"), "unexpected answer {answer}");
    assert!(
        answer.starts_with("done:3:call-1,call-2"),
        "aggregate order should follow registration order: {answer}"
    );

    // One group with exactly three member nodes.
    let trajectory = response.trajectory.expect("trajectory");
    let group_ids: Vec<_> = trajectory
        .iter()
        .filter_map(|n| n.group_id.clone())
        .collect();
    let distinct: std::collections::HashSet<_> = group_ids.iter().cloned().collect();
    assert_eq!(distinct.len(), 1, "expected exactly one group");

    // Tool turns were written into the initiator's memory during
    // aggregation, before its next policy invocation.
    let turns = memory
        .get_all(&MemoryFilters {
            agent_id: Some("hive".into()),
            session_id: None,
        })
        .await
        .unwrap();
    let tool_turns: Vec<_> = turns
        .iter()
        .filter(|t| t.role == TurnRole::Tool)
        .collect();
    assert_eq!(tool_turns.len(), 3, "expected one tool turn per branch");
}

// ---------------------------------------------------------------------------
// Scenario 2: timeout with an unresponsive handler
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_timeout_cancels_unresponsive_task() {
    init_tracing();
    let swarm = Swarm::builder()
        .agent(Arc::new(HangingAgent))
        .entry_agent("hanging")
        .build();
    let checkpoints = RecordingCheckpointSink::shared();

    let mut task = Task::new("never finishes", swarm);
    task.conf = RunConf {
        timeout_ms: 500,
        ..Default::default()
    };

    let started = Instant::now();
    let mut runner = TaskRunner::new(task, TaskStatusStore::new())
        .with_checkpoints(checkpoints.clone())
        .with_runner_conf(fast_runner_conf());
    let response = runner.run().await.expect("run returns");
    let elapsed = started.elapsed();

    assert_eq!(response.status, TaskRuntimeStatus::Cancelled);
    assert!(
        response.msg.as_deref().unwrap_or_default().contains("timeout"),
        "msg should mention timeout: {:?}",
        response.msg
    );
    // Wall time tracks the budget, not the handler's unresponsiveness.
    assert!(
        elapsed >= Duration::from_millis(480),
        "returned before the budget: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(1500),
        "timeout did not bound wall time: {elapsed:?}"
    );
    assert_eq!(checkpoints.save_count().await, 1);
}

// ---------------------------------------------------------------------------
// Scenario 3: cancellation convergence (external and in-band paths)
// ---------------------------------------------------------------------------

fn slow_swarm() -> Swarm {
    struct SlowStarter;

    #[async_trait]
    impl AgentPolicy for SlowStarter {
        fn name(&self) -> &str {
            "starter"
        }

        async fn policy(
            &self,
            _observation: &Observation,
            _info: &PolicyInfo,
            _message: &Message,
        ) -> anyhow::Result<Vec<ActionModel>> {
            Ok(vec![ActionModel::tool_call(
                "slow",
                None,
                json!({"content": "wait"}),
                "call-slow",
            )])
        }
    }

    Swarm::builder()
        .agent(Arc::new(SlowStarter))
        .tool(Arc::new(SlowEchoTool {
            name: "slow".into(),
            delay: Duration::from_secs(10),
        }))
        .entry_agent("starter")
        .build()
}

#[tokio::test]
async fn test_external_cancellation_via_status_store() {
    init_tracing();
    let checkpoints = RecordingCheckpointSink::shared();
    let status = TaskStatusStore::new();
    let task = Task::new("slow work", slow_swarm());
    let task_id = task.id.clone();

    let external = status.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        external.cancel(&task_id, "operator cancelled").await;
    });

    let started = Instant::now();
    let mut runner = TaskRunner::new(task, status)
        .with_checkpoints(checkpoints.clone())
        .with_runner_conf(fast_runner_conf());
    let response = runner.run().await.expect("run returns");

    assert_eq!(response.status, TaskRuntimeStatus::Cancelled);
    assert_eq!(response.msg.as_deref(), Some("operator cancelled"));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(checkpoints.save_count().await, 1);
}

#[tokio::test]
async fn test_in_band_cancellation_message() {
    init_tracing();
    let checkpoints = RecordingCheckpointSink::shared();
    let task = Task::new("slow work", slow_swarm());
    let task_id = task.id.clone();
    let session_id = task.session_id.clone();

    let mut runner = TaskRunner::new(task, TaskStatusStore::new())
        .with_checkpoints(checkpoints.clone())
        .with_runner_conf(fast_runner_conf());
    let bus = runner.bus();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = bus.emit(Message::control(
            Topic::Cancel,
            "external",
            session_id,
            Headers::root(task_id, Context::new()),
            TaskControl::reason("user says stop"),
        ));
    });

    let response = runner.run().await.expect("run returns");

    // Same terminal shape as the status-store path, one checkpoint.
    assert_eq!(response.status, TaskRuntimeStatus::Cancelled);
    assert_eq!(response.msg.as_deref(), Some("user says stop"));
    assert_eq!(checkpoints.save_count().await, 1);
}

// ---------------------------------------------------------------------------
// Scenario 4: endless-loop detection forces termination
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_endless_loop_is_detected_and_fails_the_task() {
    init_tracing();
    let swarm = Swarm::builder()
        .agent(Arc::new(LoopingAgent))
        .tool(Arc::new(SlowEchoTool {
            name: "noop".into(),
            delay: Duration::from_millis(1),
        }))
        .entry_agent("looper")
        .build();

    let mut task = Task::new("loop forever", swarm);
    task.conf.loop_detection.single_repeat_threshold = 4;
    task.conf.timeout_ms = 10_000;

    let started = Instant::now();
    let mut runner =
        TaskRunner::new(task, TaskStatusStore::new()).with_runner_conf(fast_runner_conf());
    let response = runner.run().await.expect("run returns");

    assert_eq!(response.status, TaskRuntimeStatus::Failed);
    assert!(
        response
            .msg
            .as_deref()
            .unwrap_or_default()
            .contains("endless loop"),
        "msg should mention the loop: {:?}",
        response.msg
    );
    // Detection, not the 10s timeout, ended the task.
    assert!(started.elapsed() < Duration::from_secs(5));
}

// ---------------------------------------------------------------------------
// Scenario 5: header depth increases by one per forwarding hop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_header_level_increments_along_the_chain() {
    init_tracing();
    struct ToolOnceAgent;

    #[async_trait]
    impl AgentPolicy for ToolOnceAgent {
        fn name(&self) -> &str {
            "chainer"
        }

        async fn policy(
            &self,
            observation: &Observation,
            _info: &PolicyInfo,
            _message: &Message,
        ) -> anyhow::Result<Vec<ActionModel>> {
            if observation.action_results.is_empty() {
                Ok(vec![ActionModel::tool_call(
                    "echo",
                    None,
                    json!({"content": "ping"}),
                    "call-1",
                )])
            } else {
                Ok(vec![ActionModel::finish("pong")])
            }
        }
    }

    let swarm = Swarm::builder()
        .agent(Arc::new(ToolOnceAgent))
        .tool(Arc::new(SlowEchoTool {
            name: "echo".into(),
            delay: Duration::from_millis(1),
        }))
        .entry_agent("chainer")
        .build();

    let mut runner = TaskRunner::new(Task::new("ping", swarm), TaskStatusStore::new())
        .with_runner_conf(fast_runner_conf());
    let response = runner.run().await.expect("run succeeds");
    assert_eq!(response.answer.as_deref(), Some("pong"));

    // Seed dispatches at level 0; each produced message sits exactly one
    // level deeper: decision (1), tool result (2), finish (3).
    let trajectory = response.trajectory.expect("trajectory");
    let levels: Vec<u32> = trajectory
        .iter()
        .filter(|n| {
            matches!(
                n.busi_type,
                MessageCategory::Agent | MessageCategory::Tool
            )
        })
        .filter_map(|n| n.result_message().map(|m| m.headers.level))
        .collect();
    assert_eq!(levels, vec![1, 2, 3]);
}

// ---------------------------------------------------------------------------
// Scenario 6: handler failure becomes a FAILED response, not a panic
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_handler_failure_terminates_with_failed_response() {
    init_tracing();
    struct FailingAgent;

    #[async_trait]
    impl AgentPolicy for FailingAgent {
        fn name(&self) -> &str {
            "faulty"
        }

        async fn policy(
            &self,
            _observation: &Observation,
            _info: &PolicyInfo,
            _message: &Message,
        ) -> anyhow::Result<Vec<ActionModel>> {
            anyhow::bail!("provider exploded")
        }
    }

    let swarm = Swarm::builder()
        .agent(Arc::new(FailingAgent))
        .entry_agent("faulty")
        .build();
    let mut runner = TaskRunner::new(Task::new("boom", swarm), TaskStatusStore::new())
        .with_runner_conf(fast_runner_conf());
    let response = runner.run().await.expect("run returns normally");

    assert_eq!(response.status, TaskRuntimeStatus::Failed);
    assert!(!response.success);
    let msg = response.msg.unwrap_or_default();
    assert!(
        msg.contains("agent:faulty") && msg.contains("provider exploded"),
        "msg should carry handler name and reason: {msg}"
    );
}

// ---------------------------------------------------------------------------
// Scenario 7: group fail-fast surfaces as a FAILED task
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_group_branch_failure_fails_the_task() {
    init_tracing();
    struct BrokenTool;

    #[async_trait]
    impl Tool for BrokenTool {
        fn name(&self) -> &str {
            "broken"
        }

        async fn step(&self, _message: &Message) -> anyhow::Result<Message> {
            anyhow::bail!("tool backend unavailable")
        }
    }

    struct TwoToolAgent;

    #[async_trait]
    impl AgentPolicy for TwoToolAgent {
        fn name(&self) -> &str {
            "splitter"
        }

        async fn policy(
            &self,
            _observation: &Observation,
            _info: &PolicyInfo,
            _message: &Message,
        ) -> anyhow::Result<Vec<ActionModel>> {
            Ok(vec![
                ActionModel::tool_call("echo", None, json!({"content": "ok"}), "c1"),
                ActionModel::tool_call("broken", None, json!({"content": "ko"}), "c2"),
            ])
        }
    }

    let swarm = Swarm::builder()
        .agent(Arc::new(TwoToolAgent))
        .tool(Arc::new(SlowEchoTool {
            name: "echo".into(),
            delay: Duration::from_millis(1),
        }))
        .tool(Arc::new(BrokenTool))
        .entry_agent("splitter")
        .build();

    let mut runner = TaskRunner::new(Task::new("split", swarm), TaskStatusStore::new())
        .with_runner_conf(fast_runner_conf());
    let response = runner.run().await.expect("run returns");

    // One failed branch fails the whole group; no aggregate reaches the
    // agent (it would have produced a Success via a second policy call).
    assert_eq!(response.status, TaskRuntimeStatus::Failed);
    assert!(response
        .msg
        .unwrap_or_default()
        .contains("failed"));
}

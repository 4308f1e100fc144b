//! Run-node state store.
//!
//! One node per in-flight message. Creation is idempotent by id, status
//! is monotonic once terminal, and completion waits are broadcast: every
//! concurrent waiter observes the same terminal snapshot. Group
//! aggregation and RPC-style senders both rely on that.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use crate::domain::errors::NodeError;
use crate::domain::models::message::Message;
use crate::domain::models::node::{HandleResult, NodeSpec, NodeStatus, RunNode};

struct Slot {
    node: RunNode,
    status_tx: watch::Sender<NodeStatus>,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<String, Slot>,
    /// Creation order, for trajectory assembly.
    order: Vec<String>,
}

/// In-memory registry of execution nodes.
#[derive(Default)]
pub struct RunNodeStore {
    inner: Mutex<Inner>,
}

impl RunNodeStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent-by-id node creation.
    ///
    /// Returns the existing node unchanged if the id is already present,
    /// so concurrent creators cannot race into duplicates.
    pub async fn create_node(&self, spec: NodeSpec) -> RunNode {
        let mut inner = self.inner.lock().await;
        if let Some(slot) = inner.nodes.get(&spec.node_id) {
            return slot.node.clone();
        }

        let now = chrono::Utc::now();
        let node = RunNode {
            node_id: spec.node_id.clone(),
            busi_type: spec.busi_type,
            busi_id: spec.busi_id,
            session_id: spec.session_id,
            task_id: spec.task_id,
            parent_node_id: spec.parent_node_id,
            group_id: spec.group_id,
            sub_group_root_id: None,
            msg_from: spec.msg_from,
            metadata: spec.metadata,
            status: NodeStatus::Created,
            results: Vec::new(),
            handler_count: spec.handler_count.max(1),
            created_at: now,
            updated_at: now,
        };
        let (status_tx, _) = watch::channel(NodeStatus::Created);
        tracing::debug!(node_id = %node.node_id, busi_type = %node.busi_type, "node created");
        inner.order.push(spec.node_id.clone());
        inner.nodes.insert(
            spec.node_id,
            Slot {
                node: node.clone(),
                status_tx,
            },
        );
        node
    }

    /// Transition CREATED → RUNNING. Benign no-op in any other state.
    pub async fn run_node(&self, node_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(slot) = inner.nodes.get_mut(node_id) {
            if slot.node.status == NodeStatus::Created {
                slot.node.status = NodeStatus::Running;
                slot.node.updated_at = chrono::Utc::now();
                slot.status_tx.send_replace(NodeStatus::Running);
            }
        }
    }

    /// Record one handler's outcome for the node owning `node_id`.
    ///
    /// When all bound handlers have reported, the node transitions to its
    /// terminal status: FAILED if any handler failed, SUCCESS otherwise.
    /// Returns the terminal snapshot when this call completed the node.
    pub async fn save_handle_result(
        &self,
        handler_name: &str,
        node_id: &str,
        produced: Option<Message>,
        success: bool,
    ) -> Option<RunNode> {
        let mut inner = self.inner.lock().await;
        let Some(slot) = inner.nodes.get_mut(node_id) else {
            tracing::warn!(node_id, handler_name, "handle result for unknown node");
            return None;
        };

        if slot.node.status.is_terminal() {
            // Monotonic: a late report neither reopens a terminal node
            // nor mutates the snapshot completion waiters observed.
            tracing::debug!(node_id, handler_name, "handle result after terminal; ignored");
            return None;
        }

        let result = if success {
            HandleResult::success(handler_name, produced)
        } else {
            HandleResult::failed(handler_name, produced)
        };
        slot.node.results.push(result);
        slot.node.updated_at = chrono::Utc::now();

        if slot.node.results.len() >= slot.node.handler_count {
            let terminal = if slot.node.has_failed_result() {
                NodeStatus::Failed
            } else {
                NodeStatus::Success
            };
            slot.node.status = terminal;
            slot.status_tx.send_replace(terminal);
            tracing::debug!(node_id, status = terminal.as_str(), "node terminal");
            return Some(slot.node.clone());
        }
        None
    }

    /// Explicit SUCCESS transition for callers managing node lifecycle
    /// directly. Ignored once terminal.
    pub async fn run_succeed(&self, node_id: &str) -> bool {
        self.finish(node_id, NodeStatus::Success).await
    }

    /// Explicit FAILED transition. Ignored once terminal.
    pub async fn run_failed(&self, node_id: &str) -> bool {
        self.finish(node_id, NodeStatus::Failed).await
    }

    async fn finish(&self, node_id: &str, status: NodeStatus) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(slot) = inner.nodes.get_mut(node_id) else {
            return false;
        };
        if slot.node.status.is_terminal() {
            return false;
        }
        slot.node.status = status;
        slot.node.updated_at = chrono::Utc::now();
        slot.status_tx.send_replace(status);
        true
    }

    /// Suspend until the node reaches a terminal status.
    ///
    /// Broadcast semantics: any number of concurrent waiters may wait on
    /// the same node, and each receives the same terminal snapshot. With a
    /// deadline, exceeding it raises [`NodeError::WaitTimeout`].
    pub async fn wait_for_completion(
        &self,
        node_id: &str,
        timeout: Option<Duration>,
    ) -> Result<RunNode, NodeError> {
        let mut rx = {
            let inner = self.inner.lock().await;
            let slot = inner
                .nodes
                .get(node_id)
                .ok_or_else(|| NodeError::NotFound(node_id.to_string()))?;
            if slot.node.status.is_terminal() {
                return Ok(slot.node.clone());
            }
            slot.status_tx.subscribe()
        };

        let wait = async {
            loop {
                if rx.borrow_and_update().is_terminal() {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(NodeError::NotFound(node_id.to_string()));
                }
            }
        };

        match timeout {
            Some(deadline) => tokio::time::timeout(deadline, wait).await.map_err(|_| {
                NodeError::WaitTimeout {
                    node_id: node_id.to_string(),
                    waited_ms: deadline.as_millis() as u64,
                }
            })??,
            None => wait.await?,
        }

        let inner = self.inner.lock().await;
        inner
            .nodes
            .get(node_id)
            .map(|slot| slot.node.clone())
            .ok_or_else(|| NodeError::NotFound(node_id.to_string()))
    }

    /// Look up a node snapshot.
    pub async fn find_node(&self, node_id: &str) -> Option<RunNode> {
        self.inner
            .lock()
            .await
            .nodes
            .get(node_id)
            .map(|slot| slot.node.clone())
    }

    /// All nodes in creation order, for trajectory assembly.
    pub async fn trajectory(&self) -> Vec<RunNode> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.nodes.get(id).map(|s| s.node.clone()))
            .collect()
    }

    /// Number of registered nodes.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.nodes.len()
    }

    /// Whether no nodes are registered.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::message::MessageCategory;
    use std::sync::Arc;

    fn spec(id: &str) -> NodeSpec {
        NodeSpec::new(id, MessageCategory::Agent, "researcher", "session-1")
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = RunNodeStore::new();
        let first = store.create_node(spec("n1").with_task_id("t1")).await;
        let second = store.create_node(spec("n1")).await;

        assert_eq!(first.node_id, second.node_id);
        assert_eq!(second.task_id.as_deref(), Some("t1"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_terminality_is_monotonic() {
        let store = RunNodeStore::new();
        store.create_node(spec("n1")).await;
        store.run_node("n1").await;
        assert!(store.run_succeed("n1").await);

        // Late transitions and reports must not reopen the node.
        assert!(!store.run_failed("n1").await);
        store.run_node("n1").await;
        store
            .save_handle_result("late", "n1", None, false)
            .await;

        let node = store.find_node("n1").await.unwrap();
        assert_eq!(node.status, NodeStatus::Success);
    }

    #[tokio::test]
    async fn test_node_terminal_after_all_handlers_report() {
        let store = RunNodeStore::new();
        store.create_node(spec("n1").with_handler_count(2)).await;
        store.run_node("n1").await;

        assert!(store
            .save_handle_result("first", "n1", None, true)
            .await
            .is_none());
        assert_eq!(
            store.find_node("n1").await.unwrap().status,
            NodeStatus::Running
        );

        let terminal = store
            .save_handle_result("second", "n1", None, true)
            .await
            .expect("second report completes the node");
        assert_eq!(terminal.status, NodeStatus::Success);
    }

    #[tokio::test]
    async fn test_any_failed_handler_fails_the_node() {
        let store = RunNodeStore::new();
        store.create_node(spec("n1").with_handler_count(2)).await;
        store.run_node("n1").await;

        store.save_handle_result("ok", "n1", None, true).await;
        let terminal = store
            .save_handle_result("bad", "n1", None, false)
            .await
            .unwrap();
        assert_eq!(terminal.status, NodeStatus::Failed);
    }

    #[tokio::test]
    async fn test_multi_waiter_broadcast() {
        let store = Arc::new(RunNodeStore::new());
        store.create_node(spec("n1")).await;
        store.run_node("n1").await;

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            waiters.push(tokio::spawn(async move {
                store.wait_for_completion("n1", None).await.unwrap()
            }));
        }

        // Let every waiter subscribe before completing the node.
        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .save_handle_result("handler", "n1", None, true)
            .await;

        let mut snapshots = Vec::new();
        for waiter in waiters {
            snapshots.push(waiter.await.unwrap());
        }
        for snapshot in &snapshots {
            assert_eq!(snapshot.status, NodeStatus::Success);
            assert_eq!(snapshot.results, snapshots[0].results);
        }
    }

    #[tokio::test]
    async fn test_late_waiter_sees_terminal_immediately() {
        let store = RunNodeStore::new();
        store.create_node(spec("n1")).await;
        store.run_succeed("n1").await;

        let node = store
            .wait_for_completion("n1", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(node.status, NodeStatus::Success);
    }

    #[tokio::test]
    async fn test_wait_timeout() {
        let store = RunNodeStore::new();
        store.create_node(spec("n1")).await;
        store.run_node("n1").await;

        let err = store
            .wait_for_completion("n1", Some(Duration::from_millis(25)))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::WaitTimeout { .. }));
    }

    #[tokio::test]
    async fn test_wait_unknown_node() {
        let store = RunNodeStore::new();
        let err = store.wait_for_completion("ghost", None).await.unwrap_err();
        assert!(matches!(err, NodeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_trajectory_preserves_creation_order() {
        let store = RunNodeStore::new();
        for id in ["a", "b", "c"] {
            store.create_node(spec(id)).await;
        }
        store.run_succeed("c").await;
        store.run_succeed("a").await;

        let ids: Vec<_> = store
            .trajectory()
            .await
            .into_iter()
            .map(|n| n.node_id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Once terminal, no sequence of transitions changes the status.
            #[test]
            fn prop_terminal_status_never_reverts(
                ops in prop::collection::vec(0u8..4, 1..20),
                fail_first in any::<bool>(),
            ) {
                tokio_test::block_on(async {
                    let store = RunNodeStore::new();
                    store.create_node(spec("n1")).await;
                    store.run_node("n1").await;
                    if fail_first {
                        store.run_failed("n1").await;
                    } else {
                        store.run_succeed("n1").await;
                    }
                    let frozen = store.find_node("n1").await.unwrap().status;

                    for op in ops {
                        match op {
                            0 => store.run_node("n1").await,
                            1 => { store.run_succeed("n1").await; }
                            2 => { store.run_failed("n1").await; }
                            _ => {
                                store.save_handle_result("late", "n1", None, false).await;
                            }
                        }
                        let status = store.find_node("n1").await.unwrap().status;
                        prop_assert_eq!(status, frozen);
                    }
                    Ok(())
                })?;
            }
        }
    }
}

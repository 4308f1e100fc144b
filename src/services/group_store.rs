//! Group store: fan-out membership and retirement bookkeeping.
//!
//! A group is finished exactly when every member node is terminal.
//! Finishing triggers aggregation once; afterwards the group is retired
//! and its results can never be re-aggregated.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domain::errors::GroupError;
use crate::domain::models::node::Group;

struct Entry {
    group: Group,
    done: HashSet<String>,
    finished: bool,
    aggregated: bool,
}

/// Registry of live fan-out groups.
#[derive(Default)]
pub struct GroupStore {
    inner: Mutex<HashMap<String, Entry>>,
}

impl GroupStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new group.
    pub async fn create(&self, group: Group) {
        let mut inner = self.inner.lock().await;
        tracing::debug!(
            group_id = %group.group_id,
            members = group.node_ids.len(),
            "group created"
        );
        inner.insert(
            group.group_id.clone(),
            Entry {
                group,
                done: HashSet::new(),
                finished: false,
                aggregated: false,
            },
        );
    }

    /// Record one member's completion.
    ///
    /// Returns the group snapshot exactly once: on the call that completes
    /// the member set. Later calls (and repeats for the same member)
    /// return `None`.
    pub async fn mark_member_done(&self, group_id: &str, node_id: &str) -> Option<Group> {
        let mut inner = self.inner.lock().await;
        let entry = inner.get_mut(group_id)?;
        if !entry.group.node_ids.iter().any(|id| id == node_id) {
            tracing::warn!(group_id, node_id, "completion for non-member node");
            return None;
        }
        entry.done.insert(node_id.to_string());
        if entry.done.len() == entry.group.node_ids.len() && !entry.finished {
            entry.finished = true;
            return Some(entry.group.clone());
        }
        None
    }

    /// Look up a group snapshot.
    pub async fn find(&self, group_id: &str) -> Option<Group> {
        self.inner
            .lock()
            .await
            .get(group_id)
            .map(|e| e.group.clone())
    }

    /// Claim a finished group for aggregation, retiring it.
    ///
    /// Errors if the group is unknown or was already aggregated, which
    /// makes double-aggregation impossible by construction.
    pub async fn retire(&self, group_id: &str) -> Result<Group, GroupError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .get_mut(group_id)
            .ok_or_else(|| GroupError::NotFound(group_id.to_string()))?;
        if entry.aggregated {
            return Err(GroupError::Retired(group_id.to_string()));
        }
        entry.aggregated = true;
        Ok(entry.group.clone())
    }

    /// Whether a group has been retired.
    pub async fn is_retired(&self, group_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .get(group_id)
            .is_some_and(|e| e.aggregated)
    }
}

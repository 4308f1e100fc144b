//! Execution context with explicit value semantics.
//!
//! A `Context` travels in message headers. Fan-out branches each receive an
//! owned deep copy (`child`), and a defined `merge` folds a branch back into
//! its parent: key union, overlay wins on conflict, never a destructive
//! replace. Token accounting rides along in `Usage`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Token accounting for a task or a single branch of execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by prompts / inputs.
    pub prompt_tokens: u64,
    /// Tokens produced by completions / outputs.
    pub completion_tokens: u64,
    /// Total tokens (prompt + completion).
    pub total_tokens: u64,
}

impl Usage {
    /// Create a usage record from prompt and completion counts.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Accumulate another usage record into this one (saturating).
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

/// Shared handle agents use to report token usage back to the runner.
///
/// Agent policies are pure capabilities; per-call state lives in the
/// context, and accounting flows through this handle so it survives
/// branch copies.
#[derive(Debug, Clone, Default)]
pub struct UsageRecorder {
    inner: Arc<Mutex<Usage>>,
}

impl UsageRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a usage sample.
    pub async fn record(&self, usage: Usage) {
        let mut guard = self.inner.lock().await;
        guard.add(&usage);
    }

    /// Snapshot the accumulated usage.
    pub async fn snapshot(&self) -> Usage {
        *self.inner.lock().await
    }
}

/// Key-value execution state carried through message headers.
///
/// Values are JSON so the context round-trips through checkpoints and
/// trajectories without a schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    state: HashMap<String, Value>,
    usage: Usage,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a state value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    /// Insert or replace a state value.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.state.insert(key.into(), value);
    }

    /// Remove a state value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.state.remove(key)
    }

    /// Number of state entries.
    pub fn len(&self) -> usize {
        self.state.len()
    }

    /// Whether the state map is empty.
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// Iterate over state entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.state.iter()
    }

    /// Accumulated token usage for this context.
    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    /// Record token usage directly into this context.
    pub fn record_usage(&mut self, usage: &Usage) {
        self.usage.add(usage);
    }

    /// Derive an owned child context for an independent branch.
    ///
    /// The state map is deep-copied; usage starts at zero so a later
    /// `merge_sub_context` adds exactly the tokens the branch spent.
    pub fn child(&self) -> Context {
        Context {
            state: self.state.clone(),
            usage: Usage::default(),
        }
    }

    /// Merge another context into this one.
    ///
    /// Key union with overlay-wins-on-conflict: `other`'s value replaces
    /// this one where both are present. Usage is accumulated.
    pub fn merge(&mut self, other: &Context) {
        for (k, v) in &other.state {
            self.state.insert(k.clone(), v.clone());
        }
        self.usage.add(&other.usage);
    }

    /// Fold a completed sub-task or branch context back into its parent.
    ///
    /// Same semantics as [`merge`](Self::merge); named separately so call
    /// sites read as the fan-in they are.
    pub fn merge_sub_context(&mut self, child: &Context) {
        self.merge(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_is_union_with_overlay() {
        let mut parent = Context::new();
        parent.insert("keep", json!("parent"));
        parent.insert("conflict", json!("old"));

        let mut branch = parent.child();
        branch.insert("conflict", json!("new"));
        branch.insert("added", json!(42));

        parent.merge_sub_context(&branch);

        assert_eq!(parent.get("keep"), Some(&json!("parent")));
        assert_eq!(parent.get("conflict"), Some(&json!("new")));
        assert_eq!(parent.get("added"), Some(&json!(42)));
    }

    #[test]
    fn test_child_usage_starts_at_zero() {
        let mut parent = Context::new();
        parent.record_usage(&Usage::new(100, 50));

        let mut branch = parent.child();
        assert!(branch.usage().is_empty());

        branch.record_usage(&Usage::new(10, 5));
        parent.merge_sub_context(&branch);

        assert_eq!(parent.usage().total_tokens, 165);
    }

    #[test]
    fn test_branch_copies_do_not_alias() {
        let mut parent = Context::new();
        parent.insert("shared", json!("before"));

        let mut branch = parent.child();
        branch.insert("shared", json!("after"));

        assert_eq!(parent.get("shared"), Some(&json!("before")));
    }

    #[tokio::test]
    async fn test_usage_recorder_accumulates() {
        let recorder = UsageRecorder::new();
        recorder.record(Usage::new(10, 20)).await;
        recorder.record(Usage::new(1, 2)).await;

        let total = recorder.snapshot().await;
        assert_eq!(total.prompt_tokens, 11);
        assert_eq!(total.completion_tokens, 22);
        assert_eq!(total.total_tokens, 33);
    }
}

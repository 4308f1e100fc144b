//! Memory sink port.
//!
//! Conversational bookkeeping is best-effort by design: callers log and
//! swallow failures rather than aborting task execution.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domain::models::action::ConversationTurn;

/// Write-time options for a memory add.
#[derive(Debug, Clone, Default)]
pub struct MemoryWriteConfig {
    /// Owning task, for scoping.
    pub task_id: Option<String>,
}

/// Filters for memory reads.
#[derive(Debug, Clone, Default)]
pub struct MemoryFilters {
    /// Restrict to one agent's conversation.
    pub agent_id: Option<String>,
    /// Restrict to one session.
    pub session_id: Option<String>,
}

impl MemoryFilters {
    fn matches(&self, turn: &ConversationTurn) -> bool {
        if let Some(ref agent) = self.agent_id {
            if turn.agent_id.as_deref() != Some(agent.as_str()) {
                return false;
            }
        }
        if let Some(ref session) = self.session_id {
            if turn.session_id != *session {
                return false;
            }
        }
        true
    }
}

/// Port for the conversational memory backend.
#[async_trait]
pub trait MemorySink: Send + Sync {
    /// Persist one conversational turn.
    async fn add(&self, turn: ConversationTurn, config: &MemoryWriteConfig) -> anyhow::Result<()>;

    /// All turns matching the filters, oldest first.
    async fn get_all(&self, filters: &MemoryFilters) -> anyhow::Result<Vec<ConversationTurn>>;

    /// The last `n` turns matching the filters, oldest first.
    async fn get_last_n(
        &self,
        n: usize,
        filters: &MemoryFilters,
    ) -> anyhow::Result<Vec<ConversationTurn>>;
}

/// No-op memory sink for runs that do not record conversation history.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMemorySink;

#[async_trait]
impl MemorySink for NullMemorySink {
    async fn add(
        &self,
        _turn: ConversationTurn,
        _config: &MemoryWriteConfig,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_all(&self, _filters: &MemoryFilters) -> anyhow::Result<Vec<ConversationTurn>> {
        Ok(Vec::new())
    }

    async fn get_last_n(
        &self,
        _n: usize,
        _filters: &MemoryFilters,
    ) -> anyhow::Result<Vec<ConversationTurn>> {
        Ok(Vec::new())
    }
}

/// In-memory sink, useful for tests and short-lived runs.
#[derive(Debug, Default)]
pub struct InMemoryMemorySink {
    turns: Mutex<Vec<ConversationTurn>>,
}

impl InMemoryMemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Total number of stored turns.
    pub async fn len(&self) -> usize {
        self.turns.lock().await.len()
    }

    /// Whether no turns are stored.
    pub async fn is_empty(&self) -> bool {
        self.turns.lock().await.is_empty()
    }
}

#[async_trait]
impl MemorySink for InMemoryMemorySink {
    async fn add(&self, turn: ConversationTurn, _config: &MemoryWriteConfig) -> anyhow::Result<()> {
        self.turns.lock().await.push(turn);
        Ok(())
    }

    async fn get_all(&self, filters: &MemoryFilters) -> anyhow::Result<Vec<ConversationTurn>> {
        let turns = self.turns.lock().await;
        Ok(turns.iter().filter(|t| filters.matches(t)).cloned().collect())
    }

    async fn get_last_n(
        &self,
        n: usize,
        filters: &MemoryFilters,
    ) -> anyhow::Result<Vec<ConversationTurn>> {
        let mut all = self.get_all(filters).await?;
        let skip = all.len().saturating_sub(n);
        Ok(all.split_off(skip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::action::TurnRole;

    #[tokio::test]
    async fn test_in_memory_sink_filters_by_agent() {
        let sink = InMemoryMemorySink::new();
        let config = MemoryWriteConfig::default();

        sink.add(
            ConversationTurn::new(TurnRole::Human, "hi", Some("a".into()), "s1"),
            &config,
        )
        .await
        .unwrap();
        sink.add(
            ConversationTurn::new(TurnRole::Ai, "hello", Some("b".into()), "s1"),
            &config,
        )
        .await
        .unwrap();

        let filters = MemoryFilters {
            agent_id: Some("a".into()),
            session_id: None,
        };
        let turns = sink.get_all(&filters).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].content, "hi");
    }

    #[tokio::test]
    async fn test_get_last_n_keeps_order() {
        let sink = InMemoryMemorySink::new();
        let config = MemoryWriteConfig::default();
        for i in 0..5 {
            sink.add(
                ConversationTurn::new(TurnRole::Ai, format!("turn-{i}"), None, "s1"),
                &config,
            )
            .await
            .unwrap();
        }

        let turns = sink
            .get_last_n(2, &MemoryFilters::default())
            .await
            .unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "turn-3");
        assert_eq!(turns[1].content, "turn-4");
    }
}

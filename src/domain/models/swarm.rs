//! Swarm: the agent/tool topology a task executes against.
//!
//! Agents and tools are pure capabilities selected by name. Per-call state
//! lives in the execution context, so the same registered instance can run
//! any number of parallel branches without sharing mutable state.
//!
//! The tool registry is a shared, lockable catalog because tools can be
//! introduced at runtime (SUBSCRIBE_TOOL) while the consume loop runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::errors::RuntimeError;
use crate::domain::ports::{AgentPolicy, Tool};

/// Agent/tool topology with named entry points.
#[derive(Clone)]
pub struct Swarm {
    agents: HashMap<String, Arc<dyn AgentPolicy>>,
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
    entry_agents: Vec<String>,
    entry_tools: Vec<String>,
}

impl Swarm {
    /// Start building a swarm.
    pub fn builder() -> SwarmBuilder {
        SwarmBuilder::default()
    }

    /// Look up an agent by name.
    pub fn agent(&self, name: &str) -> Option<Arc<dyn AgentPolicy>> {
        self.agents.get(name).cloned()
    }

    /// Look up a tool by name.
    pub async fn tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    /// All registered agent names.
    pub fn agent_names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    /// All registered tool names.
    pub async fn tool_names(&self) -> Vec<String> {
        self.tools.read().await.keys().cloned().collect()
    }

    /// All registered agents as (name, capability) pairs.
    pub fn agents(&self) -> impl Iterator<Item = (&String, &Arc<dyn AgentPolicy>)> {
        self.agents.iter()
    }

    /// Snapshot of the tool catalog.
    pub async fn tools(&self) -> Vec<(String, Arc<dyn Tool>)> {
        self.tools
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Add a tool to the catalog at runtime.
    ///
    /// Used when a sub-task discovers a new tool mid-execution; the
    /// SUBSCRIBE_TOOL control path binds it into the bus afterwards.
    pub async fn add_tool(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.write().await.insert(name, tool);
    }

    /// Entry agents, in seed order.
    pub fn entry_agents(&self) -> &[String] {
        &self.entry_agents
    }

    /// Entry tools, in seed order.
    pub fn entry_tools(&self) -> &[String] {
        &self.entry_tools
    }

    /// Whether this swarm seeds from tools rather than agents.
    pub fn is_tool_oriented(&self) -> bool {
        self.entry_agents.is_empty() && !self.entry_tools.is_empty()
    }

    /// Validate the topology before a run.
    ///
    /// There must be at least one entry point, and every entry must
    /// resolve to a registered capability.
    pub async fn validate(&self) -> Result<(), RuntimeError> {
        if self.entry_agents.is_empty() && self.entry_tools.is_empty() {
            return Err(RuntimeError::SwarmNotInitialized(
                "no entry agents or tools configured".into(),
            ));
        }
        for name in &self.entry_agents {
            if !self.agents.contains_key(name) {
                return Err(RuntimeError::SwarmNotInitialized(format!(
                    "entry agent '{name}' is not registered"
                )));
            }
        }
        let tools = self.tools.read().await;
        for name in &self.entry_tools {
            if !tools.contains_key(name) {
                return Err(RuntimeError::SwarmNotInitialized(format!(
                    "entry tool '{name}' is not registered"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Swarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Swarm")
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .field("entry_agents", &self.entry_agents)
            .field("entry_tools", &self.entry_tools)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Swarm`].
#[derive(Default)]
pub struct SwarmBuilder {
    agents: HashMap<String, Arc<dyn AgentPolicy>>,
    tools: HashMap<String, Arc<dyn Tool>>,
    entry_agents: Vec<String>,
    entry_tools: Vec<String>,
}

impl SwarmBuilder {
    /// Register an agent capability under its own name.
    pub fn agent(mut self, agent: Arc<dyn AgentPolicy>) -> Self {
        self.agents.insert(agent.name().to_string(), agent);
        self
    }

    /// Register a tool capability under its own name.
    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    /// Mark an agent as an entry point; one seed message is built per
    /// entry agent.
    pub fn entry_agent(mut self, name: impl Into<String>) -> Self {
        self.entry_agents.push(name.into());
        self
    }

    /// Mark a tool as an entry point for tool-oriented tasks.
    pub fn entry_tool(mut self, name: impl Into<String>) -> Self {
        self.entry_tools.push(name.into());
        self
    }

    /// Finish building.
    pub fn build(self) -> Swarm {
        Swarm {
            agents: self.agents,
            tools: Arc::new(RwLock::new(self.tools)),
            entry_agents: self.entry_agents,
            entry_tools: self.entry_tools,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::action::{ActionModel, Observation};
    use crate::domain::models::message::Message;
    use crate::domain::ports::PolicyInfo;
    use async_trait::async_trait;

    struct EchoAgent;

    #[async_trait]
    impl AgentPolicy for EchoAgent {
        fn name(&self) -> &str {
            "echo"
        }

        async fn policy(
            &self,
            observation: &Observation,
            _info: &PolicyInfo,
            _message: &Message,
        ) -> anyhow::Result<Vec<ActionModel>> {
            Ok(vec![ActionModel::finish(
                observation.content.clone().unwrap_or_default(),
            )])
        }
    }

    #[tokio::test]
    async fn test_validate_rejects_empty_swarm() {
        let swarm = Swarm::builder().build();
        assert!(swarm.validate().await.is_err());
    }

    #[tokio::test]
    async fn test_validate_rejects_unknown_entry() {
        let swarm = Swarm::builder()
            .agent(Arc::new(EchoAgent))
            .entry_agent("missing")
            .build();
        assert!(swarm.validate().await.is_err());
    }

    #[tokio::test]
    async fn test_runtime_tool_insertion() {
        struct NoopTool;

        #[async_trait]
        impl Tool for NoopTool {
            fn name(&self) -> &str {
                "noop"
            }

            async fn step(&self, message: &Message) -> anyhow::Result<Message> {
                Ok(Message::tool_result(message, "noop", vec![]))
            }
        }

        let swarm = Swarm::builder()
            .agent(Arc::new(EchoAgent))
            .entry_agent("echo")
            .build();
        assert!(swarm.tool("noop").await.is_none());

        swarm.add_tool(Arc::new(NoopTool)).await;
        assert!(swarm.tool("noop").await.is_some());
    }
}

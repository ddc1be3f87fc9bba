//! Remote container-agent backend.

use super::ActionBackend;
use super::types::{SpawnProcess, TerminateProcess};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

/// RPC surface of a container agent.
#[async_trait]
pub trait ContainerAgentClient: Send + Sync {
    async fn spawn_process(
        &self,
        name: &str,
        module: &str,
        cls: &str,
        config: Option<Value>,
        process_id: Option<String>,
    ) -> Result<String>;

    async fn terminate_process(&self, process_id: &str) -> Result<bool>;
}

/// Resolves a container agent name to a client.
pub trait AgentClientFactory: Send + Sync {
    fn client(&self, cc_agent: &str) -> Result<Arc<dyn ContainerAgentClient>>;
}

/// Factory over a fixed table of already-connected clients.
#[derive(Default)]
pub struct AgentDirectory {
    clients: DashMap<String, Arc<dyn ContainerAgentClient>>,
}

impl AgentDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, cc_agent: &str, client: Arc<dyn ContainerAgentClient>) {
        self.clients.insert(cc_agent.to_string(), client);
    }
}

impl AgentClientFactory for AgentDirectory {
    fn client(&self, cc_agent: &str) -> Result<Arc<dyn ContainerAgentClient>> {
        self.clients
            .get(cc_agent)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow::anyhow!("no container agent named '{}'", cc_agent))
    }
}

pub struct AgentBackend {
    agents: Arc<dyn AgentClientFactory>,
}

impl AgentBackend {
    pub fn new(agents: Arc<dyn AgentClientFactory>) -> Arc<Self> {
        Arc::new(Self { agents })
    }
}

#[async_trait]
impl ActionBackend for AgentBackend {
    fn name(&self) -> &'static str {
        "agent"
    }

    async fn spawn_process(&self, request: &SpawnProcess) -> Result<String> {
        let client = self.agents.client(&request.cc_agent)?;
        let process_id = client
            .spawn_process(
                &request.proc_name,
                &request.module,
                &request.cls,
                request.config.clone(),
                request.process_id.clone(),
            )
            .await?;

        tracing::debug!(
            "Agent {} spawned {} as {}",
            request.cc_agent,
            request.proc_name,
            process_id
        );
        Ok(process_id)
    }

    async fn terminate_process(&self, request: &TerminateProcess) -> Result<bool> {
        let client = self.agents.client(&request.cc_agent)?;
        client.terminate_process(&request.process_id).await
    }
}

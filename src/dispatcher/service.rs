use crate::aggregator::service::Aggregator;
use crate::bus::MessageBus;
use crate::clock::Clock;
use crate::config::{ExecutorKind, PdConfig};
use crate::engine::service::DecisionEngine;
use crate::executor::ActionBackend;
use crate::executor::agent::{AgentBackend, AgentClientFactory};
use crate::executor::executor::ActionExecutor;
use crate::executor::local::{LocalBackend, LocalProcessManager};
use crate::leader::service::LeaderManager;
use crate::leader::store::LockStore;
use crate::registry::directory::ResourceDirectory;
use crate::registry::service::ProcessRegistry;
use crate::types::InstanceId;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

/// How often RUNNING containers are checked for missing heartbeats.
const STALENESS_CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// Delay before retrying to take over the command queue.
const ACTIVATION_RETRY: Duration = Duration::from_millis(500);

/// Everything the dispatcher talks to but does not own.
#[derive(Clone)]
pub struct Collaborators {
    pub bus: Arc<dyn MessageBus>,
    pub lock_store: Arc<dyn LockStore>,
    pub directory: Arc<dyn ResourceDirectory>,
    pub agents: Arc<dyn AgentClientFactory>,
    /// Required by the local executor only.
    pub local: Option<Arc<dyn LocalProcessManager>>,
    pub clock: Arc<dyn Clock>,
}

struct Components {
    registry: Arc<ProcessRegistry>,
    executor: Arc<ActionExecutor>,
    engine: Arc<DecisionEngine>,
    aggregator: Arc<Aggregator>,
    health: JoinHandle<()>,
    activation: JoinHandle<()>,
}

pub struct ProcessDispatcher {
    config: PdConfig,
    instance: InstanceId,
    collaborators: Collaborators,
    leader: Arc<LeaderManager>,
    components: Mutex<Option<Components>>,
    quit: watch::Sender<bool>,
}

impl ProcessDispatcher {
    pub fn new(config: PdConfig, collaborators: Collaborators) -> Arc<Self> {
        let instance = InstanceId::new();
        let leader = LeaderManager::new(
            &config.leader.scope,
            instance.clone(),
            collaborators.lock_store.clone(),
            collaborators.clock.clone(),
            config.leader.interval(),
        );
        let (quit, _) = watch::channel(false);

        Arc::new(Self {
            config,
            instance,
            collaborators,
            leader,
            components: Mutex::new(None),
            quit,
        })
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn leader(&self) -> &Arc<LeaderManager> {
        &self.leader
    }

    pub async fn is_leader(&self) -> bool {
        self.leader.is_leader().await
    }

    pub async fn registry(&self) -> Option<Arc<ProcessRegistry>> {
        self.components
            .lock()
            .await
            .as_ref()
            .map(|c| c.registry.clone())
    }

    /// True while this instance consumes the command queue.
    pub async fn is_serving(&self) -> bool {
        match self.components.lock().await.as_ref() {
            Some(components) => components.engine.is_active().await,
            None => false,
        }
    }

    /// Brings the components up in dependency order. Calling it on a
    /// started dispatcher is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut components = self.components.lock().await;
        if components.is_some() {
            return Ok(());
        }
        tracing::info!("Starting process dispatcher {}", self.instance);
        let c = &self.collaborators;

        self.leader.clone().start().await;
        self.leader.await_leader().await;
        if self.leader.is_leader().await {
            tracing::info!("Process dispatcher {} is the leader", self.instance);
        } else {
            tracing::info!("Process dispatcher {} is standing by", self.instance);
        }

        let registry = ProcessRegistry::new(
            c.directory.clone(),
            self.config.preconditions.clone(),
            self.config.engines.clone(),
            c.clock.clone(),
        );

        let backend = match self.backend() {
            Ok(backend) => backend,
            Err(e) => {
                self.leader.stop().await;
                return Err(e);
            }
        };
        let executor = ActionExecutor::new(
            backend,
            self.config.executor.effective_pool_size(),
            self.config.executor.shutdown_timeout(),
        );
        executor.clone().start().await;

        let engine = match DecisionEngine::new(
            self.config.engine.clone(),
            &self.config.command_queue,
            c.bus.clone(),
            registry.clone(),
            executor.clone(),
            Some(self.leader.clone()),
        ) {
            Ok(engine) => engine,
            Err(e) => {
                executor.stop().await;
                self.leader.stop().await;
                return Err(e.into());
            }
        };
        // Only the leader consumes commands; standbys join the queue when
        // they take over
        if self.leader.is_leader().await
            && let Err(e) = engine.clone().activate().await
        {
            executor.stop().await;
            self.leader.stop().await;
            return Err(e);
        }

        let aggregator = Aggregator::new(
            c.bus.clone(),
            registry.clone(),
            &self.config.heartbeat_topic,
            self.instance.clone(),
        );
        if let Err(e) = aggregator.clone().start().await {
            engine.stop().await;
            executor.stop().await;
            self.leader.stop().await;
            return Err(e);
        }

        self.quit.send_replace(false);
        let health = tokio::spawn(health_loop(registry.clone(), self.quit.subscribe()));
        let activation = tokio::spawn(activation_loop(
            engine.clone(),
            self.leader.leadership(),
            self.quit.subscribe(),
        ));

        *components = Some(Components {
            registry,
            executor,
            engine,
            aggregator,
            health,
            activation,
        });

        tracing::info!("Process dispatcher {} started", self.instance);
        Ok(())
    }

    /// Shuts the components down in reverse startup order.
    pub async fn stop(&self) {
        let Some(components) = self.components.lock().await.take() else {
            return;
        };
        tracing::info!("Stopping process dispatcher {}", self.instance);

        self.quit.send_replace(true);
        let _ = components.health.await;
        let _ = components.activation.await;

        components.aggregator.stop().await;
        components.engine.stop().await;
        components.executor.stop().await;
        self.leader.stop().await;

        tracing::info!("Process dispatcher {} stopped", self.instance);
    }

    fn backend(&self) -> Result<Arc<dyn ActionBackend>> {
        let c = &self.collaborators;
        match self.config.executor.kind {
            ExecutorKind::Agent => Ok(AgentBackend::new(c.agents.clone())),
            ExecutorKind::Local => {
                let Some(local) = c.local.clone() else {
                    anyhow::bail!("local executor requires a local process manager");
                };
                Ok(LocalBackend::new(
                    local,
                    c.bus.clone(),
                    c.clock.clone(),
                    self.config.executor.spawn_delay(),
                ))
            }
        }
    }
}

async fn health_loop(registry: Arc<ProcessRegistry>, mut quit: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;
            changed = quit.changed() => {
                if changed.is_err() || *quit.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(STALENESS_CHECK_INTERVAL) => {
                let stale = registry.mark_stale_containers().await;
                if !stale.is_empty() {
                    tracing::info!("{} containers marked UNKNOWN", stale.len());
                }
            }
        }
    }
}

/// Keeps the engine on the command queue exactly while this instance leads.
async fn activation_loop(
    engine: Arc<DecisionEngine>,
    mut leading: watch::Receiver<bool>,
    mut quit: watch::Receiver<bool>,
) {
    loop {
        let lead = *leading.borrow_and_update();
        let mut retry = false;
        if lead != engine.is_active().await {
            if lead {
                if let Err(e) = engine.clone().activate().await {
                    // The previous leader may still hold the queue
                    tracing::warn!("Cannot take over the command queue yet: {}", e);
                    retry = true;
                }
            } else {
                engine.deactivate().await;
            }
        }

        tokio::select! {
            biased;
            changed = quit.changed() => {
                if changed.is_err() || *quit.borrow() {
                    break;
                }
            }
            changed = leading.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(ACTIVATION_RETRY), if retry => {}
        }
    }
}

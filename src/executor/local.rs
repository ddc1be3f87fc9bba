//! Local-container backend.
//!
//! Behaves like a remote agent as far as callers can tell: spawns are
//! announced through PENDING/RUNNING lifecycle events, and with a non-zero
//! spawn delay the process id is returned before the process exists. Callers
//! that assume synchronous completion instead of waiting for events break
//! visibly under that delay.

use super::ActionBackend;
use super::types::{SpawnProcess, TerminateProcess};
use crate::aggregator::types::{LifecycleEvent, ProcessLifecycleEvent};
use crate::bus::MessageBus;
use crate::clock::Clock;
use crate::registry::types::{ProcessInfo, ProcessState};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Process manager of the container the dispatcher runs in.
#[async_trait]
pub trait LocalProcessManager: Send + Sync {
    fn container_id(&self) -> &str;

    async fn spawn_process(
        &self,
        name: &str,
        module: &str,
        cls: &str,
        config: Option<Value>,
        process_id: &str,
    ) -> Result<String>;

    async fn terminate_process(&self, process_id: &str) -> Result<bool>;
}

pub struct LocalBackend {
    container: Arc<dyn LocalProcessManager>,
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
    spawn_delay: Duration,
    /// Delayed spawns that have not happened yet, by process id.
    pending: Arc<DashMap<String, JoinHandle<()>>>,
}

impl LocalBackend {
    pub fn new(
        container: Arc<dyn LocalProcessManager>,
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn Clock>,
        spawn_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            container,
            bus,
            clock,
            spawn_delay,
            pending: Arc::new(DashMap::new()),
        })
    }

    pub fn pending_spawns(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl ActionBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn spawn_process(&self, request: &SpawnProcess) -> Result<String> {
        let process_id = request.process_id.clone().unwrap_or_else(|| {
            format!("{}_{}", request.proc_name, uuid::Uuid::new_v4().simple())
        });

        let spawner = Spawner {
            container: self.container.clone(),
            bus: self.bus.clone(),
            clock: self.clock.clone(),
        };
        spawner
            .announce(&process_id, &request.proc_name, ProcessState::Pending)
            .await;

        if self.spawn_delay.is_zero() {
            spawner.spawn(request.clone(), process_id.clone()).await?;
            return Ok(process_id);
        }

        let delay = self.spawn_delay;
        let pending = self.pending.clone();
        let request = request.clone();
        let pid = process_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = spawner.spawn(request, pid.clone()).await {
                tracing::warn!("Delayed spawn of {} failed: {}", pid, e);
            }
            pending.remove(&pid);
        });
        self.pending.insert(process_id.clone(), handle);

        tracing::debug!(
            "Spawn of {} deferred by {:?}",
            process_id,
            self.spawn_delay
        );
        Ok(process_id)
    }

    async fn terminate_process(&self, request: &TerminateProcess) -> Result<bool> {
        if let Some((_, handle)) = self.pending.remove(&request.process_id) {
            handle.abort();
        }

        if let Err(e) = self.container.terminate_process(&request.process_id).await {
            tracing::warn!(
                "Failed to terminate process {} in container, already dead?: {}",
                request.process_id,
                e
            );
        }

        let spawner = Spawner {
            container: self.container.clone(),
            bus: self.bus.clone(),
            clock: self.clock.clone(),
        };
        spawner
            .announce(&request.process_id, "", ProcessState::Terminated)
            .await;

        Ok(true)
    }

    async fn shutdown(&self) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, handle)) = self.pending.remove(&id) {
                handle.abort();
            }
        }
    }
}

/// The parts of the backend a deferred spawn task needs.
struct Spawner {
    container: Arc<dyn LocalProcessManager>,
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
}

impl Spawner {
    async fn spawn(&self, request: SpawnProcess, process_id: String) -> Result<String> {
        match self
            .container
            .spawn_process(
                &request.proc_name,
                &request.module,
                &request.cls,
                request.config,
                &process_id,
            )
            .await
        {
            Ok(pid) => {
                tracing::debug!("Spawned local process {}", pid);
                self.announce(&pid, &request.proc_name, ProcessState::Running)
                    .await;
                Ok(pid)
            }
            Err(e) => {
                self.announce(&process_id, &request.proc_name, ProcessState::Failed)
                    .await;
                Err(e)
            }
        }
    }

    async fn announce(&self, process_id: &str, name: &str, state: ProcessState) {
        let mut info = ProcessInfo::with_state(state);
        if !name.is_empty() {
            info.name = Some(name.to_string());
        }
        let event = LifecycleEvent::ProcessLifecycleEvent(ProcessLifecycleEvent {
            origin: process_id.to_string(),
            container_id: self.container.container_id().to_string(),
            ts_created: self.clock.now_ms(),
            info,
        });
        if let Err(e) = event.publish(self.bus.as_ref()).await {
            tracing::warn!(
                "Failed to publish {:?} event for process {}: {}",
                state,
                process_id,
                e
            );
        }
    }
}

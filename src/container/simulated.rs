use crate::aggregator::types::{
    ContainerHeartbeat, ContainerLifecycleEvent, LifecycleEvent, ProcessLifecycleEvent,
    ProcessReport,
};
use crate::bus::MessageBus;
use crate::clock::Clock;
use crate::executor::agent::ContainerAgentClient;
use crate::executor::local::LocalProcessManager;
use crate::registry::types::{ContainerResource, ContainerState, ProcessInfo, ProcessState};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedProcess {
    pub name: String,
    pub module: String,
    pub cls: String,
    pub config: Option<Value>,
}

pub struct SimulatedContainer {
    resource: ContainerResource,
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
    heartbeat_topic: String,
    processes: DashMap<String, SimulatedProcess>,
    terminated: AtomicBool,
    fail_spawns: AtomicBool,
    quit: watch::Sender<bool>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedContainer {
    pub fn new(
        container_id: &str,
        engine: &str,
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn Clock>,
        heartbeat_topic: &str,
    ) -> Arc<Self> {
        let (quit, _) = watch::channel(false);
        let resource = ContainerResource {
            container_id: container_id.to_string(),
            cc_agent: format!("agent_{}", container_id),
            engine: engine.to_string(),
            created_ms: clock.now_ms(),
        };

        Arc::new(Self {
            resource,
            bus,
            clock,
            heartbeat_topic: heartbeat_topic.to_string(),
            processes: DashMap::new(),
            terminated: AtomicBool::new(false),
            fail_spawns: AtomicBool::new(false),
            quit,
            heartbeat_task: Mutex::new(None),
        })
    }

    /// Directory record for this container.
    pub fn resource(&self) -> ContainerResource {
        self.resource.clone()
    }

    pub fn cc_agent(&self) -> &str {
        &self.resource.cc_agent
    }

    pub fn has_process(&self, process_id: &str) -> bool {
        self.processes.contains_key(process_id)
    }

    pub fn process(&self, process_id: &str) -> Option<SimulatedProcess> {
        self.processes.get(process_id).map(|p| p.value().clone())
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// Makes every following spawn fail.
    pub fn set_fail_spawns(&self, fail: bool) {
        self.fail_spawns.store(fail, Ordering::SeqCst);
    }

    pub fn state(&self) -> ContainerState {
        if self.terminated.load(Ordering::SeqCst) {
            ContainerState::Terminated
        } else {
            ContainerState::Running
        }
    }

    /// Snapshot of what the next heartbeat will report.
    pub fn heartbeat(&self) -> ContainerHeartbeat {
        let mut processes: Vec<ProcessReport> = self
            .processes
            .iter()
            .map(|entry| ProcessReport {
                process_id: entry.key().clone(),
                info: ProcessInfo {
                    name: Some(entry.value().name.clone()),
                    ..ProcessInfo::with_state(ProcessState::Running)
                },
            })
            .collect();
        processes.sort_by(|a, b| a.process_id.cmp(&b.process_id));

        ContainerHeartbeat {
            container_id: self.resource.container_id.clone(),
            ts: self.clock.now_ms(),
            state: self.state(),
            processes,
            attributes: None,
        }
    }

    pub async fn send_heartbeat(&self) -> Result<()> {
        let heartbeat = serde_json::to_value(self.heartbeat())?;
        self.bus.publish(&self.heartbeat_topic, heartbeat).await
    }

    /// Broadcasts a heartbeat every `interval` until `stop`.
    pub async fn start_heartbeats(self: Arc<Self>, interval: Duration) {
        let mut task = self.heartbeat_task.lock().await;
        if task.is_some() {
            return;
        }

        self.quit.send_replace(false);
        let mut quit = self.quit.subscribe();
        let container = self.clone();
        *task = Some(tokio::spawn(async move {
            loop {
                if let Err(e) = container.send_heartbeat().await {
                    tracing::warn!(
                        "Container {} failed to send heartbeat: {}",
                        container.resource.container_id,
                        e
                    );
                }
                tokio::select! {
                    biased;
                    _ = quit.wait_for(|quit| *quit) => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }));
    }

    pub async fn stop(&self) {
        self.quit.send_replace(true);
        if let Some(task) = self.heartbeat_task.lock().await.take() {
            let _ = task.await;
        }
    }

    /// Kills every process and announces the container as TERMINATED.
    pub async fn terminate(&self) -> Result<()> {
        self.terminated.store(true, Ordering::SeqCst);
        self.processes.clear();

        tracing::info!("Container {} terminated", self.resource.container_id);
        LifecycleEvent::ContainerLifecycleEvent(ContainerLifecycleEvent {
            origin: self.resource.container_id.clone(),
            ts_created: self.clock.now_ms(),
            state: ContainerState::Terminated,
        })
        .publish(self.bus.as_ref())
        .await
    }

    fn start_process(
        &self,
        name: &str,
        module: &str,
        cls: &str,
        config: Option<Value>,
        process_id: Option<&str>,
    ) -> Result<String> {
        if self.terminated.load(Ordering::SeqCst) {
            anyhow::bail!("container {} is terminated", self.resource.container_id);
        }
        if self.fail_spawns.load(Ordering::SeqCst) {
            anyhow::bail!("spawn of '{}' refused by container", name);
        }

        let process_id = process_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}_{}", name, uuid::Uuid::new_v4().simple()));

        self.processes.insert(
            process_id.clone(),
            SimulatedProcess {
                name: name.to_string(),
                module: module.to_string(),
                cls: cls.to_string(),
                config,
            },
        );
        tracing::debug!(
            "Container {} started process {} ({}.{})",
            self.resource.container_id,
            process_id,
            module,
            cls
        );
        Ok(process_id)
    }

    fn stop_process(&self, process_id: &str) -> Result<SimulatedProcess> {
        self.processes
            .remove(process_id)
            .map(|(_, process)| process)
            .ok_or_else(|| anyhow::anyhow!("process {} not found", process_id))
    }

    async fn announce(&self, process_id: &str, name: &str, state: ProcessState) -> Result<()> {
        LifecycleEvent::ProcessLifecycleEvent(ProcessLifecycleEvent {
            origin: process_id.to_string(),
            container_id: self.resource.container_id.clone(),
            ts_created: self.clock.now_ms(),
            info: ProcessInfo {
                name: Some(name.to_string()),
                ..ProcessInfo::with_state(state)
            },
        })
        .publish(self.bus.as_ref())
        .await
    }
}

/// Agent-side calls announce their own lifecycle events, like a real agent.
#[async_trait]
impl ContainerAgentClient for SimulatedContainer {
    async fn spawn_process(
        &self,
        name: &str,
        module: &str,
        cls: &str,
        config: Option<Value>,
        process_id: Option<String>,
    ) -> Result<String> {
        let process_id = self.start_process(name, module, cls, config, process_id.as_deref())?;
        self.announce(&process_id, name, ProcessState::Running)
            .await?;
        Ok(process_id)
    }

    async fn terminate_process(&self, process_id: &str) -> Result<bool> {
        let process = self.stop_process(process_id)?;
        self.announce(process_id, &process.name, ProcessState::Terminated)
            .await?;
        Ok(true)
    }
}

/// Local calls stay silent; the local backend publishes the events.
#[async_trait]
impl LocalProcessManager for SimulatedContainer {
    fn container_id(&self) -> &str {
        &self.resource.container_id
    }

    async fn spawn_process(
        &self,
        name: &str,
        module: &str,
        cls: &str,
        config: Option<Value>,
        process_id: &str,
    ) -> Result<String> {
        self.start_process(name, module, cls, config, Some(process_id))
    }

    async fn terminate_process(&self, process_id: &str) -> Result<bool> {
        self.stop_process(process_id).map(|_| true)
    }
}

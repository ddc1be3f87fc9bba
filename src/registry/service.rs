use super::directory::ResourceDirectory;
use super::types::*;
use crate::clock::Clock;
use crate::config::{EngineSettings, PreconditionConfig};
use crate::error::{PdError, PdResult};

use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};

#[derive(Default)]
struct RegistryState {
    containers: HashMap<String, ContainerEntry>,
    /// Process id -> container id of its current entry.
    process_index: HashMap<String, String>,
}

pub struct ProcessRegistry {
    directory: Arc<dyn ResourceDirectory>,
    preconditions: PreconditionConfig,
    engines: HashMap<String, EngineSettings>,
    clock: Arc<dyn Clock>,
    /// Single coarse lock over all maps.
    state: RwLock<RegistryState>,
    preconditions_true: watch::Sender<bool>,
}

impl ProcessRegistry {
    pub fn new(
        directory: Arc<dyn ResourceDirectory>,
        preconditions: PreconditionConfig,
        engines: HashMap<String, EngineSettings>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (preconditions_true, _) = watch::channel(false);
        Arc::new(Self {
            directory,
            preconditions,
            engines,
            clock,
            state: RwLock::new(RegistryState::default()),
            preconditions_true,
        })
    }

    pub fn engine_settings(&self, engine: &str) -> EngineSettings {
        self.engines.get(engine).cloned().unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Upserts a container.
    ///
    /// The update is accepted iff `ts_event` is not older than the stored
    /// timestamp or the new state is TERMINATED. A container the resource
    /// directory does not know is logged and dropped. Returns whether the
    /// update was applied.
    pub async fn register_container(
        &self,
        container_id: &str,
        ts_event: u64,
        state: ContainerState,
        container_info: Option<Value>,
    ) -> PdResult<bool> {
        if container_id.is_empty() {
            return Err(PdError::BadRequest("missing container id".to_string()));
        }
        if ts_event == 0 {
            return Err(PdError::BadRequest(format!(
                "missing event timestamp for container {}",
                container_id
            )));
        }

        let known = self.state.read().await.containers.contains_key(container_id);
        let resource = if known {
            None
        } else {
            match self.directory.find_container(container_id).await {
                Ok(Some(resource)) => Some(resource),
                Ok(None) => {
                    tracing::warn!(
                        "Container {} not found in resource directory, registration dropped",
                        container_id
                    );
                    return Ok(false);
                }
                Err(e) => {
                    tracing::warn!(
                        "Directory lookup for container {} failed, registration dropped: {}",
                        container_id,
                        e
                    );
                    return Ok(false);
                }
            }
        };

        let now = self.clock.now_ms();
        {
            let mut guard = self.state.write().await;
            let inner = &mut *guard;

            match inner.containers.get_mut(container_id) {
                Some(entry) => {
                    if ts_event < entry.ts_event && state != ContainerState::Terminated {
                        tracing::debug!(
                            "Ignoring stale event for container {} (ts {} < {})",
                            container_id,
                            ts_event,
                            entry.ts_event
                        );
                        return Ok(false);
                    }

                    if entry.state != state {
                        tracing::info!(
                            "Container {} state {:?} -> {:?}",
                            container_id,
                            entry.state,
                            state
                        );
                    }
                    entry.state = state;
                    entry.ts_event = entry.ts_event.max(ts_event);
                    entry.ts_updated = now;
                    if container_info.is_some() {
                        entry.info = container_info;
                    }
                }
                None => {
                    // Checked above: only a concurrent registration can make
                    // the entry appear in between, and that one wins.
                    let Some(resource) = resource else {
                        return Ok(false);
                    };
                    tracing::info!(
                        "Registered container {} (engine '{}', agent '{}') as {:?}",
                        container_id,
                        resource.engine,
                        resource.cc_agent,
                        state
                    );
                    inner.containers.insert(
                        container_id.to_string(),
                        ContainerEntry {
                            container_id: container_id.to_string(),
                            cc_agent: resource.cc_agent,
                            engine: resource.engine,
                            created_ms: resource.created_ms,
                            ts_event,
                            ts_updated: now,
                            state,
                            info: container_info,
                            allocation: BTreeMap::new(),
                            dead_procs: BTreeMap::new(),
                        },
                    );
                }
            }

            if state == ContainerState::Terminated
                && let Some(entry) = inner.containers.get_mut(container_id)
            {
                let live: Vec<String> = entry.allocation.keys().cloned().collect();
                for process_id in live {
                    if let Some(mut process) = entry.allocation.remove(&process_id) {
                        process.state = ProcessState::Terminated;
                        process.ts_updated = now;
                        entry.dead_procs.insert(process_id, process);
                    }
                }
            }
        }

        self.check_preconditions().await;
        Ok(true)
    }

    /// Records a process under its container.
    ///
    /// Terminal states route the process into `dead_procs`, including
    /// processes never seen alive. With `update == false` an already-known
    /// live entry keeps its first-seen attributes.
    pub async fn register_process(
        &self,
        container_id: &str,
        process_id: &str,
        proc_info: ProcessInfo,
        update: bool,
    ) -> PdResult<()> {
        if container_id.is_empty() || process_id.is_empty() {
            return Err(PdError::BadRequest(
                "process registration needs container id and process id".to_string(),
            ));
        }

        let now = self.clock.now_ms();
        let mut guard = self.state.write().await;
        let inner = &mut *guard;

        let Some(container_state) = inner.containers.get(container_id).map(|c| c.state) else {
            tracing::warn!(
                "Process {} reported for unknown container {}, dropped",
                process_id,
                container_id
            );
            return Ok(());
        };

        if container_state == ContainerState::Terminated && !proc_info.state.is_terminal() {
            tracing::debug!(
                "Container {} is terminated, not allocating process {} ({:?})",
                container_id,
                process_id,
                proc_info.state
            );
            return Ok(());
        }

        // A process lives on one container. A live entry elsewhere moves here;
        // a terminal one elsewhere stays terminal.
        if let Some(previous) = inner.process_index.get(process_id).cloned()
            && previous != container_id
            && let Some(old) = inner.containers.get_mut(&previous)
        {
            if old.dead_procs.contains_key(process_id) {
                tracing::warn!(
                    "Process {} already ended on container {}, report from {} dropped",
                    process_id,
                    previous,
                    container_id
                );
                return Ok(());
            }
            if old.allocation.remove(process_id).is_some() {
                tracing::info!(
                    "Process {} moved from container {} to {}",
                    process_id,
                    previous,
                    container_id
                );
            }
        }

        let Some(entry) = inner.containers.get_mut(container_id) else {
            return Ok(());
        };

        if let Some(dead) = entry.dead_procs.get_mut(process_id) {
            if update && proc_info.state.is_terminal() {
                dead.refresh(proc_info, now);
            } else {
                tracing::debug!(
                    "Process {} already terminal, ignoring {:?}",
                    process_id,
                    proc_info.state
                );
            }
            return Ok(());
        }

        if proc_info.state.is_terminal() {
            let process = match entry.allocation.remove(process_id) {
                Some(mut process) => {
                    process.refresh(proc_info, now);
                    process
                }
                None => ProcessEntry::new(container_id, process_id, proc_info, now),
            };
            tracing::info!(
                "Process {} on container {} is now {:?}",
                process_id,
                container_id,
                process.state
            );
            entry.dead_procs.insert(process_id.to_string(), process);
        } else {
            match entry.allocation.get_mut(process_id) {
                Some(existing) => {
                    if update {
                        existing.refresh(proc_info, now);
                    }
                }
                None => {
                    tracing::debug!(
                        "Process {} allocated on container {} ({:?})",
                        process_id,
                        container_id,
                        proc_info.state
                    );
                    entry.allocation.insert(
                        process_id.to_string(),
                        ProcessEntry::new(container_id, process_id, proc_info, now),
                    );
                }
            }
        }

        inner
            .process_index
            .insert(process_id.to_string(), container_id.to_string());

        Ok(())
    }

    /// Marks RUNNING containers UNKNOWN when they have not been heard from
    /// within their engine's heartbeat threshold. Returns the affected ids.
    pub async fn mark_stale_containers(&self) -> Vec<String> {
        let now = self.clock.now_ms();
        let mut state = self.state.write().await;
        let mut stale = Vec::new();

        for entry in state.containers.values_mut() {
            if entry.state != ContainerState::Running {
                continue;
            }
            let threshold =
                Duration::from_secs(self.engine_settings(&entry.engine).heartbeat_missing_secs);
            if now.saturating_sub(entry.ts_updated) > threshold.as_millis() as u64 {
                tracing::warn!(
                    "Container {} missed heartbeats for {:?}, marking UNKNOWN",
                    entry.container_id,
                    threshold
                );
                entry.state = ContainerState::Unknown;
                stale.push(entry.container_id.clone());
            }
        }

        stale
    }

    // ------------------------------------------------------------------
    // Preconditions
    // ------------------------------------------------------------------

    /// Evaluates the configured preconditions and latches them once they hold.
    pub async fn check_preconditions(&self) -> bool {
        if self.preconditions_satisfied() {
            return true;
        }

        let satisfied = {
            let state = self.state.read().await;
            let running: Vec<&ContainerEntry> = state
                .containers
                .values()
                .filter(|c| c.state == ContainerState::Running)
                .collect();
            let engines: HashSet<&str> = running.iter().map(|c| c.engine.as_str()).collect();

            running.len() >= self.preconditions.min_engines
                && self
                    .preconditions
                    .engines_exist
                    .iter()
                    .all(|name| engines.contains(name.as_str()))
        };

        if satisfied && !self.preconditions_true.send_replace(true) {
            tracing::info!("Process dispatcher preconditions satisfied");
        }

        satisfied
    }

    pub fn preconditions_satisfied(&self) -> bool {
        *self.preconditions_true.borrow()
    }

    /// Waits until the latch is set. With a `timeout`, gives up with
    /// `NotReady` once it passes.
    pub async fn await_preconditions(&self, timeout: Option<Duration>) -> PdResult<()> {
        if self.check_preconditions().await {
            return Ok(());
        }

        let mut rx = self.preconditions_true.subscribe();
        let wait = async {
            let _ = rx.wait_for(|satisfied| *satisfied).await;
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                PdError::NotReady(format!("preconditions not satisfied within {:?}", limit))
            }),
            None => {
                wait.await;
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get_container(&self, container_id: &str) -> Option<ContainerEntry> {
        self.state.read().await.containers.get(container_id).cloned()
    }

    pub async fn get_running_containers(&self) -> Vec<ContainerEntry> {
        let state = self.state.read().await;
        let mut running: Vec<ContainerEntry> = state
            .containers
            .values()
            .filter(|c| c.state == ContainerState::Running)
            .cloned()
            .collect();
        running.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        running
    }

    /// Running containers grouped by engine name, oldest first. Every engine
    /// with a known container has a group, so an engine whose containers all
    /// went away maps to an empty list.
    pub async fn get_engine_containers(&self) -> BTreeMap<String, Vec<ContainerEntry>> {
        let state = self.state.read().await;
        let mut grouped: BTreeMap<String, Vec<ContainerEntry>> = BTreeMap::new();
        for container in state.containers.values() {
            let group = grouped.entry(container.engine.clone()).or_default();
            if container.state == ContainerState::Running {
                group.push(container.clone());
            }
        }
        for containers in grouped.values_mut() {
            containers.sort_by(|a, b| {
                a.created_ms
                    .cmp(&b.created_ms)
                    .then_with(|| a.container_id.cmp(&b.container_id))
            });
        }
        grouped
    }

    pub async fn get_process(&self, process_id: &str) -> Option<ProcessEntry> {
        let state = self.state.read().await;
        let container_id = state.process_index.get(process_id)?;
        let container = state.containers.get(container_id)?;
        container
            .allocation
            .get(process_id)
            .or_else(|| container.dead_procs.get(process_id))
            .cloned()
    }

    pub async fn list_processes(&self) -> Vec<ProcessEntry> {
        let state = self.state.read().await;
        let mut processes: Vec<ProcessEntry> = state
            .containers
            .values()
            .flat_map(|c| c.allocation.values().chain(c.dead_procs.values()))
            .cloned()
            .collect();
        processes.sort_by(|a, b| a.process_id.cmp(&b.process_id));
        processes
    }

    pub async fn container_count(&self) -> usize {
        self.state.read().await.containers.len()
    }
}

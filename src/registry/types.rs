use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerState {
    Running,
    Terminated,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    Requested,
    Waiting,
    Pending,
    Running,
    Terminating,
    Terminated,
    Exited,
    Failed,
    Rejected,
}

impl ProcessState {
    /// Terminal states move a process into `dead_procs` for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Terminated
                | ProcessState::Exited
                | ProcessState::Failed
                | ProcessState::Rejected
        )
    }
}

/// Container metadata held by the resource directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerResource {
    pub container_id: String,
    /// Name under which the container's agent accepts spawn/terminate calls.
    pub cc_agent: String,
    /// Execution engine the container belongs to.
    pub engine: String,
    pub created_ms: u64,
}

/// Process attributes as reported by a heartbeat or lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessInfo {
    pub state: ProcessState,
    #[serde(default)]
    pub process_type: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub service_name: Option<String>,
}

impl ProcessInfo {
    pub fn with_state(state: ProcessState) -> Self {
        Self {
            state,
            process_type: None,
            name: None,
            resource_id: None,
            service_name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessEntry {
    pub process_id: String,
    pub container_id: String,
    pub state: ProcessState,
    pub process_type: Option<String>,
    pub name: Option<String>,
    pub resource_id: Option<String>,
    pub service_name: Option<String>,
    pub ts_updated: u64,
}

impl ProcessEntry {
    pub(crate) fn new(container_id: &str, process_id: &str, info: ProcessInfo, now: u64) -> Self {
        Self {
            process_id: process_id.to_string(),
            container_id: container_id.to_string(),
            state: info.state,
            process_type: info.process_type,
            name: info.name,
            resource_id: info.resource_id,
            service_name: info.service_name,
            ts_updated: now,
        }
    }

    /// Overwrites reported attributes; absent ones keep their old value.
    pub(crate) fn refresh(&mut self, info: ProcessInfo, now: u64) {
        self.state = info.state;
        if info.process_type.is_some() {
            self.process_type = info.process_type;
        }
        if info.name.is_some() {
            self.name = info.name;
        }
        if info.resource_id.is_some() {
            self.resource_id = info.resource_id;
        }
        if info.service_name.is_some() {
            self.service_name = info.service_name;
        }
        self.ts_updated = now;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerEntry {
    pub container_id: String,
    pub cc_agent: String,
    pub engine: String,
    pub created_ms: u64,
    /// Timestamp of the newest accepted event.
    pub ts_event: u64,
    /// Wall-clock time of the last accepted update.
    pub ts_updated: u64,
    pub state: ContainerState,
    pub info: Option<Value>,
    pub allocation: BTreeMap<String, ProcessEntry>,
    pub dead_procs: BTreeMap<String, ProcessEntry>,
}

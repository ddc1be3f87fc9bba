//! Wire shapes of heartbeats and lifecycle events.

use crate::bus::{MessageBus, publish_event};
use crate::registry::types::{ContainerState, ProcessInfo};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CONTAINER_LIFECYCLE_EVENT: &str = "ContainerLifecycleEvent";
pub const PROCESS_LIFECYCLE_EVENT: &str = "ProcessLifecycleEvent";

/// Periodic liveness report of a container and the processes it hosts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerHeartbeat {
    pub container_id: String,
    pub ts: u64,
    pub state: ContainerState,
    #[serde(default)]
    pub processes: Vec<ProcessReport>,
    #[serde(default)]
    pub attributes: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessReport {
    pub process_id: String,
    #[serde(flatten)]
    pub info: ProcessInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerLifecycleEvent {
    /// Container id.
    pub origin: String,
    pub ts_created: u64,
    pub state: ContainerState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessLifecycleEvent {
    /// Process id.
    pub origin: String,
    pub container_id: String,
    pub ts_created: u64,
    #[serde(flatten)]
    pub info: ProcessInfo,
}

/// Any lifecycle event, discriminated by its `type_` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type_")]
pub enum LifecycleEvent {
    ContainerLifecycleEvent(ContainerLifecycleEvent),
    ProcessLifecycleEvent(ProcessLifecycleEvent),
}

impl LifecycleEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            LifecycleEvent::ContainerLifecycleEvent(_) => CONTAINER_LIFECYCLE_EVENT,
            LifecycleEvent::ProcessLifecycleEvent(_) => PROCESS_LIFECYCLE_EVENT,
        }
    }

    /// Publishes the event on its typed event topic.
    pub async fn publish(&self, bus: &dyn MessageBus) -> Result<()> {
        publish_event(bus, self.event_type(), serde_json::to_value(self)?).await
    }
}

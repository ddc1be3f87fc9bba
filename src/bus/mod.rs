//! Message Bus Module
//!
//! The dispatcher talks to the rest of the system through a topic-based
//! publish/subscribe broker with named queues. This module defines the narrow
//! contract the dispatcher depends on and ships an in-process broker.
//!
//! ## Addressing
//! - **Queues**: a named queue has exactly one consumer. Publishing to the
//!   queue name delivers point-to-point (commands, replies).
//! - **Topics**: a queue can be bound to any number of topic names. Publishing
//!   to a topic delivers a copy to every bound queue (heartbeat broadcast,
//!   lifecycle events).
//!
//! ## Submodules
//! - **`memory`**: `InMemoryBus`, a `DashMap`-backed broker over tokio channels.
//! - **`subscriber`**: a listener task with explicit readiness signalling and
//!   bounded join-then-abort teardown.

pub mod memory;
pub mod subscriber;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Topic prefix under which typed lifecycle events are published.
pub const EVENT_TOPIC_PREFIX: &str = "event.";

/// Topic that carries events of one type.
pub fn event_topic(event_type: &str) -> String {
    format!("{}{}", EVENT_TOPIC_PREFIX, event_type)
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Delivers `msg` to the queue named `to` and to every queue bound to the
    /// topic `to`. A message nobody listens for is dropped.
    async fn publish(&self, to: &str, msg: Value) -> Result<()>;

    /// Declares the exclusive queue `queue`, binds it to `bindings` and
    /// returns its consuming end.
    async fn subscribe(&self, queue: &str, bindings: &[String]) -> Result<Subscription>;

    /// Removes the queue and all of its bindings.
    async fn unsubscribe(&self, queue: &str) -> Result<()>;
}

/// Publishes a typed event to its event topic.
pub async fn publish_event(bus: &dyn MessageBus, event_type: &str, body: Value) -> Result<()> {
    bus.publish(&event_topic(event_type), body).await
}

/// Consuming end of a queue.
pub struct Subscription {
    pub queue: String,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    pub fn new(queue: impl Into<String>, rx: mpsc::UnboundedReceiver<Value>) -> Self {
        Self {
            queue: queue.into(),
            rx,
        }
    }

    /// Next message, or `None` once the queue has been removed.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

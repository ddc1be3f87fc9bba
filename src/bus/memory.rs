//! In-process broker.

use super::{MessageBus, Subscription};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Default)]
pub struct InMemoryBus {
    /// Queue name -> sender feeding its single consumer.
    queues: DashMap<String, mpsc::UnboundedSender<Value>>,
    /// Topic name -> bound queue names.
    bindings: DashMap<String, HashSet<String>>,
}

impl InMemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.queues.contains_key(queue)
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    fn targets(&self, to: &str) -> Vec<(String, mpsc::UnboundedSender<Value>)> {
        let mut names: Vec<String> = Vec::new();
        if self.queues.contains_key(to) {
            names.push(to.to_string());
        }
        if let Some(bound) = self.bindings.get(to) {
            for queue in bound.iter() {
                if queue != to {
                    names.push(queue.clone());
                }
            }
        }

        names
            .into_iter()
            .filter_map(|name| {
                let tx = self.queues.get(&name).map(|entry| entry.value().clone());
                tx.map(|tx| (name, tx))
            })
            .collect()
    }

    fn remove_queue(&self, queue: &str) {
        self.queues.remove(queue);
        for mut bound in self.bindings.iter_mut() {
            bound.value_mut().remove(queue);
        }
        self.bindings.retain(|_, bound| !bound.is_empty());
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, to: &str, msg: Value) -> Result<()> {
        let targets = self.targets(to);

        if targets.is_empty() {
            tracing::debug!("No consumer for '{}', message dropped", to);
            return Ok(());
        }

        for (queue, tx) in targets {
            if tx.send(msg.clone()).is_err() {
                tracing::debug!("Queue '{}' lost its consumer, removing", queue);
                self.remove_queue(&queue);
            }
        }

        Ok(())
    }

    async fn subscribe(&self, queue: &str, bindings: &[String]) -> Result<Subscription> {
        if queue.is_empty() {
            anyhow::bail!("queue name must not be empty");
        }

        if let Some(existing) = self.queues.get(queue)
            && !existing.is_closed()
        {
            anyhow::bail!("queue '{}' already has a consumer", queue);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.queues.insert(queue.to_string(), tx);

        for topic in bindings {
            self.bindings
                .entry(topic.clone())
                .or_default()
                .insert(queue.to_string());
        }

        tracing::debug!("Queue '{}' declared with bindings {:?}", queue, bindings);

        Ok(Subscription::new(queue, rx))
    }

    async fn unsubscribe(&self, queue: &str) -> Result<()> {
        self.remove_queue(queue);
        Ok(())
    }
}

use super::types::*;
use crate::bus::subscriber::{Subscriber, message_handler};
use crate::bus::{MessageBus, event_topic};
use crate::registry::service::ProcessRegistry;
use crate::types::InstanceId;

use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Aggregator {
    bus: Arc<dyn MessageBus>,
    registry: Arc<ProcessRegistry>,
    heartbeat_topic: String,
    instance: InstanceId,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Aggregator {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: Arc<ProcessRegistry>,
        heartbeat_topic: &str,
        instance: InstanceId,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            registry,
            heartbeat_topic: heartbeat_topic.to_string(),
            instance,
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn heartbeat_queue(&self) -> String {
        format!("pd_aggregator_{}_{}", self.heartbeat_topic, self.instance)
    }

    pub fn event_queue(&self) -> String {
        format!("pd_aggregator_events_{}", self.instance)
    }

    /// Starts the heartbeat and the lifecycle-event subscriptions. Returns once
    /// both are live.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let aggregator = self.clone();
        let heartbeats = Subscriber::start(
            self.bus.clone(),
            &self.heartbeat_queue(),
            vec![self.heartbeat_topic.clone()],
            message_handler(move |msg| {
                let aggregator = aggregator.clone();
                async move { aggregator.receive_heartbeat(msg).await }
            }),
        )
        .await?;

        let aggregator = self.clone();
        let events = match Subscriber::start(
            self.bus.clone(),
            &self.event_queue(),
            vec![
                event_topic(CONTAINER_LIFECYCLE_EVENT),
                event_topic(PROCESS_LIFECYCLE_EVENT),
            ],
            message_handler(move |msg| {
                let aggregator = aggregator.clone();
                async move { aggregator.receive_event(msg).await }
            }),
        )
        .await
        {
            Ok(events) => events,
            Err(e) => {
                heartbeats.stop(STOP_JOIN_TIMEOUT).await;
                return Err(e);
            }
        };

        let mut subscribers = self.subscribers.lock().await;
        subscribers.push(heartbeats);
        subscribers.push(events);

        tracing::info!("PD aggregator - event and heartbeat subscribers started");
        Ok(())
    }

    pub async fn stop(&self) {
        let subscribers: Vec<Subscriber> = self.subscribers.lock().await.drain(..).collect();
        for subscriber in subscribers {
            subscriber.stop(STOP_JOIN_TIMEOUT).await;
        }
        tracing::info!("PD aggregator stopped");
    }

    pub(crate) async fn receive_heartbeat(&self, msg: Value) {
        let heartbeat: ContainerHeartbeat = match serde_json::from_value(msg) {
            Ok(heartbeat) => heartbeat,
            Err(e) => {
                tracing::warn!("Ignoring malformed container heartbeat: {}", e);
                return;
            }
        };

        tracing::trace!(
            "Heartbeat from {} (ts={}, {} processes)",
            heartbeat.container_id,
            heartbeat.ts,
            heartbeat.processes.len()
        );

        match self
            .registry
            .register_container(
                &heartbeat.container_id,
                heartbeat.ts,
                heartbeat.state,
                heartbeat.attributes,
            )
            .await
        {
            Ok(true) => {}
            // Stale or unknown container: its process list is stale too
            Ok(false) => return,
            Err(e) => {
                tracing::warn!("Heartbeat from {:?} rejected: {}", heartbeat.container_id, e);
                return;
            }
        }

        for report in heartbeat.processes {
            if let Err(e) = self
                .registry
                .register_process(&heartbeat.container_id, &report.process_id, report.info, true)
                .await
            {
                tracing::warn!("Process report {:?} rejected: {}", report.process_id, e);
            }
        }
    }

    pub(crate) async fn receive_event(&self, msg: Value) {
        let event: LifecycleEvent = match serde_json::from_value(msg) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Ignoring malformed lifecycle event: {}", e);
                return;
            }
        };

        let result = match event {
            LifecycleEvent::ContainerLifecycleEvent(event) => {
                self.registry
                    .register_container(&event.origin, event.ts_created, event.state, None)
                    .await
                    .map(|_| ())
            }
            LifecycleEvent::ProcessLifecycleEvent(event) => {
                self.registry
                    .register_process(&event.container_id, &event.origin, event.info, true)
                    .await
            }
        };

        if let Err(e) = result {
            tracing::warn!("Lifecycle event rejected: {}", e);
        }
    }
}

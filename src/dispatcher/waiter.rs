//! One-shot reply address.
//!
//! A waiter owns a uniquely named queue. The name goes out as a command's
//! `reply_to`; the waiter then blocks until the reply for that command shows
//! up or the timeout passes.

use crate::bus::{MessageBus, Subscription};
use crate::engine::types::CommandReply;
use crate::error::{PdError, PdResult};

use std::sync::Arc;
use std::time::Duration;

pub const WAIT_NAME_PREFIX: &str = "asyncresult_";

pub struct ResultWaiter {
    bus: Arc<dyn MessageBus>,
    wait_name: String,
    subscription: Option<Subscription>,
}

impl ResultWaiter {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            wait_name: format!("{}{}", WAIT_NAME_PREFIX, uuid::Uuid::new_v4().simple()),
            subscription: None,
        }
    }

    pub fn wait_name(&self) -> &str {
        &self.wait_name
    }

    pub fn is_active(&self) -> bool {
        self.subscription.is_some()
    }

    /// Declares the reply queue and returns its name. The queue exists when
    /// this returns, so a reply cannot overtake the subscription.
    pub async fn activate(&mut self) -> PdResult<String> {
        if self.subscription.is_some() {
            return Err(PdError::BadRequest("waiter already active".to_string()));
        }
        let subscription = self
            .bus
            .subscribe(&self.wait_name, &[])
            .await
            .map_err(|e| PdError::Bus(e.to_string()))?;
        self.subscription = Some(subscription);
        Ok(self.wait_name.clone())
    }

    /// Waits for the reply to `request_id`, or for any reply when no id is
    /// given. Replies for other requests are logged and skipped. The queue is
    /// torn down afterwards whatever the outcome.
    pub async fn wait(
        &mut self,
        timeout: Option<Duration>,
        request_id: Option<&str>,
    ) -> PdResult<CommandReply> {
        let Some(mut subscription) = self.subscription.take() else {
            return Err(PdError::BadRequest("waiter not active".to_string()));
        };

        let receive = receive_reply(&mut subscription, request_id);
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, receive).await.unwrap_or_else(|_| {
                Err(PdError::Timeout(format!(
                    "no reply on '{}' within {:?}",
                    self.wait_name, limit
                )))
            }),
            None => receive.await,
        };

        if let Err(e) = self.bus.unsubscribe(&self.wait_name).await {
            tracing::debug!("Failed to remove reply queue '{}': {}", self.wait_name, e);
        }
        outcome
    }
}

async fn receive_reply(
    subscription: &mut Subscription,
    request_id: Option<&str>,
) -> PdResult<CommandReply> {
    loop {
        let Some(msg) = subscription.recv().await else {
            return Err(PdError::Shutdown(format!(
                "reply queue '{}' closed",
                subscription.queue
            )));
        };

        let reply: CommandReply = match serde_json::from_value(msg) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("Ignoring malformed reply on '{}': {}", subscription.queue, e);
                continue;
            }
        };

        match request_id {
            Some(expected) if reply.request_id != expected => {
                tracing::warn!(
                    "Received result for different request: {} (waiting for {})",
                    reply.request_id,
                    expected
                );
            }
            _ => return Ok(reply),
        }
    }
}

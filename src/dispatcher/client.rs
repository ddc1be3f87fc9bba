use super::waiter::ResultWaiter;
use crate::bus::MessageBus;
use crate::engine::types::*;
use crate::error::{PdError, PdResult};
use crate::types::CommandId;

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Publishes dispatcher commands. Every call returns the generated command id
/// without waiting for the command to run.
#[derive(Clone)]
pub struct ProcessDispatcherClient {
    bus: Arc<dyn MessageBus>,
    command_queue: String,
}

impl ProcessDispatcherClient {
    pub fn new(bus: Arc<dyn MessageBus>, command_queue: &str) -> Self {
        Self {
            bus,
            command_queue: command_queue.to_string(),
        }
    }

    pub async fn start_rel(&self, rel_def: RelDef, reply_to: Option<String>) -> PdResult<CommandId> {
        self.submit(CommandBody::StartRel { rel_def }, reply_to)
            .await
    }

    /// Submits `rel_def` and waits for its reply on a private queue.
    pub async fn start_rel_blocking(
        &self,
        rel_def: RelDef,
        timeout: Option<Duration>,
    ) -> PdResult<CommandReply> {
        let mut waiter = ResultWaiter::new(self.bus.clone());
        let reply_to = waiter.activate().await?;
        let command_id = self.start_rel(rel_def, Some(reply_to)).await?;
        waiter.wait(timeout, Some(&command_id.0)).await
    }

    pub async fn schedule(
        &self,
        process_id: Option<String>,
        process_definition: ProcessDefinition,
        schedule: Option<Value>,
        configuration: Option<Value>,
        name: Option<String>,
        reply_to: Option<String>,
    ) -> PdResult<CommandId> {
        self.submit(
            CommandBody::Schedule {
                process_id,
                process_definition,
                schedule,
                configuration,
                name,
            },
            reply_to,
        )
        .await
    }

    pub async fn cancel(&self, process_id: &str, reply_to: Option<String>) -> PdResult<CommandId> {
        self.submit(
            CommandBody::Cancel {
                process_id: process_id.to_string(),
            },
            reply_to,
        )
        .await
    }

    pub async fn list(&self, reply_to: Option<String>) -> PdResult<CommandId> {
        self.submit(CommandBody::List, reply_to).await
    }

    async fn submit(&self, body: CommandBody, reply_to: Option<String>) -> PdResult<CommandId> {
        let envelope = CommandEnvelope::new(body, reply_to);
        let msg = serde_json::to_value(&envelope)
            .map_err(|e| PdError::BadRequest(format!("unencodable command: {}", e)))?;

        self.bus
            .publish(&self.command_queue, msg)
            .await
            .map_err(|e| PdError::Bus(e.to_string()))?;

        tracing::debug!(
            "Submitted {} command {}",
            envelope.body.verb(),
            envelope.command_id
        );
        Ok(envelope.command_id)
    }
}

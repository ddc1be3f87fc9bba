use super::rules::DispatchRules;
use super::types::*;
use crate::bus::MessageBus;
use crate::bus::subscriber::{Subscriber, message_handler};
use crate::config::EngineConfig;
use crate::error::{PdError, PdResult};
use crate::executor::executor::ActionExecutor;
use crate::executor::types::{Action, SpawnProcess, TerminateProcess};
use crate::leader::service::LeaderManager;
use crate::registry::service::ProcessRegistry;

use anyhow::Result;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Upper bound for replicas of one app regardless of configuration.
const MAX_REPLICAS: i64 = 100;

pub struct DecisionEngine {
    config: EngineConfig,
    command_queue: String,
    rules: DispatchRules,
    bus: Arc<dyn MessageBus>,
    registry: Arc<ProcessRegistry>,
    executor: Arc<ActionExecutor>,
    /// Commands are refused unless this manager reports leadership.
    leader: Option<Arc<LeaderManager>>,
    subscriber: Mutex<Option<Subscriber>>,
    /// Set on stop; releases commands parked on the preconditions latch.
    stopped: watch::Sender<bool>,
}

impl DecisionEngine {
    pub fn new(
        config: EngineConfig,
        command_queue: &str,
        bus: Arc<dyn MessageBus>,
        registry: Arc<ProcessRegistry>,
        executor: Arc<ActionExecutor>,
        leader: Option<Arc<LeaderManager>>,
    ) -> PdResult<Arc<Self>> {
        let rules = DispatchRules::compile(&config.dispatch_rules, &config.default_engine)?;
        let (stopped, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            command_queue: command_queue.to_string(),
            rules,
            bus,
            registry,
            executor,
            leader,
            subscriber: Mutex::new(None),
            stopped,
        }))
    }

    pub fn command_queue(&self) -> &str {
        &self.command_queue
    }

    /// Clears a previous stop and subscribes to the command queue. Returns
    /// once the queue is live.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        self.stopped.send_replace(false);
        self.activate().await
    }

    /// Subscribes to the command queue unless already subscribed.
    pub async fn activate(self: Arc<Self>) -> Result<()> {
        let mut subscriber = self.subscriber.lock().await;
        if subscriber.is_some() {
            return Ok(());
        }

        let engine = self.clone();
        *subscriber = Some(
            Subscriber::start(
                self.bus.clone(),
                &self.command_queue,
                Vec::new(),
                message_handler(move |msg| {
                    let engine = engine.clone();
                    async move { engine.receive_command(msg).await }
                }),
            )
            .await?,
        );

        tracing::info!("PD decision engine listening on '{}'", self.command_queue);
        Ok(())
    }

    /// Leaves the command queue to whoever leads next.
    pub async fn deactivate(&self) {
        if let Some(subscriber) = self.subscriber.lock().await.take() {
            subscriber.stop(STOP_JOIN_TIMEOUT).await;
            tracing::info!("PD decision engine left '{}'", self.command_queue);
        }
    }

    pub async fn is_active(&self) -> bool {
        self.subscriber.lock().await.is_some()
    }

    pub async fn stop(&self) {
        self.stopped.send_replace(true);
        self.deactivate().await;
        tracing::info!("PD decision engine stopped");
    }

    pub(crate) async fn receive_command(&self, msg: Value) {
        let envelope: CommandEnvelope = match serde_json::from_value(msg.clone()) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Received malformed command: {}", e);
                let command_id = msg.get("command_id").and_then(Value::as_str);
                let reply_to = msg.get("reply_to").and_then(Value::as_str);
                if let (Some(command_id), Some(reply_to)) = (command_id, reply_to) {
                    let err = PdError::BadRequest(format!("malformed command: {}", e));
                    self.send_reply(reply_to, CommandReply::error(command_id, &err))
                        .await;
                }
                return;
            }
        };

        let outcome = self.execute_command(&envelope).await;

        let Some(reply_to) = &envelope.reply_to else {
            return;
        };
        let request_id = &envelope.command_id.0;
        let reply = match outcome {
            Ok(result) => CommandReply::ok(request_id, result),
            Err(e) => CommandReply::error(request_id, &e),
        };
        self.send_reply(reply_to, reply).await;
    }

    /// Runs one command through the gates and its handler.
    pub async fn execute_command(&self, envelope: &CommandEnvelope) -> PdResult<Value> {
        self.await_preconditions().await?;

        if let Some(leader) = &self.leader
            && !leader.is_leader().await
        {
            return Err(PdError::NotLeader(format!(
                "{} does not lead scope '{}'",
                leader.holder(),
                leader.scope()
            )));
        }

        let verb = envelope.body.verb();
        tracing::debug!("PD execute command {} ({})", verb, envelope.command_id);

        let result = match &envelope.body {
            CommandBody::StartRel { rel_def } => self.cmd_start_rel(rel_def).await,
            CommandBody::Schedule {
                process_id,
                process_definition,
                schedule,
                configuration,
                name,
            } => {
                if schedule.is_some() {
                    tracing::debug!("Ignoring schedule constraints of {}", envelope.command_id);
                }
                self.cmd_schedule(
                    process_id.clone(),
                    process_definition,
                    configuration.clone(),
                    name.clone(),
                )
                .await
            }
            CommandBody::Cancel { process_id } => self.cmd_cancel(process_id).await,
            CommandBody::List => self.cmd_list().await,
        };

        if let Err(e) = &result {
            tracing::warn!("Command {} ({}) failed: {}", verb, envelope.command_id, e);
        }
        result
    }

    async fn await_preconditions(&self) -> PdResult<()> {
        let mut stopped = self.stopped.subscribe();
        tokio::select! {
            biased;
            ready = self.registry.await_preconditions(self.config.preconditions_timeout()) => ready,
            _ = stopped.wait_for(|stopped| *stopped) => {
                Err(PdError::Shutdown("decision engine stopped".to_string()))
            }
        }
    }

    async fn send_reply(&self, reply_to: &str, reply: CommandReply) {
        let msg = match serde_json::to_value(&reply) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!("Failed to encode reply {}: {}", reply.request_id, e);
                return;
            }
        };
        if let Err(e) = self.bus.publish(reply_to, msg).await {
            tracing::warn!("Failed to send reply to '{}': {}", reply_to, e);
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn cmd_start_rel(&self, rel_def: &RelDef) -> PdResult<Value> {
        tracing::debug!("Start rel {:?}", rel_def.name);
        let mut process_ids = Vec::new();

        for app in &rel_def.apps {
            let Some((name, module, cls)) = &app.processapp else {
                tracing::warn!("App {} has no process definition, not supported", app.name);
                continue;
            };

            let cc_agent = self.determine_target_container(&app.name).await?;
            let replicas = self.replica_count(&app.name, app.replicas);

            for i in 0..replicas {
                let proc_name = if i == 0 {
                    name.clone()
                } else {
                    format!("{}.{}", name, i)
                };
                let process_id = self
                    .spawn(SpawnProcess {
                        cc_agent: cc_agent.clone(),
                        proc_name,
                        module: module.clone(),
                        cls: cls.clone(),
                        config: app.config.clone(),
                        process_id: None,
                    })
                    .await?;
                process_ids.push(process_id);
            }
        }

        Ok(json!({ "processes": process_ids }))
    }

    async fn cmd_schedule(
        &self,
        process_id: Option<String>,
        definition: &ProcessDefinition,
        configuration: Option<Value>,
        name: Option<String>,
    ) -> PdResult<Value> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = name.unwrap_or_else(|| format!("{}-{}", definition.name, &suffix[..8]));
        let process_id = process_id.unwrap_or_else(|| format!("{}_{}", definition.name, suffix));

        let cc_agent = self.determine_target_container(&definition.name).await?;
        let process_id = self
            .spawn(SpawnProcess {
                cc_agent,
                proc_name: name,
                module: definition.module.clone(),
                cls: definition.cls.clone(),
                config: configuration,
                process_id: Some(process_id),
            })
            .await?;

        Ok(Value::String(process_id))
    }

    async fn cmd_cancel(&self, process_id: &str) -> PdResult<Value> {
        let process = self
            .registry
            .get_process(process_id)
            .await
            .ok_or_else(|| PdError::NotFound(format!("process {}", process_id)))?;

        if process.state.is_terminal() {
            tracing::debug!("Process {} already {:?}", process_id, process.state);
            return Ok(Value::Bool(false));
        }

        let container = self
            .registry
            .get_container(&process.container_id)
            .await
            .ok_or_else(|| PdError::NotFound(format!("container {}", process.container_id)))?;

        self.executor
            .execute_action(Action::TerminateProcess(TerminateProcess {
                cc_agent: container.cc_agent,
                process_id: process_id.to_string(),
            }))
            .await
    }

    async fn cmd_list(&self) -> PdResult<Value> {
        serde_json::to_value(self.registry.list_processes().await)
            .map_err(|e| PdError::Action(format!("failed to encode process list: {}", e)))
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn determine_target_container(&self, app_name: &str) -> PdResult<String> {
        let groups = self.registry.get_engine_containers().await;
        let container = self.rules.select_container(app_name, &groups, |engine| {
            self.registry.engine_settings(engine)
        })?;
        Ok(container.cc_agent)
    }

    /// Requested replicas, capped by configuration and clamped to
    /// `1..=MAX_REPLICAS`. Out-of-range requests fall back to one.
    fn replica_count(&self, app_name: &str, requested: Option<i64>) -> i64 {
        let Some(mut replicas) = requested else {
            return 1;
        };

        let max = i64::from(self.config.max_proc_replicas);
        if max > 0 && replicas > max {
            tracing::warn!(
                "Limiting number of replicas of {} to {} from {}",
                app_name,
                max,
                replicas
            );
            replicas = max;
        }
        if !(1..=MAX_REPLICAS).contains(&replicas) {
            tracing::warn!("Invalid number of replicas for {}: {}", app_name, replicas);
            replicas = 1;
        }
        replicas
    }

    async fn spawn(&self, request: SpawnProcess) -> PdResult<String> {
        let proc_name = request.proc_name.clone();
        let result = self
            .executor
            .execute_action(Action::SpawnProcess(request))
            .await?;

        match result {
            Value::String(process_id) => {
                tracing::debug!("Spawned {} as {}", proc_name, process_id);
                Ok(process_id)
            }
            other => Err(PdError::Action(format!(
                "spawn of {} returned {} instead of a process id",
                proc_name, other
            ))),
        }
    }
}

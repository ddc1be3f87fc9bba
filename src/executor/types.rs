use crate::error::{PdError, PdResult};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpawnProcess {
    /// Container agent that should host the process.
    pub cc_agent: String,
    pub proc_name: String,
    pub module: String,
    pub cls: String,
    #[serde(default)]
    pub config: Option<Value>,
    /// Requested process id; the backend picks one when absent.
    #[serde(default)]
    pub process_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TerminateProcess {
    pub cc_agent: String,
    pub process_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    SpawnProcess,
    TerminateProcess,
}

impl ActionKind {
    pub const ALL: [ActionKind; 2] = [ActionKind::SpawnProcess, ActionKind::TerminateProcess];

    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::SpawnProcess => "spawn_process",
            ActionKind::TerminateProcess => "terminate_process",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

/// Every action the executor knows how to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    SpawnProcess(SpawnProcess),
    TerminateProcess(TerminateProcess),
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::SpawnProcess(_) => ActionKind::SpawnProcess,
            Action::TerminateProcess(_) => ActionKind::TerminateProcess,
        }
    }

    /// Builds an action from an untyped `(name, kwargs)` pair.
    pub fn from_parts(name: &str, kwargs: Value) -> PdResult<Self> {
        let kind = ActionKind::from_name(name)
            .ok_or_else(|| PdError::BadRequest(format!("invalid action '{}'", name)))?;

        if !kwargs.is_object() {
            return Err(PdError::BadRequest(format!(
                "arguments of action '{}' must be an object",
                name
            )));
        }

        let invalid = |e: serde_json::Error| {
            PdError::BadRequest(format!("invalid arguments for '{}': {}", name, e))
        };

        match kind {
            ActionKind::SpawnProcess => serde_json::from_value(kwargs)
                .map(Action::SpawnProcess)
                .map_err(invalid),
            ActionKind::TerminateProcess => serde_json::from_value(kwargs)
                .map(Action::TerminateProcess)
                .map_err(invalid),
        }
    }
}

pub type ActionOutcome = PdResult<Value>;

/// Write end of an action's outcome. Resolving consumes it, so an outcome
/// can only be written once.
#[derive(Debug)]
pub struct ResultSlot {
    tx: oneshot::Sender<ActionOutcome>,
}

impl ResultSlot {
    pub fn new() -> (ResultSlot, ActionResult) {
        let (tx, rx) = oneshot::channel();
        (ResultSlot { tx }, ActionResult { rx })
    }

    /// Returns false if nobody is waiting any more.
    pub fn resolve(self, outcome: ActionOutcome) -> bool {
        self.tx.send(outcome).is_ok()
    }
}

/// Read end of an action's outcome.
#[derive(Debug)]
pub struct ActionResult {
    rx: oneshot::Receiver<ActionOutcome>,
}

impl ActionResult {
    /// Blocks until the action resolves. A slot dropped without a value
    /// (abandoned during shutdown) reads as a shutdown error.
    pub async fn wait(self) -> ActionOutcome {
        self.rx
            .await
            .unwrap_or_else(|_| Err(PdError::Shutdown("action abandoned".to_string())))
    }
}

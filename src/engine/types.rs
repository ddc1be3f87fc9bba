use crate::error::PdError;
use crate::types::CommandId;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// A command as it travels on the command queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandEnvelope {
    pub command_id: CommandId,
    /// Where the reply goes. Commands without one are fire-and-forget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(flatten)]
    pub body: CommandBody,
}

impl CommandEnvelope {
    pub fn new(body: CommandBody, reply_to: Option<String>) -> Self {
        Self {
            command_id: CommandId::new(),
            reply_to,
            body,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommandBody {
    StartRel {
        rel_def: RelDef,
    },
    Schedule {
        #[serde(default)]
        process_id: Option<String>,
        process_definition: ProcessDefinition,
        #[serde(default)]
        schedule: Option<Value>,
        #[serde(default)]
        configuration: Option<Value>,
        #[serde(default)]
        name: Option<String>,
    },
    Cancel {
        process_id: String,
    },
    List,
}

impl CommandBody {
    pub fn verb(&self) -> &'static str {
        match self {
            CommandBody::StartRel { .. } => "start_rel",
            CommandBody::Schedule { .. } => "schedule",
            CommandBody::Cancel { .. } => "cancel",
            CommandBody::List => "list",
        }
    }
}

/// Deployment descriptor: a list of apps to start.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelDef {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub apps: Vec<RelApp>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelApp {
    pub name: String,
    /// `(name, module, class)` of the process to start.
    #[serde(default)]
    pub processapp: Option<(String, String, String)>,
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub replicas: Option<i64>,
}

impl RelApp {
    pub fn process(name: &str, module: &str, cls: &str) -> Self {
        Self {
            name: name.to_string(),
            processapp: Some((name.to_string(), module.to_string(), cls.to_string())),
            config: None,
            replicas: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessDefinition {
    pub name: String,
    pub module: String,
    #[serde(rename = "class")]
    pub cls: String,
}

/// Answer to a command, correlated through `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandReply {
    pub request_id: String,
    #[serde(default)]
    pub result: Value,
    pub status: u16,
}

impl CommandReply {
    pub fn ok(request_id: &str, result: Value) -> Self {
        Self {
            request_id: request_id.to_string(),
            result,
            status: 200,
        }
    }

    pub fn error(request_id: &str, err: &PdError) -> Self {
        Self {
            request_id: request_id.to_string(),
            result: json!({ "message": err.to_string() }),
            status: err.status(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

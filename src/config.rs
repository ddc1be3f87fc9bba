//! Process dispatcher configuration block.
//!
//! Every field carries a default so a partial JSON document (or none at all)
//! yields a usable configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_COMMAND_QUEUE: &str = "pd_command";
pub const DEFAULT_HEARTBEAT_TOPIC: &str = "bx_containers";
pub const DEFAULT_LEADER_SCOPE: &str = "PD";

/// Upper bound on executor workers regardless of configuration.
pub const MAX_POOL_SIZE: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PdConfig {
    pub command_queue: String,
    pub heartbeat_topic: String,
    pub leader: LeaderConfig,
    pub executor: ExecutorConfig,
    pub engine: EngineConfig,
    /// Per-engine capacity and liveness thresholds, keyed by engine name.
    pub engines: HashMap<String, EngineSettings>,
    pub preconditions: PreconditionConfig,
}

impl Default for PdConfig {
    fn default() -> Self {
        Self {
            command_queue: DEFAULT_COMMAND_QUEUE.to_string(),
            heartbeat_topic: DEFAULT_HEARTBEAT_TOPIC.to_string(),
            leader: LeaderConfig::default(),
            executor: ExecutorConfig::default(),
            engine: EngineConfig::default(),
            engines: HashMap::new(),
            preconditions: PreconditionConfig::default(),
        }
    }
}

impl PdConfig {
    /// Loads a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    pub scope: String,
    pub interval_secs: u64,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            scope: DEFAULT_LEADER_SCOPE.to_string(),
            interval_secs: 60,
        }
    }
}

impl LeaderConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Remote calls to container agents.
    #[default]
    Agent,
    /// Spawn in the local container.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub kind: ExecutorKind,
    pub pool_size: usize,
    /// Artificial delay before the local variant really spawns.
    pub spawn_delay_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::Agent,
            pool_size: 5,
            spawn_delay_ms: 0,
            shutdown_timeout_ms: 2000,
        }
    }
}

impl ExecutorConfig {
    /// Pool size clamped to `1..=MAX_POOL_SIZE`.
    pub fn effective_pool_size(&self) -> usize {
        self.pool_size.clamp(1, MAX_POOL_SIZE)
    }

    pub fn spawn_delay(&self) -> Duration {
        Duration::from_millis(self.spawn_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchRule {
    pub appname_pattern: String,
    pub engine: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_engine: String,
    pub dispatch_rules: Vec<DispatchRule>,
    /// Replica cap for `start_rel`; 0 disables the cap.
    pub max_proc_replicas: u32,
    /// Ceiling on the preconditions wait. `None` waits until stopped.
    pub preconditions_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_engine: "default".to_string(),
            dispatch_rules: Vec::new(),
            max_proc_replicas: 0,
            preconditions_timeout_secs: None,
        }
    }
}

impl EngineConfig {
    pub fn preconditions_timeout(&self) -> Option<Duration> {
        self.preconditions_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineSettings {
    /// Processes a container of this engine can host before it counts as full.
    pub slots: usize,
    pub heartbeat_missing_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            slots: 100,
            heartbeat_missing_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct PreconditionConfig {
    /// Minimum number of running containers.
    pub min_engines: usize,
    /// Engine names that need at least one running container.
    pub engines_exist: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let cfg = PdConfig::from_json("{}").unwrap();

        assert_eq!(cfg.command_queue, "pd_command");
        assert_eq!(cfg.leader.interval_secs, 60);
        assert_eq!(cfg.executor.kind, ExecutorKind::Agent);
        assert_eq!(cfg.executor.pool_size, 5);
        assert!(cfg.engine.preconditions_timeout().is_none());
    }

    #[test]
    fn test_partial_document_overrides() {
        let cfg = PdConfig::from_json(
            r#"{
                "command_queue": "pd_cmd_test",
                "executor": {"kind": "local", "pool_size": 500},
                "engine": {"max_proc_replicas": 10,
                           "dispatch_rules": [{"appname_pattern": "^ingest", "engine": "ingest"}]},
                "engines": {"ingest": {"slots": 4}},
                "preconditions": {"min_engines": 2, "engines_exist": ["ingest"]}
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.command_queue, "pd_cmd_test");
        assert_eq!(cfg.executor.kind, ExecutorKind::Local);
        assert_eq!(cfg.executor.effective_pool_size(), MAX_POOL_SIZE);
        assert_eq!(cfg.engine.max_proc_replicas, 10);
        assert_eq!(cfg.engine.dispatch_rules[0].engine, "ingest");
        assert_eq!(cfg.engines["ingest"].slots, 4);
        assert_eq!(cfg.engines["ingest"].heartbeat_missing_secs, 30);
        assert!(!cfg.engines.contains_key("other"));
        assert_eq!(cfg.preconditions.min_engines, 2);
    }

    #[test]
    fn test_pool_size_never_zero() {
        let cfg = ExecutorConfig {
            pool_size: 0,
            ..Default::default()
        };
        assert_eq!(cfg.effective_pool_size(), 1);
    }
}

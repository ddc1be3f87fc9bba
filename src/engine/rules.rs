//! Where processes go.
//!
//! An app name is matched against the configured rules in order; the first
//! pattern matching at the start of the name picks the engine. Within the
//! engine the oldest container with a free slot wins.

use crate::config::{DispatchRule, EngineSettings};
use crate::error::{PdError, PdResult};
use crate::registry::types::ContainerEntry;

use regex::Regex;
use std::collections::BTreeMap;

/// Engine name used by containers that do not declare one.
pub const UNNAMED_ENGINE: &str = "";

pub struct DispatchRules {
    rules: Vec<(Regex, String)>,
    default_engine: String,
}

impl DispatchRules {
    /// Compiles every pattern up front; a bad pattern is a usage error.
    pub fn compile(rules: &[DispatchRule], default_engine: &str) -> PdResult<Self> {
        let compiled = rules
            .iter()
            .map(|rule| {
                Regex::new(&format!("^(?:{})", rule.appname_pattern))
                    .map(|re| (re, rule.engine.clone()))
                    .map_err(|e| {
                        PdError::BadRequest(format!(
                            "invalid dispatch rule pattern '{}': {}",
                            rule.appname_pattern, e
                        ))
                    })
            })
            .collect::<PdResult<Vec<_>>>()?;

        Ok(Self {
            rules: compiled,
            default_engine: default_engine.to_string(),
        })
    }

    pub fn target_engine(&self, app_name: &str) -> &str {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.is_match(app_name))
            .map(|(_, engine)| engine.as_str())
            .unwrap_or(self.default_engine.as_str())
    }

    /// Picks the container that should host `app_name`.
    ///
    /// Tries the rule's engine, then the default engine, then the unnamed
    /// engine, taking the first that has running containers.
    pub fn select_container<F>(
        &self,
        app_name: &str,
        groups: &BTreeMap<String, Vec<ContainerEntry>>,
        settings: F,
    ) -> PdResult<ContainerEntry>
    where
        F: Fn(&str) -> EngineSettings,
    {
        let target = self.target_engine(app_name);
        let candidates = [target, self.default_engine.as_str(), UNNAMED_ENGINE];

        let Some((engine, containers)) = candidates
            .iter()
            .filter_map(|engine| groups.get(*engine).map(|group| (*engine, group)))
            .find(|(_, group)| !group.is_empty())
        else {
            if candidates.iter().any(|engine| groups.contains_key(*engine)) {
                return Err(PdError::BadRequest(format!(
                    "no running containers for app {}",
                    app_name
                )));
            }
            return Err(PdError::BadRequest(format!(
                "could not determine engine for app {}",
                app_name
            )));
        };

        let slots = settings(engine).slots;
        let chosen = containers
            .iter()
            .find(|c| c.allocation.len() < slots)
            .unwrap_or(&containers[0]);

        tracing::debug!(
            "Dispatch app {} to container {} (engine '{}')",
            app_name,
            chosen.container_id,
            engine
        );
        Ok(chosen.clone())
    }
}

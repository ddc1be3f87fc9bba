//! Action Executor Module
//!
//! Turns abstract dispatcher actions into concrete spawn/terminate calls.
//!
//! ## Architecture Overview
//! 1. **Submission**: callers hand over an `Action` together with the
//!    `ResultSlot` that will receive its outcome. Loosely-typed submissions
//!    are validated up front and rejected on the spot.
//! 2. **Queueing**: accepted actions go onto a single channel, the only
//!    synchronization point between submitters and workers.
//! 3. **Execution**: a bounded pool of workers pulls actions and runs each in
//!    its own task against an `ActionBackend`; success values and errors
//!    (panics included) end up in the slot.
//! 4. **Shutdown**: workers finish in-flight actions within a bounded join,
//!    stragglers are aborted and still-queued actions resolve with a shutdown
//!    error.
//!
//! ## Submodules
//! - **`types`**: the closed `Action` set and the one-shot result slot.
//! - **`agent`**: backend that calls remote container agents.
//! - **`local`**: backend that spawns in the local container.
//! - **`executor`**: the worker pool.

pub mod agent;
pub mod executor;
pub mod local;
pub mod types;

use self::types::{SpawnProcess, TerminateProcess};

use anyhow::Result;
use async_trait::async_trait;

/// Where actions are actually carried out.
#[async_trait]
pub trait ActionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Spawns a process and returns its id.
    async fn spawn_process(&self, request: &SpawnProcess) -> Result<String>;

    async fn terminate_process(&self, request: &TerminateProcess) -> Result<bool>;

    /// Releases backend resources; called once the pool has stopped.
    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests;

//! Process Registry Module
//!
//! The authoritative view of which containers are alive and which processes
//! run where, folded together from heartbeats and lifecycle events.
//!
//! ## Convergence Rules
//! - **Per-container ordering**: an event whose timestamp is older than the
//!   stored one is ignored, except a TERMINATED state, which always applies so
//!   a late heartbeat cannot resurrect a crashed container.
//! - **Process placement**: a process id lives in exactly one of a container's
//!   `allocation` (live) or `dead_procs` (terminal) maps and only ever moves
//!   from the first to the second.
//! - **Startup gate**: the preconditions latch flips once and stays flipped.
//!
//! ## Submodules
//! - **`directory`**: resource directory contract used to resolve container
//!   metadata once per container id.
//! - **`service`**: `ProcessRegistry` itself.

pub mod directory;
pub mod service;
pub mod types;

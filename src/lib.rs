//! Process Dispatcher Library
//!
//! This library crate defines the components of a leader-elected process
//! dispatcher. It serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! The dispatcher is assembled from loosely coupled subsystems, leaf-first:
//!
//! - **`bus`**: Topic-based publish/subscribe with exclusive named queues, and the
//!   readiness-synchronized `Subscriber` every listening component uses.
//! - **`leader`**: Lease-based leader election against an atomic lock store, with
//!   lazy expiry detection and callback notification.
//! - **`registry`**: The authoritative container/process map folded from heartbeats
//!   and lifecycle events, plus the one-way startup preconditions latch.
//! - **`aggregator`**: Subscribes to heartbeats and lifecycle events and feeds the
//!   registry.
//! - **`executor`**: A bounded worker pool turning spawn/terminate actions into calls
//!   on a remote container agent or the local container.
//! - **`engine`**: The command front end. Waits for readiness, dispatches commands to
//!   handlers and publishes correlated replies.
//! - **`dispatcher`**: The orchestrator that sequences startup and shutdown, the
//!   command client and the reply waiter.
//! - **`container`**: An in-process simulated container used by the binary and tests.

pub mod aggregator;
pub mod bus;
pub mod clock;
pub mod config;
pub mod container;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod executor;
pub mod leader;
pub mod registry;
pub mod types;

//! Decision Engine Module
//!
//! The command-processing front end of the dispatcher. Commands arrive on a
//! point-to-point queue, wait for the cluster to become ready, are turned into
//! executor actions and answered on the caller's reply-to address.
//!
//! ## Command Lifecycle
//! 1. **Received**: the envelope is parsed; unparseable commands are answered
//!    with status 400 when they carry enough to be answered at all.
//! 2. **Gated**: the registry's preconditions latch must be set and this
//!    instance must hold the leader lease.
//! 3. **Dispatched**: the verb selects its handler through an exhaustive match.
//! 4. **Completed / Failed**: status 200 with the handler's result, or the
//!    error's status code with its message.
//!
//! ## Submodules
//! - **`types`**: command and reply wire shapes.
//! - **`rules`**: app-name to engine dispatch rules and container selection.
//! - **`service`**: `DecisionEngine`.

pub mod rules;
pub mod service;
pub mod types;

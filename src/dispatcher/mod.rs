//! Process Dispatcher Module
//!
//! Wires the dispatcher components together and gives callers a way in.
//!
//! ## Startup Order
//! Leader election, then the first leadership determination, then registry,
//! executor, decision engine and aggregator. Shutdown runs the same list
//! backwards. The engine never sees a command before the registry exists, and
//! the aggregator never feeds a registry that is not there yet.
//!
//! ## Submodules
//! - **`service`**: `ProcessDispatcher`, the orchestrator.
//! - **`client`**: `ProcessDispatcherClient`, publishes commands.
//! - **`waiter`**: `ResultWaiter`, a private reply queue for one command.

pub mod client;
pub mod service;
pub mod waiter;

//! Aggregator Module
//!
//! Feeds the registry from the outside world: container heartbeats arrive on
//! a broadcast topic, container and process state transitions arrive as typed
//! lifecycle events. The aggregator only maps messages onto registry calls;
//! anything it cannot parse is logged and skipped.

pub mod service;
pub mod types;

//! Simulated Container Module
//!
//! An in-process stand-in for a capability container. It answers container
//! agent calls, serves as the local process manager and broadcasts heartbeats,
//! which is everything the dispatcher needs from a real container.

pub mod simulated;

pub use simulated::SimulatedContainer;

#[cfg(test)]
mod tests;

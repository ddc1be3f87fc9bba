//! Leader Election Module
//!
//! Determines a single active leader among peer dispatcher instances sharing a
//! scope. Election rides on an atomic "acquire-if-absent-or-expired" lock with
//! a timeout in a shared store.
//!
//! ## Guarantees
//! - **Never two leaders**: a lease is only granted when the stored one is
//!   absent, expired or already ours.
//! - **Eventual takeover**: a crashed leader stops renewing, its lease expires
//!   after 1.5x the renewal interval and the next peer poll claims it.
//! - **No stale belief**: `is_leader` re-checks the local expiry on every call
//!   and gives up leadership it can no longer prove.
//!
//! There is no guarantee that a leader always exists, e.g. in the window
//! between a leader crash and lease expiry.

pub mod service;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;

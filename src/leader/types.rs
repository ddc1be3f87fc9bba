use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Structured notification handed to leader callbacks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action")]
pub enum LeaderEvent {
    #[serde(rename = "acquire_leader")]
    Acquired {
        scope: String,
        process_id: String,
        /// Local lease expiry in epoch milliseconds.
        expires: u64,
    },

    #[serde(rename = "release_leader")]
    Released { scope: String, process_id: String },

    #[serde(rename = "error")]
    Error {
        scope: String,
        process_id: String,
        err_type: String,
    },
}

pub type LeaderCallback = Arc<dyn Fn(&LeaderEvent) + Send + Sync>;

/// A lease as recorded by a lock store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRecord {
    pub holder: String,
    pub expires_ms: u64,
}

/// Leadership as this instance currently believes it.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct LeaseState {
    pub has_lock: bool,
    pub expires_ms: u64,
}

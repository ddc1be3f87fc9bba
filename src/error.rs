//! Error taxonomy shared by the dispatcher components.

use thiserror::Error;

/// Result alias for operations that surface a typed [`PdError`].
pub type PdResult<T> = std::result::Result<T, PdError>;

/// Errors a caller can act on.
///
/// Transient coordination problems (stale heartbeats, unknown containers,
/// lost lock races) are logged and absorbed where they happen and never show
/// up here.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PdError {
    /// Malformed arguments from the immediate caller.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Cluster preconditions were not met within the configured ceiling.
    #[error("not ready: {0}")]
    NotReady(String),

    /// This instance does not hold the leader lease.
    #[error("not leader: {0}")]
    NotLeader(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("message bus error: {0}")]
    Bus(String),

    /// An executor action failed inside its backend.
    #[error("action failed: {0}")]
    Action(String),

    /// The component was stopped before the operation completed.
    #[error("shut down: {0}")]
    Shutdown(String),
}

impl PdError {
    /// Status code carried by a command reply for this error.
    pub fn status(&self) -> u16 {
        match self {
            PdError::BadRequest(_) | PdError::NotFound(_) | PdError::Action(_) => 400,
            PdError::Timeout(_) => 408,
            PdError::Bus(_) => 500,
            PdError::NotReady(_) | PdError::NotLeader(_) | PdError::Shutdown(_) => 503,
        }
    }
}

impl From<anyhow::Error> for PdError {
    fn from(err: anyhow::Error) -> Self {
        PdError::Action(err.to_string())
    }
}

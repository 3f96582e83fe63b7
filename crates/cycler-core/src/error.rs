//! Error types for the cycler daemon.
//!
//! `CyclerError` is the single typed error enum crossing component
//! boundaries. The command service maps each variant onto an [`ErrorKind`]
//! carried in failure replies, so clients can distinguish "no such pipeline"
//! from "pipeline is busy" without parsing message strings.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for results using the daemon error type.
pub type CyclerResult<T> = std::result::Result<T, CyclerError>;

/// Classification of a failure, carried in replies to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown pipeline, job, or jobid.
    NotFound,
    /// Operation invalid given current state: occupied pipeline, busy
    /// pipeline, cancel of a non-queued job.
    Conflict,
    /// Hardware unreachable after exhausting retries.
    Connection,
    /// Hardware reported an unrecognized state. Always fatal, never
    /// retried.
    Protocol,
    /// Malformed or inconsistent device/pipeline configuration.
    Config,
    /// Persistence layer failure.
    Storage,
    /// Anything else (I/O, channel wiring).
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Connection => "connection",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Config => "config",
            ErrorKind::Storage => "storage",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{label}")
    }
}

/// Primary error type for the daemon.
#[derive(Error, Debug)]
pub enum CyclerError {
    /// Unknown pipeline, job, or jobid.
    #[error("{0} not found")]
    NotFound(String),

    /// Operation rejected because of the current state of its target.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Connection to hardware failed after exhausting the retry budget.
    #[error("connection to '{address}' failed after {attempts} attempts: {message}")]
    Connection {
        address: String,
        attempts: u32,
        message: String,
    },

    /// The instrument reported a state the driver does not recognize.
    /// Fatal: an unknown channel state must never be treated as ready.
    #[error("protocol error on '{address}': {message}")]
    Protocol { address: String, message: String },

    /// Configuration was malformed or internally inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// Job queue persistence failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Standard I/O failure (lock files, job storage directories).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A single driver call failed. Transient unless it keeps failing
    /// past the retry budget, at which point it becomes `Connection`.
    #[error("driver error: {0}")]
    Driver(String),

    /// Channel wiring and other daemon-internal failures.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CyclerError {
    /// The classification carried in failure replies.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CyclerError::NotFound(_) => ErrorKind::NotFound,
            CyclerError::Conflict(_) => ErrorKind::Conflict,
            CyclerError::Connection { .. } => ErrorKind::Connection,
            CyclerError::Protocol { .. } => ErrorKind::Protocol,
            CyclerError::Config(_) => ErrorKind::Config,
            CyclerError::Storage(_) => ErrorKind::Storage,
            CyclerError::Io(_) | CyclerError::Driver(_) | CyclerError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        CyclerError::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CyclerError::Conflict(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = CyclerError::Connection {
            address: "192.168.1.10".into(),
            attempts: 3,
            message: "link down".into(),
        };
        assert_eq!(
            err.to_string(),
            "connection to '192.168.1.10' failed after 3 attempts: link down"
        );
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn kind_mapping() {
        assert_eq!(
            CyclerError::not_found("pipeline 'x'").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            CyclerError::conflict("pipeline busy").kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            CyclerError::Protocol {
                address: "a".into(),
                message: "state 'PAUSE' not understood".into()
            }
            .kind(),
            ErrorKind::Protocol
        );
    }
}

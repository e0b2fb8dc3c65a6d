use std::io;
use std::time::Duration;

use thiserror::Error;
use transport::TransportError;

pub type BackendResult<T> = Result<T, BackendError>;

/// Failure classes shared by every backend.
///
/// Errors are `Clone` so one terminal failure can reject every queued call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    #[error("{0}")]
    Process(String),

    #[error("concurrency violation: {0}")]
    Concurrency(String),

    #[error("{0}")]
    Execution(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend has been destroyed")]
    Destroyed,

    #[error("wasm error: {0}")]
    Wasm(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BackendError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        BackendError::Unavailable(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        BackendError::Transport(msg.into())
    }

    pub fn wasm(msg: impl Into<String>) -> Self {
        BackendError::Wasm(msg.into())
    }
}

impl From<TransportError> for BackendError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => BackendError::Connection(err.to_string()),
            other => BackendError::Transport(other.to_string()),
        }
    }
}

impl From<io::Error> for BackendError {
    fn from(err: io::Error) -> Self {
        BackendError::Transport(err.to_string())
    }
}

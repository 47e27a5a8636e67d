//! Error types for the overseer

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Bad Requests ===
    #[error("{0}")]
    BadRequest(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Task is still running for async id {async_id} (status: {status})")]
    StillRunning { async_id: String, status: String },

    #[error("Invalid status request for async id: {0}")]
    InvalidAsyncId(String),

    #[error("Invalid async status: {0}")]
    InvalidStatus(String),

    // === Infrastructure Errors ===
    #[error("No response on request for async status of {0}")]
    NoAsyncResponse(String),

    #[error("Timed out after {timeout:?} waiting for state of {resource} to converge; last state: {last_state}")]
    StateConvergenceTimeout {
        resource: String,
        timeout: Duration,
        last_state: String,
    },

    #[error("{message}: {cause}")]
    ShardRequestFailed { message: String, cause: String },

    #[error("Member transport error: {0}")]
    Transport(String),

    // === Coordination Store Errors ===
    #[error("Store error: {0}")]
    Store(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Bad version for {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: u64,
        actual: u64,
    },

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Lifecycle ===
    #[error("Interrupted")]
    Interrupted,

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Response code carried by this error, if any.
    ///
    /// Errors without a code are reported as `-1` in operation results.
    pub fn code(&self) -> Option<u16> {
        match self {
            Error::BadRequest(_)
            | Error::UnknownOperation(_)
            | Error::StillRunning { .. }
            | Error::InvalidAsyncId(_)
            | Error::InvalidStatus(_)
            | Error::InvalidConfig(_) => Some(400),
            Error::NoAsyncResponse(_)
            | Error::StateConvergenceTimeout { .. }
            | Error::ShardRequestFailed { .. }
            | Error::Internal(_) => Some(500),
            _ => None,
        }
    }

    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::Transport(_)
                | Error::NoAsyncResponse(_)
                | Error::StateConvergenceTimeout { .. }
                | Error::StillRunning { .. }
        )
    }

    /// Cancellation must unwind to the task loop instead of being recorded.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted)
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self.code() {
            Some(400) => StatusCode::BAD_REQUEST,
            _ => match self {
                Error::Timeout(_) | Error::StateConvergenceTimeout { .. } => {
                    StatusCode::REQUEST_TIMEOUT
                }
                Error::Interrupted => StatusCode::SERVICE_UNAVAILABLE,
                Error::NodeExists(_) | Error::BadVersion { .. } => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

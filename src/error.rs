//! Error types for tether

use std::sync::Arc;
use thiserror::Error;

/// Cloneable so one outcome can be handed to every caller awaiting it.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// A request was issued while the connection was not ready and the
    /// retry budget ran out (or the frame could not be transmitted at all).
    #[error("Connection failed: connection is not ready")]
    ConnectionFailed,

    /// A watchdog fired before it was triggered.
    #[error("Timeout")]
    Timeout,

    /// The server answered with a `failed` status.
    #[error("Remote failure: {0}")]
    RemoteFailure(serde_json::Value),

    #[error("Malformed frame: {0}")]
    Frame(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Json(Arc::new(e))
    }
}

impl ClientError {
    /// True for the error a watchdog produces on expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout)
    }
}

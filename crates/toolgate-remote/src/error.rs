//! Error types for the HTTP sandbox backend

use thiserror::Error;
use toolgate_core::{BackendError, ConfigError};

/// Errors that can occur talking to the sandbox service
#[derive(Error, Debug)]
pub enum RemoteError {
    /// No endpoint configured and none in the environment
    #[error("sandbox service is not configured (set TOOLGATE_SANDBOX_URL)")]
    NotConfigured,

    /// Request never got an answer: connect failure, reset, client timeout
    #[error("sandbox service unreachable: {0}")]
    Unreachable(String),

    /// Service answered with a non-success status
    #[error("sandbox service returned {status}: {message}")]
    Status { status: u16, message: String },

    /// Response body did not match the expected shape
    #[error("invalid response from sandbox service: {0}")]
    Decode(String),

    /// HTTP client could not be built
    #[error("HTTP client error: {0}")]
    Client(String),

    /// Sandbox configuration rejected before connecting
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RemoteError {
    /// Whether the session behind the request should be considered lost.
    ///
    /// 5xx, 408, 410 and 429 say nothing about the request itself; every
    /// other 4xx is the sandbox refusing a well-delivered request.
    pub fn is_transport(&self) -> bool {
        match self {
            RemoteError::Unreachable(_) | RemoteError::Decode(_) => true,
            RemoteError::Status { status, .. } => {
                *status >= 500 || matches!(status, 408 | 410 | 429)
            }
            RemoteError::NotConfigured | RemoteError::Client(_) | RemoteError::Config(_) => false,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else {
            RemoteError::Unreachable(err.to_string())
        }
    }
}

impl From<RemoteError> for BackendError {
    fn from(err: RemoteError) -> Self {
        if err.is_transport() {
            BackendError::Transport(err.to_string())
        } else {
            match err {
                // The service's own message reads better than the wrapper.
                RemoteError::Status { message, .. } => BackendError::Operation(message),
                other => BackendError::Operation(other.to_string()),
            }
        }
    }
}

/// Result type for remote operations
pub type Result<T> = std::result::Result<T, RemoteError>;

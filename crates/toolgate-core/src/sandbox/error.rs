//! Error types for the sandbox module.

use super::backend::BackendError;
use super::session::SessionState;

/// Errors produced by a sandbox session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session not ready (state: {state})")]
    NotReady { state: SessionState },

    #[error("sandbox operation timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("sandbox unreachable: {0}")]
    Transport(String),

    #[error("sandbox operation failed: {0}")]
    Operation(String),

    #[error("sandbox operation cancelled")]
    Cancelled,
}

impl SessionError {
    /// Errors after which the session must not be reused.
    pub fn poisons_session(&self) -> bool {
        matches!(
            self,
            SessionError::Timeout { .. } | SessionError::Transport(_) | SessionError::Cancelled
        )
    }
}

impl From<BackendError> for SessionError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Transport(msg) => SessionError::Transport(msg),
            BackendError::Operation(msg) => SessionError::Operation(msg),
        }
    }
}

/// Result type for sandbox operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

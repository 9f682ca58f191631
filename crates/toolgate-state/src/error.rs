//! Error types for toolgate-state

use thiserror::Error;

/// Errors that can occur in the audit persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    /// Could not reach or authenticate against the backend
    #[error("Audit store connection failed: {0}")]
    Connection(String),

    /// Backend query or write failed
    #[error("Audit store backend error: {0}")]
    Backend(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),

    /// An entry with this sequence number was already persisted
    #[error("Duplicate audit entry: seq {seq}")]
    DuplicateEntry { seq: u64 },

    /// A stored row could not be mapped back into an entry
    #[error("Corrupt audit record: {0}")]
    Corrupt(String),
}

impl From<surrealdb::Error> for StoreError {
    fn from(err: surrealdb::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

//! Sandbox: sessions over a remote execution backend.
//!
//! # Modules
//!
//! - [`backend`]: `SandboxBackend` trait and its wire-level types
//! - [`session`]: `SandboxSession` state machine with bounded operations
//! - [`execution`]: `provision()`, connect with retry and backoff
//! - [`memory`]: `MemorySandbox`, an in-process backend
//! - [`error`]: `SessionError` / `SessionResult`

pub mod backend;
pub mod error;
pub mod execution;
pub mod memory;
pub mod session;

pub use backend::{
    BackendError, BackendResult, CommandOutput, SandboxBackend, SearchMatch, SessionHandle,
    SessionSpec,
};
pub use error::{SessionError, SessionResult};
pub use execution::{provision, ConnectPolicy, Provisioned};
pub use memory::MemorySandbox;
pub use session::{SandboxSession, SessionState};

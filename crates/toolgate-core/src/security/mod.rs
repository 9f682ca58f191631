//! Security: the policy side of tool-call mediation.
//!
//! # Modules
//!
//! - [`catalog`]: built-in dangerous-command rules
//! - [`analyzer`]: `CommandAnalyzer`, regex risk scoring of shell commands
//! - [`rate_limit`]: `RateLimiter`, per-identity fixed windows
//! - [`path_guard`]: `PathGuard`, lexical checks on file tool paths
//! - [`manager`]: `SecurityManager`, the ordered validate-or-reject decision

pub mod analyzer;
pub mod catalog;
pub mod manager;
pub mod path_guard;
pub mod rate_limit;

pub use analyzer::{CommandAnalyzer, CommandAssessment};
pub use catalog::default_blacklist;
pub use manager::{PolicyRejection, PolicyVerdict, RejectionKind, SecurityManager, SecurityStats};
pub use path_guard::PathGuard;
pub use rate_limit::{RateDecision, RateLimitWindow, RateLimiter};

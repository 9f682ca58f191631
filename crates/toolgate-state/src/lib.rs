//! Toolgate-State: audit records and their persistence.
//!
//! This crate holds the data model shared by every layer that records what
//! happened to a tool call (risk levels, violations, audit entries) together
//! with the backend-agnostic [`AuditStore`] trait and its implementations.
//!
//! ## Key Components
//!
//! - `storage_traits`: `RiskLevel`, `Violation`, `AuditLogEntry`, `AuditFilter`, `AuditStore`
//! - `fakes`: `MemoryAuditStore` for tests and single-process deployments
//! - `SurrealAuditStore`: SurrealDB-backed store (`mem://`, `surrealkv://`, or remote)

mod error;
pub mod fakes;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_audit;

pub use error::StoreError;
pub use storage_traits::{
    AuditFilter, AuditLogEntry, AuditOutcome, AuditStore, RiskLevel, StoreResult, Violation,
};
pub use surreal_audit::{SurrealAuditStore, SurrealConfig};

//! Toolgate Core Library
//!
//! Mediates agent tool calls: validates them against policy, rate-limits
//! callers, runs them in a remote sandbox session and audits every outcome.

pub mod audit;
pub mod config;
pub mod executor;
pub mod metrics;
pub mod obs;
pub mod permission;
pub mod sandbox;
pub mod security;
pub mod telemetry;
pub mod tool;

pub use audit::{redact_arguments, AuditDraft, AuditLog};

pub use config::{
    ApiKey, CommandRule, ConfigError, ConfigResult, NetworkConfig, Preset, RateLimitConfig,
    ResourceLimits, SandboxConfig, SandboxKind, SecurityConfig,
};

pub use executor::{ExecutorStats, FailureKind, SandboxExecutor, ToolResult};

pub use permission::{
    handle_request, CallerContext, PermissionDecision, PermissionHandler, ToolCallRequest,
};

pub use sandbox::{
    BackendError, BackendResult, CommandOutput, MemorySandbox, SandboxBackend, SandboxSession,
    SearchMatch, SessionError, SessionHandle, SessionSpec, SessionState,
};

pub use security::{
    CommandAnalyzer, PathGuard, PolicyRejection, PolicyVerdict, RateDecision, RateLimiter,
    RejectionKind, SecurityManager, SecurityStats,
};

pub use tool::{ToolInput, ToolKind, ToolOperation};

pub use toolgate_state::{
    AuditFilter, AuditLogEntry, AuditOutcome, AuditStore, RiskLevel, StoreError, Violation,
};

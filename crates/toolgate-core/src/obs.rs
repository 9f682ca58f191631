//! Structured observability hooks for tool-call and session lifecycle events.
//!
//! This module provides:
//! - Call-scoped tracing spans via the `ToolCallSpan` RAII guard
//! - Emission functions for validation, rejection, execution, violations
//!   and sandbox session lifecycle
//!
//! Every event carries an `event = "..."` field so log pipelines can filter
//! on it regardless of output format.

use toolgate_state::Violation;
use tracing::{info, warn};

/// RAII guard that enters a span tagged with the tool name and caller.
///
/// Only for synchronous sections; async code uses `#[instrument]`.
pub struct ToolCallSpan {
    _span: tracing::span::EnteredSpan,
}

impl ToolCallSpan {
    pub fn enter(tool: &str, caller: &str) -> Self {
        let span = tracing::info_span!("toolgate.call", tool = %tool, caller = %caller);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: a tool call passed every policy check.
pub fn emit_tool_validated(tool: &str, caller: &str, warnings: usize) {
    info!(event = "tool.validated", tool = %tool, caller = %caller, warnings = warnings);
}

/// Emit event: a tool call was refused by policy.
pub fn emit_tool_rejected(tool: &str, caller: &str, kind: &str, reason: &str) {
    warn!(
        event = "tool.rejected",
        tool = %tool,
        caller = %caller,
        kind = %kind,
        reason = %reason,
    );
}

/// Emit event: a tool call finished in the sandbox.
pub fn emit_tool_executed(tool: &str, session_id: Option<&str>, duration_ms: u64, success: bool) {
    info!(
        event = "tool.executed",
        tool = %tool,
        session_id = session_id.unwrap_or("-"),
        duration_ms = duration_ms,
        success = success,
    );
}

pub fn emit_violation_detected(tool: &str, violation: &Violation) {
    warn!(
        event = "violation.detected",
        tool = %tool,
        category = %violation.category,
        risk = %violation.risk_level,
        description = %violation.description,
    );
}

pub fn emit_session_provisioned(session_id: &str, sandbox_id: &str, attempts: u32) {
    info!(
        event = "session.provisioned",
        session_id = %session_id,
        sandbox_id = %sandbox_id,
        attempts = attempts,
    );
}

/// Emit event: a session was closed (`reason` is e.g. "idle", "failed", "shutdown").
pub fn emit_session_closed(session_id: &str, reason: &str) {
    info!(event = "session.closed", session_id = %session_id, reason = %reason);
}

/// Emit event: an audit entry could not be written to the persistent store.
pub fn emit_audit_persist_error(seq: u64, error: &dyn std::fmt::Display) {
    warn!(event = "audit.persist_error", seq = seq, error = %error);
}

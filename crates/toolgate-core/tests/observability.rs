//! Observability tests for tool-call and session lifecycle tracing.
//!
//! These tests verify that structured tracing events are emitted for
//! validation, rejection, execution and session provisioning.

use std::sync::Arc;

use serde_json::json;
use toolgate_core::obs::{
    emit_audit_persist_error, emit_session_closed, emit_session_provisioned, emit_tool_executed,
    emit_tool_rejected, emit_tool_validated, ToolCallSpan,
};
use toolgate_core::{
    MemorySandbox, SandboxBackend, SandboxConfig, SandboxExecutor, SecurityConfig,
    SecurityManager, ToolInput,
};
use tracing_test::traced_test;

#[traced_test]
#[test]
fn test_emit_tool_validated_logs_event_name() {
    emit_tool_validated("Bash", "agent-1", 2);
    assert!(logs_contain("tool.validated"));
    assert!(logs_contain("warnings=2"));
}

#[traced_test]
#[test]
fn test_emit_tool_rejected_logs_kind_and_reason() {
    emit_tool_rejected("WebFetch", "agent-1", "tool_blocked", "tool blocked: WebFetch");
    assert!(logs_contain("tool.rejected"));
    assert!(logs_contain("tool_blocked"));
}

#[traced_test]
#[test]
fn test_emit_tool_executed_without_session() {
    emit_tool_executed("Read", None, 12, false);
    assert!(logs_contain("tool.executed"));
    assert!(logs_contain("duration_ms=12"));
}

#[traced_test]
#[test]
fn test_session_events() {
    emit_session_provisioned("s-1", "sbx-1", 3);
    emit_session_closed("s-1", "idle");
    emit_audit_persist_error(7, &"connection refused");
    assert!(logs_contain("session.provisioned"));
    assert!(logs_contain("attempts=3"));
    assert!(logs_contain("session.closed"));
    assert!(logs_contain("audit.persist_error"));
}

#[traced_test]
#[test]
fn test_call_span_wraps_validation() {
    let manager = SecurityManager::new(SecurityConfig::default(), None, "/workspace").unwrap();
    let _span = ToolCallSpan::enter("outer", "agent-9");
    let verdict =
        manager.validate_tool_call(&ToolInput::new("Bash", json!({"command": "rm -rf /"})));
    assert!(!verdict.is_allowed());
    assert!(logs_contain("violation.detected"));
    assert!(logs_contain("filesystem_destruction"));
}

#[traced_test]
#[tokio::test]
async fn test_execution_emits_provisioned_and_executed() {
    let backend: Arc<dyn SandboxBackend> = Arc::new(MemorySandbox::new());
    let executor = SandboxExecutor::new(SandboxConfig::memory(), backend).unwrap();

    let result = executor
        .execute(ToolInput::new("Bash", json!({"command": "echo traced"})))
        .await;
    assert!(result.success);
    assert!(logs_contain("session.provisioned"));
    assert!(logs_contain("tool.executed"));

    executor.close().await;
    assert!(logs_contain("reason=shutdown"));
}

//! Permission callback adapter for the agent runtime.
//!
//! The runtime asks once per tool call whether it may proceed. Tools with a
//! sandbox operation are executed here and their result handed back in
//! `updatedInput`; harmless tools without one are validated and allowed to
//! run in the runtime itself; high-risk or unknown tools without a sandbox
//! operation are denied.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use toolgate_state::AuditOutcome;
use tracing::{debug, info};

use crate::executor::SandboxExecutor;
use crate::security::PolicyVerdict;
use crate::tool::ToolInput;

/// Key under which the sandbox output is returned in `updatedInput`.
pub const SANDBOX_RESULT_KEY: &str = "_sandbox_result";
/// Marker telling the runtime the call already ran in the sandbox.
pub const SANDBOX_EXECUTED_KEY: &str = "_sandbox_executed";

/// Answer to a permission request, in the runtime's wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow {
        #[serde(
            rename = "updatedInput",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        updated_input: Option<Map<String, Value>>,
    },
    Deny {
        message: String,
        #[serde(default)]
        interrupt: bool,
    },
}

impl PermissionDecision {
    pub fn allow() -> Self {
        PermissionDecision::Allow {
            updated_input: None,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        PermissionDecision::Deny {
            message: message.into(),
            interrupt: false,
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, PermissionDecision::Allow { .. })
    }
}

/// The one method the agent runtime needs from this crate.
#[async_trait]
pub trait PermissionHandler: Send + Sync {
    async fn decide(&self, input: ToolInput) -> PermissionDecision;
}

#[async_trait]
impl PermissionHandler for SandboxExecutor {
    async fn decide(&self, input: ToolInput) -> PermissionDecision {
        let kind = input.kind();
        debug!(tool = %input.tool_name, "permission requested");

        if kind.and_then(|k| k.operation()).is_some() {
            let mut arguments = input.arguments.clone();
            let result = self.execute(input).await;
            if result.success {
                arguments.insert(SANDBOX_RESULT_KEY.to_string(), Value::String(result.output));
                arguments.insert(SANDBOX_EXECUTED_KEY.to_string(), Value::Bool(true));
                return PermissionDecision::Allow {
                    updated_input: Some(arguments),
                };
            }
            let error = result
                .error
                .unwrap_or_else(|| "sandbox execution failed".to_string());
            return PermissionDecision::deny(format!("sandbox execution failed: {error}"));
        }

        if kind.is_some() && !input.is_high_risk() {
            info!(tool = %input.tool_name, "no sandbox operation, passing through");
            return match self.admit(&input, AuditOutcome::PassedThrough, None) {
                PolicyVerdict::Allowed { .. } => PermissionDecision::allow(),
                PolicyVerdict::Denied(rejection) => PermissionDecision::deny(rejection.reason),
            };
        }

        let reason = match kind {
            Some(kind) => format!("high-risk tool has no sandbox operation: {kind}"),
            None => format!("unknown tool: {}", input.tool_name),
        };
        match self.admit(&input, AuditOutcome::Unsupported, Some(reason.clone())) {
            PolicyVerdict::Allowed { .. } => PermissionDecision::deny(reason),
            PolicyVerdict::Denied(rejection) => PermissionDecision::deny(rejection.reason),
        }
    }
}

/// Caller details attached to a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerContext {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub suggestions: Vec<Value>,
}

/// A permission request as sent by the agent runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    #[serde(default)]
    pub caller_context: Option<CallerContext>,
}

impl ToolCallRequest {
    /// The caller's session id becomes the rate-limit identity.
    pub fn into_tool_input(self) -> ToolInput {
        let mut input = ToolInput::new(self.tool_name, Value::Object(self.arguments));
        input.caller_id = self.caller_context.and_then(|c| c.session_id);
        input
    }
}

pub async fn handle_request<H>(handler: &H, request: ToolCallRequest) -> PermissionDecision
where
    H: PermissionHandler + ?Sized,
{
    handler.decide(request.into_tool_input()).await
}

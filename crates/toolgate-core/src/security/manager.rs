//! The policy engine: one validate-or-reject decision per tool call.
//!
//! Checks run in a fixed order and the first failing check decides:
//!
//! 1. `blocked_tools` contains the tool
//! 2. `allowed_tools` is non-empty and lacks the tool
//! 3. a whitelist is configured and the command matches none of it
//! 4. the command analyzer finds a violation at or above the threshold
//! 5. the tool touches a forbidden path and `allow_root` is off
//! 6. the caller is over its rate limit
//!
//! Rate limiting comes last so rejected calls never consume quota. A
//! whitelisted command is still analyzed; its violations are kept as
//! warnings but do not block.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use toolgate_state::{AuditOutcome, RiskLevel, Violation};
use tracing::debug;

use crate::audit::{AuditDraft, AuditLog};
use crate::config::{ConfigResult, RateLimitConfig, SandboxConfig, SecurityConfig};
use crate::metrics::METRICS;
use crate::obs::{self, ToolCallSpan};
use crate::security::analyzer::CommandAnalyzer;
use crate::security::path_guard::PathGuard;
use crate::security::rate_limit::RateLimiter;
use crate::tool::{PathAccess, ToolInput};

/// Which check refused a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    ToolBlocked,
    ToolNotAllowed,
    CommandNotWhitelisted,
    UnsafeCommand,
    PathForbidden,
    RateLimited,
}

impl RejectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ToolBlocked => "tool_blocked",
            Self::ToolNotAllowed => "tool_not_allowed",
            Self::CommandNotWhitelisted => "command_not_whitelisted",
            Self::UnsafeCommand => "unsafe_command",
            Self::PathForbidden => "path_forbidden",
            Self::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A refused call. Always a normal value, never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRejection {
    pub kind: RejectionKind,
    /// Specific, human-readable reason.
    pub reason: String,
    /// Every violation detected while validating the call.
    pub violations: Vec<Violation>,
}

/// Outcome of validating a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyVerdict {
    /// The call may proceed; `warnings` are non-blocking violations.
    Allowed { warnings: Vec<Violation> },
    Denied(PolicyRejection),
}

impl PolicyVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyVerdict::Allowed { .. })
    }

    /// Rejection reason, empty when allowed.
    pub fn reason(&self) -> &str {
        match self {
            PolicyVerdict::Allowed { .. } => "",
            PolicyVerdict::Denied(rejection) => &rejection.reason,
        }
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            PolicyVerdict::Allowed { warnings } => warnings,
            PolicyVerdict::Denied(rejection) => &rejection.violations,
        }
    }

    /// `(valid, reason)`.
    pub fn as_pair(&self) -> (bool, String) {
        (self.is_allowed(), self.reason().to_string())
    }
}

/// Counters over every completed validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityStats {
    pub total_calls: u64,
    pub accepted: u64,
    pub rejected: u64,
    /// Validations per tool name.
    pub by_tool: BTreeMap<String, u64>,
    /// Detected violations per risk level.
    pub by_risk_level: BTreeMap<RiskLevel, u64>,
    pub by_rejection: BTreeMap<RejectionKind, u64>,
}

#[derive(Debug, Default)]
struct Ledger {
    stats: SecurityStats,
    violations: Vec<Violation>,
}

/// Combines tool lists, command analysis, path checks and rate limiting.
#[derive(Debug)]
pub struct SecurityManager {
    config: SecurityConfig,
    analyzer: CommandAnalyzer,
    path_guard: PathGuard,
    rate_limiter: Option<RateLimiter>,
    audit: Arc<AuditLog>,
    ledger: Mutex<Ledger>,
}

impl SecurityManager {
    /// Validate `config` and build the manager with a fresh in-memory audit log.
    pub fn new(
        config: SecurityConfig,
        rate_limit: Option<&RateLimitConfig>,
        working_directory: &str,
    ) -> ConfigResult<Self> {
        let audit = Arc::new(AuditLog::new(config.enable_audit_log));
        Self::with_audit_log(config, rate_limit, working_directory, audit)
    }

    pub fn with_audit_log(
        config: SecurityConfig,
        rate_limit: Option<&RateLimitConfig>,
        working_directory: &str,
        audit: Arc<AuditLog>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            analyzer: CommandAnalyzer::from_config(&config)?,
            path_guard: PathGuard::new(working_directory, config.home_directory.clone()),
            rate_limiter: rate_limit.map(RateLimiter::from_config),
            audit,
            ledger: Mutex::new(Ledger::default()),
            config,
        })
    }

    pub fn from_config(config: &SandboxConfig) -> ConfigResult<Self> {
        Self::new(
            config.security.clone(),
            config.rate_limit.as_ref(),
            &config.working_directory,
        )
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn analyzer(&self) -> &CommandAnalyzer {
        &self.analyzer
    }

    pub fn path_guard(&self) -> &PathGuard {
        &self.path_guard
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Validate one call. Rejections are recorded in the audit log.
    pub fn validate_tool_call(&self, input: &ToolInput) -> PolicyVerdict {
        let started = Instant::now();
        let _span = ToolCallSpan::enter(&input.tool_name, input.caller());
        METRICS.inc_validations();

        let verdict = self.evaluate(input);
        self.account(input, &verdict);

        match &verdict {
            PolicyVerdict::Allowed { warnings } => {
                obs::emit_tool_validated(&input.tool_name, input.caller(), warnings.len());
            }
            PolicyVerdict::Denied(rejection) => {
                METRICS.inc_rejections();
                obs::emit_tool_rejected(
                    &input.tool_name,
                    input.caller(),
                    rejection.kind.as_str(),
                    &rejection.reason,
                );
                let mut draft = AuditDraft::for_call(input, AuditOutcome::Rejected);
                draft.reason = Some(rejection.reason.clone());
                draft.violations = rejection.violations.clone();
                draft.duration_ms = elapsed_ms(started);
                self.audit.record(draft);
            }
        }
        verdict
    }

    fn evaluate(&self, input: &ToolInput) -> PolicyVerdict {
        let tool = input.tool_name.as_str();

        if self.config.blocked_tools.contains(tool) {
            return self.reject(
                input,
                RejectionKind::ToolBlocked,
                format!("tool blocked: {tool}"),
                RiskLevel::High,
                tool,
                Vec::new(),
            );
        }

        if !self.config.allowed_tools.is_empty() && !self.config.allowed_tools.contains(tool) {
            return self.reject(
                input,
                RejectionKind::ToolNotAllowed,
                format!("tool not in allow-list: {tool}"),
                RiskLevel::Medium,
                tool,
                Vec::new(),
            );
        }

        let mut warnings = Vec::new();
        if let Some(command) = input.command() {
            let assessment = self.analyzer.assess(command);
            let detected: Vec<Violation> = assessment
                .violations
                .iter()
                .cloned()
                .map(|v| v.for_tool(tool))
                .collect();

            if self.analyzer.has_whitelist() {
                if !self.analyzer.is_whitelisted(command) {
                    return self.reject(
                        input,
                        RejectionKind::CommandNotWhitelisted,
                        format!("command not in whitelist: {}", first_line(command)),
                        RiskLevel::Medium,
                        command,
                        detected,
                    );
                }
                warnings = detected;
            } else if !assessment.safe {
                return PolicyVerdict::Denied(PolicyRejection {
                    kind: RejectionKind::UnsafeCommand,
                    reason: format!("unsafe command: {}", assessment.reason),
                    violations: detected,
                });
            } else {
                warnings = detected;
            }
        }

        if !self.config.allow_root {
            let access = input.kind().and_then(|k| k.path_access());
            if let (Some(access), Some(path)) = (access, input.path()) {
                let (checked, risk) = match access {
                    PathAccess::Read => (self.path_guard.check_read(path), RiskLevel::Medium),
                    PathAccess::Write => (self.path_guard.check_write(path), RiskLevel::High),
                };
                if let Err(why) = checked {
                    return self.reject(
                        input,
                        RejectionKind::PathForbidden,
                        format!("path forbidden: {why}"),
                        risk,
                        path,
                        warnings,
                    );
                }
            }
        }

        if let Some(limiter) = &self.rate_limiter {
            let decision = limiter.check(input.caller());
            if !decision.allowed {
                return self.reject(
                    input,
                    RejectionKind::RateLimited,
                    format!("rate limit exceeded: {}", decision.reason),
                    RiskLevel::Medium,
                    input.caller(),
                    warnings,
                );
            }
        }

        PolicyVerdict::Allowed { warnings }
    }

    /// Rejection carrying one policy violation on top of `detected`.
    fn reject(
        &self,
        input: &ToolInput,
        kind: RejectionKind,
        reason: String,
        risk: RiskLevel,
        matched: &str,
        mut detected: Vec<Violation>,
    ) -> PolicyVerdict {
        detected.push(
            Violation::new(kind.as_str(), kind.as_str(), reason.clone(), risk, matched)
                .for_tool(&input.tool_name),
        );
        PolicyVerdict::Denied(PolicyRejection {
            kind,
            reason,
            violations: detected,
        })
    }

    fn account(&self, input: &ToolInput, verdict: &PolicyVerdict) {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = &mut ledger.stats;
        stats.total_calls += 1;
        *stats.by_tool.entry(input.tool_name.clone()).or_default() += 1;
        match verdict {
            PolicyVerdict::Allowed { .. } => stats.accepted += 1,
            PolicyVerdict::Denied(rejection) => {
                stats.rejected += 1;
                *stats.by_rejection.entry(rejection.kind).or_default() += 1;
            }
        }
        for v in verdict.violations() {
            *stats.by_risk_level.entry(v.risk_level).or_default() += 1;
        }

        if self.config.enable_audit_log {
            for v in verdict.violations() {
                obs::emit_violation_detected(&input.tool_name, v);
            }
            ledger.violations.extend(verdict.violations().iter().cloned());
        }
        debug!(tool = %input.tool_name, allowed = verdict.is_allowed(), "validation accounted");
    }

    /// Recorded violations, optionally only those of exactly `risk_level`.
    pub fn get_violations(&self, risk_level: Option<RiskLevel>) -> Vec<Violation> {
        let ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        ledger
            .violations
            .iter()
            .filter(|v| risk_level.map_or(true, |r| v.risk_level == r))
            .cloned()
            .collect()
    }

    /// Snapshot of the counters.
    pub fn get_stats(&self) -> SecurityStats {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats
            .clone()
    }
}

fn first_line(command: &str) -> &str {
    command.lines().next().unwrap_or("").trim()
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use toolgate_state::AuditFilter;

    fn manager(config: SecurityConfig) -> SecurityManager {
        SecurityManager::new(config, None, "/workspace").unwrap()
    }

    fn bash(command: &str) -> ToolInput {
        ToolInput::new("Bash", json!({ "command": command }))
    }

    #[test]
    fn blocked_tool_always_rejected() {
        let mut config = SecurityConfig::default();
        config.blocked_tools.insert("WebFetch".into());
        let m = manager(config);
        let verdict = m.validate_tool_call(&ToolInput::new("WebFetch", json!({})));
        assert_eq!(verdict.as_pair(), (false, "tool blocked: WebFetch".to_string()));
    }

    #[test]
    fn allow_list_restricts() {
        let mut config = SecurityConfig::default();
        config.allowed_tools.insert("Bash".into());
        let m = manager(config);
        assert!(m.validate_tool_call(&bash("ls")).is_allowed());
        let verdict = m.validate_tool_call(&ToolInput::new("Read", json!({"file_path": "a"})));
        assert!(verdict.reason().contains("not in allow-list"));
    }

    #[test]
    fn unsafe_command_records_analyzer_violations() {
        let m = manager(SecurityConfig::default());
        let verdict = m.validate_tool_call(&bash("sudo rm -rf /"));
        let PolicyVerdict::Denied(rejection) = verdict else {
            panic!("expected rejection");
        };
        assert_eq!(rejection.kind, RejectionKind::UnsafeCommand);
        assert!(rejection.reason.starts_with("unsafe command: "));
        assert!(rejection.violations.len() >= 2);
        assert!(rejection
            .violations
            .iter()
            .all(|v| v.tool_name.as_deref() == Some("Bash")));
        assert_eq!(m.get_violations(None).len(), rejection.violations.len());
    }

    #[test]
    fn whitelist_beats_blacklist() {
        let config = SecurityConfig {
            command_whitelist: vec![r"^sudo\s+apt-get\s+install\b".into()],
            ..SecurityConfig::default()
        };
        let m = manager(config);

        let verdict = m.validate_tool_call(&bash("sudo apt-get install jq"));
        let PolicyVerdict::Allowed { warnings } = verdict else {
            panic!("expected allowed");
        };
        assert_eq!(warnings[0].category, "privilege_escalation");

        let verdict = m.validate_tool_call(&bash("ls"));
        let PolicyVerdict::Denied(rejection) = verdict else {
            panic!("expected rejection");
        };
        assert_eq!(rejection.kind, RejectionKind::CommandNotWhitelisted);
    }

    #[test]
    fn low_risk_command_allowed_with_warning() {
        let m = manager(SecurityConfig::default());
        let verdict = m.validate_tool_call(&bash("cat /etc/passwd"));
        assert!(verdict.is_allowed());
        assert_eq!(verdict.violations().len(), 1);
        assert_eq!(m.get_violations(Some(RiskLevel::Low)).len(), 1);
    }

    #[test]
    fn empty_blacklist_skips_analysis() {
        let config = SecurityConfig {
            command_blacklist: Vec::new(),
            ..SecurityConfig::default()
        };
        assert!(manager(config).validate_tool_call(&bash("rm -rf /")).is_allowed());
    }

    #[test]
    fn forbidden_paths() {
        let m = manager(SecurityConfig::default());
        let read =
            m.validate_tool_call(&ToolInput::new("Read", json!({"file_path": "/etc/shadow"})));
        assert!(read.reason().starts_with("path forbidden: "));
        assert_eq!(read.violations()[0].risk_level, RiskLevel::Medium);

        let write = m.validate_tool_call(&ToolInput::new(
            "Write",
            json!({"file_path": "/etc/hosts", "content": "x"}),
        ));
        assert_eq!(write.violations()[0].risk_level, RiskLevel::High);

        let ok = m.validate_tool_call(&ToolInput::new(
            "Write",
            json!({"file_path": "notes.md", "content": "x"}),
        ));
        assert!(ok.is_allowed());
    }

    #[test]
    fn allow_root_skips_path_guard() {
        let config = SecurityConfig {
            allow_root: true,
            ..SecurityConfig::default()
        };
        let verdict = manager(config)
            .validate_tool_call(&ToolInput::new("Read", json!({"file_path": "/etc/shadow"})));
        assert!(verdict.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_is_last_and_per_caller() {
        let m = SecurityManager::new(
            SecurityConfig::default(),
            Some(&RateLimitConfig {
                max_requests: 2,
                window_seconds: 60,
                retention_windows: 2,
            }),
            "/workspace",
        )
        .unwrap();

        let call = bash("ls").with_caller("agent-a");
        assert!(m.validate_tool_call(&call).is_allowed());
        // Rejected calls do not consume quota.
        assert!(!m.validate_tool_call(&bash("rm -rf /").with_caller("agent-a")).is_allowed());
        assert!(m.validate_tool_call(&call).is_allowed());

        let verdict = m.validate_tool_call(&call);
        assert!(verdict.reason().starts_with("rate limit exceeded: "));
        assert!(m.validate_tool_call(&bash("ls").with_caller("agent-b")).is_allowed());
    }

    #[test]
    fn stats_and_audit() {
        let mut config = SecurityConfig::default();
        config.blocked_tools.insert("WebFetch".into());
        let m = manager(config);
        m.validate_tool_call(&bash("ls"));
        m.validate_tool_call(&bash("rm -rf /"));
        m.validate_tool_call(&ToolInput::new("WebFetch", json!({})));

        let stats = m.get_stats();
        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, 2);
        assert_eq!(stats.by_tool["Bash"], 2);
        assert_eq!(stats.by_rejection[&RejectionKind::ToolBlocked], 1);
        assert!(stats.by_risk_level[&RiskLevel::Critical] >= 1);
        assert_eq!(m.get_stats(), stats);

        let rejected = m
            .audit_log()
            .entries(&AuditFilter::new().outcome(AuditOutcome::Rejected));
        assert_eq!(rejected.len(), 2);
        assert_eq!(rejected[1].reason.as_deref(), Some("tool blocked: WebFetch"));
    }

    #[test]
    fn audit_disabled_still_counts() {
        let config = SecurityConfig {
            enable_audit_log: false,
            ..SecurityConfig::default()
        };
        let m = manager(config);
        m.validate_tool_call(&bash("rm -rf /"));
        assert_eq!(m.get_stats().rejected, 1);
        assert!(m.get_violations(None).is_empty());
        assert!(m.audit_log().is_empty());
    }

    #[test]
    fn stats_serialize_with_string_keys() {
        let m = manager(SecurityConfig::default());
        m.validate_tool_call(&bash("rm -rf /"));
        let json = serde_json::to_value(m.get_stats()).unwrap();
        assert!(json["by_risk_level"]["critical"].as_u64().unwrap() >= 1);
        assert_eq!(json["by_rejection"]["unsafe_command"], 1);
    }
}

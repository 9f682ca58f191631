//! Audit data model and the storage trait behind it.
//!
//! - `RiskLevel`: ordinal severity attached to a detected violation
//! - `Violation`: one detected policy infraction, immutable once created
//! - `AuditLogEntry`: one completed tool call (or rejection), append-only
//! - `AuditStore`: async, backend-agnostic persistence for audit entries
//!
//! In-memory fakes are provided for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Result type for storage operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// RiskLevel
// ---------------------------------------------------------------------------

/// Severity of a detected violation, ordered `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// All levels in ascending order.
    pub const ALL: [RiskLevel; 4] = [
        RiskLevel::Low,
        RiskLevel::Medium,
        RiskLevel::High,
        RiskLevel::Critical,
    ];

    /// Whether this level reaches `threshold`.
    pub fn at_least(self, threshold: RiskLevel) -> bool {
        self >= threshold
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown risk level: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Violation
// ---------------------------------------------------------------------------

/// A detected policy infraction.
///
/// Created at analysis time and never mutated afterwards. `pattern` is the
/// configured rule that fired (a regex for command rules, a rule name for
/// policy rejections) and `matched_text` is the slice of input it hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Rule family, e.g. `filesystem_destruction` or `tool_blocked`.
    pub category: String,
    pub pattern: String,
    pub description: String,
    pub risk_level: RiskLevel,
    pub matched_text: String,
    /// Tool the violation was raised for, stamped by the policy layer.
    #[serde(default)]
    pub tool_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Violation {
    pub fn new(
        category: impl Into<String>,
        pattern: impl Into<String>,
        description: impl Into<String>,
        risk_level: RiskLevel,
        matched_text: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            pattern: pattern.into(),
            description: description.into(),
            risk_level,
            matched_text: matched_text.into(),
            tool_name: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the tool the violation was raised for.
    pub fn for_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }
}

// ---------------------------------------------------------------------------
// AuditLogEntry
// ---------------------------------------------------------------------------

/// How a tool call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Ran in the sandbox and succeeded.
    Executed,
    /// Ran in the sandbox and reported failure (non-zero exit, missing file, ...).
    Failed,
    /// Refused by policy before reaching the sandbox.
    Rejected,
    /// Exceeded the configured time bound and was abandoned.
    TimedOut,
    /// The sandbox transport failed (unreachable, connection dropped).
    TransportError,
    /// The caller cancelled the call while it was in flight.
    Cancelled,
    /// No sandbox operation exists for the tool.
    Unsupported,
    /// Passed policy and was handed back to the agent runtime without sandboxing.
    PassedThrough,
}

impl AuditOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Executed => "executed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::TimedOut => "timed_out",
            Self::TransportError => "transport_error",
            Self::Cancelled => "cancelled",
            Self::Unsupported => "unsupported",
            Self::PassedThrough => "passed_through",
        }
    }
}

impl std::fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "executed" => Self::Executed,
            "failed" => Self::Failed,
            "rejected" => Self::Rejected,
            "timed_out" => Self::TimedOut,
            "transport_error" => Self::TransportError,
            "cancelled" => Self::Cancelled,
            "unsupported" => Self::Unsupported,
            "passed_through" => Self::PassedThrough,
            other => return Err(format!("unknown audit outcome: {other}")),
        })
    }
}

/// One append-only audit record.
///
/// `seq` is assigned by the audit log at append time, so ordering by `seq`
/// is completion order. `arguments` are already redacted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub success: bool,
    pub outcome: AuditOutcome,
    #[serde(default)]
    pub reason: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output_preview: Option<String>,
    #[serde(default)]
    pub violations: Vec<Violation>,
    #[serde(default)]
    pub caller_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

// ---------------------------------------------------------------------------
// AuditFilter
// ---------------------------------------------------------------------------

/// Query filter over audit entries. Every set field must match.
///
/// `limit` keeps the most recent `n` matching entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditFilter {
    pub tool_name: Option<String>,
    pub caller_id: Option<String>,
    pub outcome: Option<AuditOutcome>,
    pub success: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `entry` satisfies every predicate (ignores `limit`).
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.tool_name
            .as_deref()
            .map_or(true, |t| entry.tool_name == t)
            && self
                .caller_id
                .as_deref()
                .map_or(true, |c| entry.caller_id.as_deref() == Some(c))
            && self.outcome.map_or(true, |o| entry.outcome == o)
            && self.success.map_or(true, |s| entry.success == s)
            && self.since.map_or(true, |t| entry.timestamp >= t)
            && self.until.map_or(true, |t| entry.timestamp <= t)
    }

    /// Filter an already seq-ordered iterator and apply `limit`.
    pub fn apply<'a, I>(&self, entries: I) -> Vec<AuditLogEntry>
    where
        I: IntoIterator<Item = &'a AuditLogEntry>,
    {
        let mut out: Vec<AuditLogEntry> = entries
            .into_iter()
            .filter(|e| self.matches(e))
            .cloned()
            .collect();
        if let Some(limit) = self.limit {
            if out.len() > limit {
                out.drain(..out.len() - limit);
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// AuditStore
// ---------------------------------------------------------------------------

/// Append-only persistence for audit entries.
///
/// Guarantees:
/// - `append` rejects a second entry with an already stored `seq`.
/// - `query` returns matching entries ordered by ascending `seq`.
/// - `last_seq` reports the highest stored `seq`, so a restarted audit log
///   can continue numbering without collisions.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist one entry.
    async fn append(&self, entry: &AuditLogEntry) -> StoreResult<()>;

    /// Entries matching `filter`, ordered by `seq`.
    async fn query(&self, filter: &AuditFilter) -> StoreResult<Vec<AuditLogEntry>>;

    /// Number of stored entries.
    async fn count(&self) -> StoreResult<u64>;

    /// Highest stored `seq`, or `None` when empty.
    async fn last_seq(&self) -> StoreResult<Option<u64>>;
}

//! Schema definitions for toolgate SurrealDB tables
//!
//! Tables:
//! - audit_log: one row per completed tool call, keyed by `seq`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::storage_traits::{AuditLogEntry, AuditOutcome, Violation};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Audit row as stored in the `audit_log` table.
///
/// Violations are stored as a JSON document so the row stays schemaless
/// for nested data while the scalar columns remain indexable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// SurrealDB record ID
    #[serde(default, skip_serializing)]
    pub id: Option<surrealdb::sql::Thing>,
    pub seq: u64,
    #[serde(with = "surreal_datetime")]
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub success: bool,
    /// One of the `AuditOutcome` string forms
    pub outcome: String,
    pub reason: Option<String>,
    pub duration_ms: u64,
    pub exit_code: Option<i64>,
    pub output_preview: Option<String>,
    pub violations: serde_json::Value,
    pub caller_id: Option<String>,
    pub session_id: Option<String>,
}

impl AuditRecord {
    /// Build a row from an entry.
    pub fn from_entry(entry: &AuditLogEntry) -> Result<Self, StoreError> {
        Ok(AuditRecord {
            id: None,
            seq: entry.seq,
            timestamp: entry.timestamp,
            tool_name: entry.tool_name.clone(),
            arguments: entry.arguments.clone(),
            success: entry.success,
            outcome: entry.outcome.as_str().to_string(),
            reason: entry.reason.clone(),
            duration_ms: entry.duration_ms,
            exit_code: entry.exit_code.map(i64::from),
            output_preview: entry.output_preview.clone(),
            violations: serde_json::to_value(&entry.violations)?,
            caller_id: entry.caller_id.clone(),
            session_id: entry.session_id.clone(),
        })
    }

    /// Map a row back into an entry.
    pub fn into_entry(self) -> Result<AuditLogEntry, StoreError> {
        let outcome: AuditOutcome = self.outcome.parse().map_err(StoreError::Corrupt)?;
        let violations: Vec<Violation> = serde_json::from_value(self.violations)?;
        let exit_code = self
            .exit_code
            .map(i32::try_from)
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("exit_code out of range: {e}")))?;

        Ok(AuditLogEntry {
            seq: self.seq,
            timestamp: self.timestamp,
            tool_name: self.tool_name,
            arguments: self.arguments,
            success: self.success,
            outcome,
            reason: self.reason,
            duration_ms: self.duration_ms,
            exit_code,
            output_preview: self.output_preview,
            violations,
            caller_id: self.caller_id,
            session_id: self.session_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_traits::RiskLevel;

    #[test]
    fn test_record_round_trips_entry() {
        let entry = AuditLogEntry {
            seq: 7,
            timestamp: Utc::now(),
            tool_name: "Bash".into(),
            arguments: serde_json::json!({"command": "ls"}),
            success: false,
            outcome: AuditOutcome::Rejected,
            reason: Some("unsafe command".into()),
            duration_ms: 3,
            exit_code: Some(-1),
            output_preview: None,
            violations: vec![Violation::new(
                "privilege_escalation",
                r"\bsudo\b",
                "uses sudo",
                RiskLevel::High,
                "sudo",
            )],
            caller_id: Some("agent".into()),
            session_id: None,
        };

        let back = AuditRecord::from_entry(&entry).unwrap().into_entry().unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_unknown_outcome_is_corrupt() {
        let mut record = AuditRecord::from_entry(&AuditLogEntry {
            seq: 1,
            timestamp: Utc::now(),
            tool_name: "Read".into(),
            arguments: serde_json::Value::Null,
            success: true,
            outcome: AuditOutcome::Executed,
            reason: None,
            duration_ms: 0,
            exit_code: None,
            output_preview: None,
            violations: vec![],
            caller_id: None,
            session_id: None,
        })
        .unwrap();
        record.outcome = "exploded".into();

        assert!(matches!(record.into_entry(), Err(StoreError::Corrupt(_))));
    }
}

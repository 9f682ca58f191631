//! Trait contract tests for AuditStore.
//!
//! Every check runs against both the in-memory fake and the SurrealDB
//! store, so any conforming implementation must pass these.

use chrono::{Duration, Utc};
use toolgate_state::fakes::MemoryAuditStore;
use toolgate_state::storage_traits::*;
use toolgate_state::{StoreError, SurrealAuditStore};

fn entry(seq: u64, tool: &str, caller: &str, outcome: AuditOutcome) -> AuditLogEntry {
    AuditLogEntry {
        seq,
        timestamp: Utc::now(),
        tool_name: tool.to_string(),
        arguments: serde_json::json!({"seq": seq}),
        success: matches!(outcome, AuditOutcome::Executed | AuditOutcome::PassedThrough),
        outcome,
        reason: None,
        duration_ms: seq * 10,
        exit_code: Some(0),
        output_preview: Some(format!("output {seq}")),
        violations: vec![],
        caller_id: Some(caller.to_string()),
        session_id: Some("sess-1".to_string()),
    }
}

async fn stores() -> Vec<(&'static str, Box<dyn AuditStore>)> {
    vec![
        ("memory", Box::new(MemoryAuditStore::new())),
        ("surreal", Box::new(SurrealAuditStore::in_memory().await.unwrap())),
    ]
}

#[tokio::test]
async fn empty_store_has_no_entries() {
    for (name, store) in stores().await {
        assert_eq!(store.count().await.unwrap(), 0, "{name}");
        assert_eq!(store.last_seq().await.unwrap(), None, "{name}");
        assert!(store.query(&AuditFilter::new()).await.unwrap().is_empty(), "{name}");
    }
}

#[tokio::test]
async fn append_then_query_preserves_entry() {
    for (name, store) in stores().await {
        let mut e = entry(1, "Bash", "agent", AuditOutcome::Rejected);
        e.success = false;
        e.reason = Some("unsafe command: rm -rf /".to_string());
        e.exit_code = None;
        e.violations = vec![Violation::new(
            "filesystem_destruction",
            r"rm\s+-rf\s+/",
            "Recursive deletion from root",
            RiskLevel::Critical,
            "rm -rf /",
        )
        .for_tool("Bash")];
        store.append(&e).await.unwrap();

        let all = store.query(&AuditFilter::new()).await.unwrap();
        assert_eq!(all.len(), 1, "{name}");
        let got = &all[0];
        assert_eq!(got.seq, 1, "{name}");
        assert_eq!(got.outcome, AuditOutcome::Rejected, "{name}");
        assert_eq!(got.reason, e.reason, "{name}");
        assert_eq!(got.violations.len(), 1, "{name}");
        assert_eq!(got.violations[0].risk_level, RiskLevel::Critical, "{name}");
        assert_eq!(got.violations[0].tool_name.as_deref(), Some("Bash"), "{name}");
        assert_eq!(got.arguments, e.arguments, "{name}");
    }
}

#[tokio::test]
async fn duplicate_seq_is_rejected() {
    for (name, store) in stores().await {
        store
            .append(&entry(5, "Read", "agent", AuditOutcome::Executed))
            .await
            .unwrap();
        let err = store
            .append(&entry(5, "Write", "agent", AuditOutcome::Executed))
            .await
            .unwrap_err();
        assert!(
            matches!(err, StoreError::DuplicateEntry { seq: 5 }),
            "{name}: unexpected error {err:?}"
        );
        assert_eq!(store.count().await.unwrap(), 1, "{name}");
    }
}

#[tokio::test]
async fn query_is_ordered_by_seq() {
    for (name, store) in stores().await {
        for seq in [3, 1, 2] {
            store
                .append(&entry(seq, "Bash", "agent", AuditOutcome::Executed))
                .await
                .unwrap();
        }
        let seqs: Vec<u64> = store
            .query(&AuditFilter::new())
            .await
            .unwrap()
            .iter()
            .map(|e| e.seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3], "{name}");
        assert_eq!(store.last_seq().await.unwrap(), Some(3), "{name}");
        assert_eq!(store.count().await.unwrap(), 3, "{name}");
    }
}

#[tokio::test]
async fn query_filters_by_tool_caller_and_outcome() {
    for (name, store) in stores().await {
        store
            .append(&entry(1, "Bash", "alice", AuditOutcome::Executed))
            .await
            .unwrap();
        store
            .append(&entry(2, "Read", "alice", AuditOutcome::Failed))
            .await
            .unwrap();
        store
            .append(&entry(3, "Bash", "bob", AuditOutcome::Rejected))
            .await
            .unwrap();

        let bash = store.query(&AuditFilter::new().tool("Bash")).await.unwrap();
        assert_eq!(bash.len(), 2, "{name}");

        let alice_bash = store
            .query(&AuditFilter::new().tool("Bash").caller("alice"))
            .await
            .unwrap();
        assert_eq!(alice_bash.len(), 1, "{name}");
        assert_eq!(alice_bash[0].seq, 1, "{name}");

        let rejected = store
            .query(&AuditFilter::new().outcome(AuditOutcome::Rejected))
            .await
            .unwrap();
        assert_eq!(rejected.len(), 1, "{name}");
        assert_eq!(rejected[0].caller_id.as_deref(), Some("bob"), "{name}");

        let failures = store.query(&AuditFilter::new().success(false)).await.unwrap();
        assert_eq!(failures.len(), 2, "{name}");
    }
}

#[tokio::test]
async fn query_limit_keeps_most_recent() {
    for (name, store) in stores().await {
        for seq in 1..=6 {
            store
                .append(&entry(seq, "Glob", "agent", AuditOutcome::Executed))
                .await
                .unwrap();
        }
        let seqs: Vec<u64> = store
            .query(&AuditFilter::new().limit(2))
            .await
            .unwrap()
            .iter()
            .map(|e| e.seq)
            .collect();
        assert_eq!(seqs, vec![5, 6], "{name}");
    }
}

#[tokio::test]
async fn query_time_range() {
    for (name, store) in stores().await {
        let now = Utc::now();
        let mut old = entry(1, "Bash", "agent", AuditOutcome::Executed);
        old.timestamp = now - Duration::hours(2);
        let mut recent = entry(2, "Bash", "agent", AuditOutcome::Executed);
        recent.timestamp = now;
        store.append(&old).await.unwrap();
        store.append(&recent).await.unwrap();

        let since = store
            .query(&AuditFilter::new().since(now - Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(since.len(), 1, "{name}");
        assert_eq!(since[0].seq, 2, "{name}");

        let until = store
            .query(&AuditFilter::new().until(now - Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(until.len(), 1, "{name}");
        assert_eq!(until[0].seq, 1, "{name}");
    }
}

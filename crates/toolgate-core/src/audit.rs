//! Append-only audit trail of tool calls.
//!
//! Entries are numbered under the same lock that appends them, so `seq`
//! order is completion order and no two entries interleave. With a
//! persistent [`AuditStore`] attached, entries are also handed (in `seq`
//! order) to a single background writer task; persistence failures are
//! logged and counted, never surfaced to the tool call.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use toolgate_state::{
    AuditFilter, AuditLogEntry, AuditOutcome, AuditStore, StoreResult, Violation,
};
use tracing::{debug, info};

use crate::metrics::METRICS;
use crate::obs;
use crate::tool::ToolInput;

/// Argument keys whose values are file contents; stored as digest + length.
const CONTENT_KEYS: [&str; 5] = [
    "content",
    "file_content",
    "new_string",
    "old_string",
    "new_source",
];

/// Substrings marking an argument key as a secret.
const SECRET_MARKERS: [&str; 8] = [
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "credential",
];

/// Longest argument string kept verbatim.
pub const MAX_ARGUMENT_CHARS: usize = 2000;

/// Longest output preview kept on an entry.
pub const OUTPUT_PREVIEW_CHARS: usize = 1000;

/// Everything known about a finished call, before numbering and redaction.
#[derive(Debug, Clone)]
pub struct AuditDraft {
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub success: bool,
    pub outcome: AuditOutcome,
    pub reason: Option<String>,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub violations: Vec<Violation>,
    pub caller_id: Option<String>,
    pub session_id: Option<String>,
}

impl AuditDraft {
    pub fn for_call(input: &ToolInput, outcome: AuditOutcome) -> Self {
        Self {
            tool_name: input.tool_name.clone(),
            arguments: input.arguments.clone(),
            success: matches!(outcome, AuditOutcome::Executed | AuditOutcome::PassedThrough),
            outcome,
            reason: None,
            duration_ms: 0,
            exit_code: None,
            output: None,
            violations: Vec::new(),
            caller_id: input.caller_id.clone(),
            session_id: None,
        }
    }
}

enum WriterCommand {
    Append(AuditLogEntry),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct LogState {
    next_seq: u64,
    entries: Vec<AuditLogEntry>,
}

/// In-process audit log with optional write-through to an [`AuditStore`].
pub struct AuditLog {
    enabled: bool,
    state: Mutex<LogState>,
    writer: Option<mpsc::UnboundedSender<WriterCommand>>,
    store: Option<Arc<dyn AuditStore>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("enabled", &self.enabled)
            .field("entries", &self.len())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl AuditLog {
    /// Memory-only log. A disabled log drops every entry.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: Mutex::new(LogState {
                next_seq: 1,
                entries: Vec::new(),
            }),
            writer: None,
            store: None,
        }
    }

    /// Log that also writes every entry to `store`.
    ///
    /// Numbering continues after the store's highest `seq`. Spawns the
    /// writer task on the current Tokio runtime.
    pub async fn persistent(enabled: bool, store: Arc<dyn AuditStore>) -> StoreResult<Self> {
        let next_seq = store.last_seq().await?.map_or(1, |s| s + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(store.clone(), rx));
        info!(next_seq, "audit log attached to persistent store");

        Ok(Self {
            enabled,
            state: Mutex::new(LogState {
                next_seq,
                entries: Vec::new(),
            }),
            writer: Some(tx),
            store: Some(store),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The attached store, for queries over earlier processes' entries.
    pub fn store(&self) -> Option<&Arc<dyn AuditStore>> {
        self.store.as_ref()
    }

    /// Redact, number and append. Returns the assigned `seq`, or `None`
    /// when the log is disabled.
    pub fn record(&self, draft: AuditDraft) -> Option<u64> {
        if !self.enabled {
            return None;
        }

        let arguments = redact_arguments(&draft.arguments);
        let output_preview = draft.output.as_deref().map(preview);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = state.next_seq;
        state.next_seq += 1;

        let entry = AuditLogEntry {
            seq,
            timestamp: Utc::now(),
            tool_name: draft.tool_name,
            arguments,
            success: draft.success,
            outcome: draft.outcome,
            reason: draft.reason,
            duration_ms: draft.duration_ms,
            exit_code: draft.exit_code,
            output_preview,
            violations: draft.violations,
            caller_id: draft.caller_id,
            session_id: draft.session_id,
        };
        debug!(
            seq,
            tool = %entry.tool_name,
            outcome = %entry.outcome,
            duration_ms = entry.duration_ms,
            "audit entry recorded"
        );

        if let Some(writer) = &self.writer {
            // Sent under the lock so the writer sees entries in seq order.
            if writer.send(WriterCommand::Append(entry.clone())).is_err() {
                METRICS.inc_audit_persist_failures();
                obs::emit_audit_persist_error(seq, &"audit writer stopped");
            }
        }
        state.entries.push(entry);
        Some(seq)
    }

    /// Entries of this process matching `filter`, in `seq` order.
    pub fn entries(&self, filter: &AuditFilter) -> Vec<AuditLogEntry> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        filter.apply(state.entries.iter())
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every entry recorded so far has reached the store.
    pub async fn flush(&self) {
        let Some(writer) = &self.writer else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if writer.send(WriterCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// One JSON object per line, in `seq` order.
    pub fn export_jsonl(&self) -> serde_json::Result<String> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = String::new();
        for entry in &state.entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        Ok(out)
    }
}

async fn run_writer(store: Arc<dyn AuditStore>, mut rx: mpsc::UnboundedReceiver<WriterCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Append(entry) => {
                if let Err(e) = store.append(&entry).await {
                    METRICS.inc_audit_persist_failures();
                    obs::emit_audit_persist_error(entry.seq, &e);
                }
            }
            WriterCommand::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("audit writer stopped");
}

// ---------------------------------------------------------------------------
// Redaction
// ---------------------------------------------------------------------------

/// Copy of `arguments` safe to retain: file contents become digests, secrets
/// are masked and long strings truncated.
pub fn redact_arguments(arguments: &Map<String, Value>) -> Value {
    Value::Object(
        arguments
            .iter()
            .map(|(key, value)| (key.clone(), redact_value(key, value)))
            .collect(),
    )
}

fn redact_value(key: &str, value: &Value) -> Value {
    let lowered = key.to_ascii_lowercase();
    if SECRET_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Value::String("***".to_string());
    }
    match value {
        Value::String(s) if CONTENT_KEYS.contains(&lowered.as_str()) => serde_json::json!({
            "sha256": hex::encode(Sha256::digest(s.as_bytes())),
            "bytes": s.len(),
        }),
        Value::String(s) => Value::String(truncate_chars(s, MAX_ARGUMENT_CHARS)),
        Value::Object(map) => redact_arguments(map),
        Value::Array(items) => Value::Array(items.iter().map(|v| redact_value("", v)).collect()),
        other => other.clone(),
    }
}

/// Output preview stored on an entry.
pub fn preview(output: &str) -> String {
    truncate_chars(output, OUTPUT_PREVIEW_CHARS)
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        None => s.to_string(),
        Some((cut, _)) => {
            let dropped = s[cut..].chars().count();
            format!("{}... [{} more chars]", &s[..cut], dropped)
        }
    }
}

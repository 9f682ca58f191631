//! Tool proxy: validate, dispatch into the sandbox session, audit.
//!
//! One [`SandboxExecutor`] owns at most one live [`SandboxSession`]. The
//! session sits behind an async mutex, so concurrent calls through the same
//! executor queue for it and never run two operations on it at once. The
//! session is provisioned on first use and re-provisioned transparently
//! after it fails, is closed, or sits idle past `session_timeout_minutes`.
//!
//! Every call that reaches the dispatch stage leaves exactly one audit
//! entry, including calls whose future is dropped mid-flight; rejected calls
//! are audited by the [`SecurityManager`].

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use toolgate_state::{AuditFilter, AuditLogEntry, AuditOutcome, RiskLevel, Violation};
use tracing::{debug, instrument, warn};

use crate::audit::{AuditDraft, AuditLog};
use crate::config::{ConfigResult, SandboxConfig};
use crate::metrics::METRICS;
use crate::obs;
use crate::sandbox::{
    provision, ConnectPolicy, SandboxBackend, SandboxSession, SessionError, SessionResult,
    SessionSpec,
};
use crate::security::{PolicyVerdict, SecurityManager, SecurityStats};
use crate::tool::{ToolInput, ToolOperation, PATH_KEYS};

/// Why a call did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Refused by policy; never reached the sandbox.
    Rejected,
    InvalidArguments,
    /// No sandbox operation for this tool.
    Unsupported,
    Timeout,
    Transport,
    /// The operation ran and failed (non-zero exit, missing file).
    OperationFailed,
    NotReady,
    Cancelled,
}

impl FailureKind {
    pub fn audit_outcome(self) -> AuditOutcome {
        match self {
            Self::Rejected => AuditOutcome::Rejected,
            Self::Unsupported => AuditOutcome::Unsupported,
            Self::Timeout => AuditOutcome::TimedOut,
            Self::Transport | Self::NotReady => AuditOutcome::TransportError,
            Self::Cancelled => AuditOutcome::Cancelled,
            Self::InvalidArguments | Self::OperationFailed => AuditOutcome::Failed,
        }
    }
}

impl From<&SessionError> for FailureKind {
    fn from(err: &SessionError) -> Self {
        match err {
            SessionError::NotReady { .. } => Self::NotReady,
            SessionError::Timeout { .. } => Self::Timeout,
            SessionError::Transport(_) => Self::Transport,
            SessionError::Operation(_) => Self::OperationFailed,
            SessionError::Cancelled => Self::Cancelled,
        }
    }
}

/// Outcome of one proxied tool call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub elapsed_ms: u64,
    /// Local id of the session that served the call.
    pub session_id: Option<String>,
    pub sandbox_id: Option<String>,
    pub failure: Option<FailureKind>,
    pub files_modified: Vec<String>,
}

impl ToolResult {
    pub fn failure(kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            failure: Some(kind),
            ..Self::default()
        }
    }

    /// Whether the call ran too long, as opposed to running and failing.
    pub fn timed_out(&self) -> bool {
        self.failure == Some(FailureKind::Timeout)
    }

    /// Agent-facing content block: `{"content": [{"type": "text", ...}]}`,
    /// with `"isError": true` on failure.
    pub fn to_tool_response(&self) -> Value {
        if self.success {
            return serde_json::json!({
                "content": [{"type": "text", "text": self.output}],
            });
        }
        let error = self.error.as_deref().unwrap_or("tool call failed");
        let text = if self.output.is_empty() {
            error.to_string()
        } else {
            format!("{error}\n{}", self.output)
        };
        serde_json::json!({
            "content": [{"type": "text", "text": text}],
            "isError": true,
        })
    }
}

/// Counters over calls routed through one executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStats {
    pub calls: u64,
    pub rejected: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub sessions_provisioned: u64,
    pub sessions_closed: u64,
    pub current_session: Option<String>,
    pub current_sandbox: Option<String>,
}

/// A validated sandbox operation with resolved arguments.
#[derive(Debug, Clone, PartialEq)]
enum SandboxOp {
    Command {
        command: String,
        timeout: Option<Duration>,
    },
    Read {
        path: String,
    },
    Write {
        path: String,
        content: String,
    },
    Edit {
        path: String,
        old: String,
        new: String,
        replace_all: bool,
    },
    List {
        root: String,
        pattern: String,
    },
    Search {
        query: String,
        root: String,
        include: Option<glob::Pattern>,
    },
}

impl SandboxOp {
    fn parse(
        op: ToolOperation,
        input: &ToolInput,
        resolve: impl Fn(&str) -> String,
    ) -> Result<Self, String> {
        let required = |keys: &[&str]| {
            input
                .str_arg(keys)
                .map(str::to_string)
                .ok_or_else(|| format!("missing required argument: {}", keys[0]))
        };
        let optional = |keys: &[&str]| input.str_arg(keys).map(str::to_string);

        Ok(match op {
            ToolOperation::ExecuteCommand => {
                let command = required(&["command"])?;
                if command.trim().is_empty() {
                    return Err("empty command".to_string());
                }
                let timeout = input
                    .arguments
                    .get("timeout")
                    .and_then(Value::as_f64)
                    .filter(|secs| *secs > 0.0)
                    .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
                SandboxOp::Command { command, timeout }
            }
            ToolOperation::ReadFile => SandboxOp::Read {
                path: resolve(&required(&PATH_KEYS)?),
            },
            ToolOperation::WriteFile => SandboxOp::Write {
                path: resolve(&required(&PATH_KEYS)?),
                content: optional(&["content", "file_content"]).unwrap_or_default(),
            },
            ToolOperation::EditFile => SandboxOp::Edit {
                path: resolve(&required(&PATH_KEYS)?),
                old: optional(&["old_string", "old_text"]).unwrap_or_default(),
                new: optional(&["new_string", "new_text"]).unwrap_or_default(),
                replace_all: input
                    .arguments
                    .get("replace_all")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            ToolOperation::ListFiles => SandboxOp::List {
                root: resolve(optional(&["path"]).as_deref().unwrap_or(".")),
                pattern: optional(&["pattern"]).unwrap_or_else(|| "*".to_string()),
            },
            ToolOperation::SearchFiles => SandboxOp::Search {
                query: required(&["pattern", "query"])?,
                root: resolve(optional(&["path"]).as_deref().unwrap_or(".")),
                include: optional(&["include", "glob"])
                    .map(|pattern| glob::Pattern::new(&pattern))
                    .transpose()
                    .map_err(|e| format!("invalid include pattern: {e}"))?,
            },
        })
    }
}

/// What an operation produced before it is stamped with session details.
#[derive(Debug, Default)]
struct OpOutput {
    success: bool,
    output: String,
    error: Option<String>,
    exit_code: Option<i32>,
    files_modified: Vec<String>,
}

impl OpOutput {
    fn ok(output: String) -> Self {
        Self {
            success: true,
            output,
            ..Self::default()
        }
    }

    fn failed(error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

async fn run_op(session: &mut SandboxSession, op: SandboxOp) -> SessionResult<OpOutput> {
    let cwd = session.working_directory().to_string();
    match op {
        SandboxOp::Command { command, timeout } => {
            let out = session.execute_command(&command, &cwd, timeout).await?;
            Ok(OpOutput {
                success: out.success(),
                output: out.combined(),
                error: (!out.success())
                    .then(|| format!("command exited with code {}", out.exit_code)),
                exit_code: Some(out.exit_code),
                files_modified: Vec::new(),
            })
        }
        SandboxOp::Read { path } => Ok(OpOutput::ok(session.read_file(&path).await?)),
        SandboxOp::Write { path, content } => {
            session.write_file(&path, &content).await?;
            Ok(OpOutput {
                files_modified: vec![path.clone()],
                ..OpOutput::ok(format!("wrote {} bytes to {path}", content.len()))
            })
        }
        SandboxOp::Edit {
            path,
            old,
            new,
            replace_all,
        } => {
            let original = match session.read_file(&path).await {
                Ok(content) => content,
                Err(SessionError::Operation(_)) => String::new(),
                Err(err) => return Err(err),
            };
            let (updated, replaced) = if old.is_empty() {
                (new, 0)
            } else if !original.contains(&old) {
                let shown: String = old.chars().take(100).collect();
                return Ok(OpOutput::failed(format!(
                    "text to replace not found in {path}: {shown}"
                )));
            } else if replace_all {
                (original.replace(&old, &new), original.matches(&old).count())
            } else {
                (original.replacen(&old, &new, 1), 1)
            };
            session.write_file(&path, &updated).await?;
            Ok(OpOutput {
                files_modified: vec![path.clone()],
                ..OpOutput::ok(format!("edited {path} ({replaced} replacement(s))"))
            })
        }
        SandboxOp::List { root, pattern } => {
            let command = format!(
                "find {} -type f -name {}",
                shell_words::quote(&root),
                shell_words::quote(&pattern)
            );
            let out = session.execute_command(&command, &cwd, None).await?;
            if out.success() {
                Ok(OpOutput {
                    exit_code: Some(0),
                    ..OpOutput::ok(out.stdout)
                })
            } else {
                Ok(OpOutput {
                    exit_code: Some(out.exit_code),
                    ..OpOutput::failed(out.combined())
                })
            }
        }
        SandboxOp::Search {
            query,
            root,
            include,
        } => {
            let matches = session.search_files(&query, &root).await?;
            let output = matches
                .iter()
                .filter(|m| {
                    include.as_ref().map_or(true, |pattern| {
                        pattern.matches(m.path.rsplit('/').next().unwrap_or(&m.path))
                    })
                })
                .map(|m| format!("{}:{}:{}\n", m.path, m.line, m.text))
                .collect();
            Ok(OpOutput::ok(output))
        }
    }
}

/// Records a `Cancelled` entry if dropped before [`finish`](Self::finish).
struct AuditGuard {
    inner: Arc<ExecutorInner>,
    draft: Option<AuditDraft>,
    started: Instant,
}

impl AuditGuard {
    fn new(inner: Arc<ExecutorInner>, input: &ToolInput, warnings: Vec<Violation>) -> Self {
        let mut draft = AuditDraft::for_call(input, AuditOutcome::Cancelled);
        draft.violations = warnings;
        Self {
            inner,
            draft: Some(draft),
            started: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        millis(self.started.elapsed())
    }

    fn finish(mut self, result: &ToolResult) {
        if let Some(mut draft) = self.draft.take() {
            draft.success = result.success;
            draft.outcome = match result.failure {
                None => AuditOutcome::Executed,
                Some(kind) => kind.audit_outcome(),
            };
            draft.reason = result.error.clone();
            draft.duration_ms = result.elapsed_ms;
            draft.exit_code = result.exit_code;
            draft.output = Some(result.output.clone()).filter(|o| !o.is_empty());
            draft.session_id = result.session_id.clone();
            self.inner.audit.record(draft);
        }
    }
}

impl Drop for AuditGuard {
    fn drop(&mut self) {
        if let Some(mut draft) = self.draft.take() {
            METRICS.inc_cancellations();
            self.inner.bump(|s| s.cancelled += 1);
            draft.success = false;
            draft.reason = Some("cancelled by caller".to_string());
            draft.duration_ms = self.elapsed_ms();
            self.inner.audit.record(draft);
        }
    }
}

struct ExecutorInner {
    config: SandboxConfig,
    backend: Arc<dyn SandboxBackend>,
    spec: SessionSpec,
    connect_policy: ConnectPolicy,
    security: SecurityManager,
    audit: Arc<AuditLog>,
    slot: tokio::sync::Mutex<Option<SandboxSession>>,
    stats: Mutex<ExecutorStats>,
}

impl ExecutorInner {
    fn bump(&self, f: impl FnOnce(&mut ExecutorStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Why the current session must not be reused, if it must not.
    fn stale_reason(&self, session: &SandboxSession) -> Option<&'static str> {
        if !session.is_ready() {
            Some(session.state().as_str())
        } else if self.config.auto_cleanup && session.is_expired(self.config.session_timeout()) {
            Some("idle")
        } else {
            None
        }
    }

    async fn retire(&self, mut session: SandboxSession, reason: &str) {
        session.close().await;
        obs::emit_session_closed(session.id(), reason);
        self.bump(|s| {
            s.sessions_closed += 1;
            if s.current_session.as_deref() == Some(session.id()) {
                s.current_session = None;
                s.current_sandbox = None;
            }
        });
    }

    /// Reuse the live session or provision a new one.
    async fn ensure_session<'a>(
        &self,
        slot: &'a mut Option<SandboxSession>,
    ) -> SessionResult<&'a mut SandboxSession> {
        let session = match slot.take() {
            Some(live) if self.stale_reason(&live).is_none() => live,
            stale => {
                if let Some(old) = stale {
                    let reason = self.stale_reason(&old).unwrap_or("replaced");
                    self.retire(old, reason).await;
                }
                let provisioned = provision(&self.backend, &self.spec, self.connect_policy).await?;
                let session = provisioned.session;
                let sandbox_id = session.sandbox_id().unwrap_or_default().to_string();
                METRICS.inc_sessions_provisioned();
                obs::emit_session_provisioned(session.id(), &sandbox_id, provisioned.attempts);
                self.bump(|s| {
                    s.sessions_provisioned += 1;
                    s.current_session = Some(session.id().to_string());
                    s.current_sandbox = Some(sandbox_id.clone());
                });
                session
            }
        };
        Ok(slot.insert(session))
    }

    async fn dispatch(&self, input: &ToolInput) -> ToolResult {
        let started = Instant::now();
        let Some(kind) = input.kind() else {
            return ToolResult::failure(
                FailureKind::Unsupported,
                format!("unsupported tool: {}", input.tool_name),
            );
        };
        let Some(operation) = kind.operation() else {
            return ToolResult::failure(
                FailureKind::Unsupported,
                format!("tool has no sandbox operation: {kind}"),
            );
        };
        let guard = self.security.path_guard();
        let op = match SandboxOp::parse(operation, input, |p| guard.normalize(p)) {
            Ok(op) => op,
            Err(msg) => return ToolResult::failure(FailureKind::InvalidArguments, msg),
        };

        let mut slot = self.slot.lock().await;
        let session = match self.ensure_session(&mut slot).await {
            Ok(session) => session,
            Err(err) => {
                let mut result = ToolResult::failure(FailureKind::from(&err), err.to_string());
                result.elapsed_ms = millis(started.elapsed());
                return result;
            }
        };
        let session_id = session.id().to_string();
        let sandbox_id = session.sandbox_id().map(str::to_string);

        let mut result = match run_op(session, op).await {
            Ok(out) => ToolResult {
                success: out.success,
                output: out.output,
                error: out.error,
                exit_code: out.exit_code,
                failure: (!out.success).then_some(FailureKind::OperationFailed),
                files_modified: out.files_modified,
                ..ToolResult::default()
            },
            Err(err) => {
                if matches!(err, SessionError::Timeout { .. }) {
                    METRICS.inc_timeouts();
                }
                ToolResult::failure(FailureKind::from(&err), err.to_string())
            }
        };
        drop(slot);

        result.elapsed_ms = millis(started.elapsed());
        result.session_id = Some(session_id);
        result.sandbox_id = sandbox_id;
        result
    }

    /// Close the session if it has been idle too long or has failed.
    async fn reap(&self) {
        let Ok(mut slot) = self.slot.try_lock() else {
            return;
        };
        let reason = match slot.as_ref().and_then(|s| self.stale_reason(s)) {
            Some(reason) => reason,
            None => return,
        };
        if let Some(session) = slot.take() {
            drop(slot);
            METRICS.inc_sessions_reaped();
            self.retire(session, reason).await;
        }
    }
}

async fn reap_loop(inner: Weak<ExecutorInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.reap().await;
    }
}

/// Validates tool calls and runs them in a sandbox session.
pub struct SandboxExecutor {
    inner: Arc<ExecutorInner>,
    reaper: Option<JoinHandle<()>>,
}

impl fmt::Debug for SandboxExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxExecutor")
            .field("backend", &self.inner.backend.kind())
            .field("reaper", &self.reaper.is_some())
            .finish_non_exhaustive()
    }
}

impl SandboxExecutor {
    /// Validate `config` and build an executor with an in-memory audit log.
    pub fn new(config: SandboxConfig, backend: Arc<dyn SandboxBackend>) -> ConfigResult<Self> {
        let audit = Arc::new(AuditLog::new(config.security.enable_audit_log));
        Self::with_audit_log(config, backend, audit)
    }

    /// Build an executor that writes to `audit`, e.g. one backed by a store.
    pub fn with_audit_log(
        config: SandboxConfig,
        backend: Arc<dyn SandboxBackend>,
        audit: Arc<AuditLog>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let security = SecurityManager::with_audit_log(
            config.security.clone(),
            config.rate_limit.as_ref(),
            &config.working_directory,
            audit.clone(),
        )?;
        let inner = Arc::new(ExecutorInner {
            spec: SessionSpec::from_config(&config),
            connect_policy: ConnectPolicy::from_config(&config),
            backend,
            security,
            audit,
            slot: tokio::sync::Mutex::new(None),
            stats: Mutex::new(ExecutorStats::default()),
            config,
        });

        let reaper = if inner.config.auto_cleanup {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => Some(handle.spawn(reap_loop(
                    Arc::downgrade(&inner),
                    inner.config.reaper_interval(),
                ))),
                Err(_) => {
                    debug!("no tokio runtime, idle sessions are only replaced on next use");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self { inner, reaper })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.inner.config
    }

    pub fn security(&self) -> &SecurityManager {
        &self.inner.security
    }

    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.inner.audit
    }

    /// Validate and run one tool call. Never fails: every outcome is a
    /// [`ToolResult`].
    pub async fn execute(&self, input: ToolInput) -> ToolResult {
        let started = AtomicBool::new(false);
        self.execute_tracked(input, &started).await
    }

    /// Like [`execute`](Self::execute), abandoned as soon as `cancel` resolves.
    ///
    /// A cancelled call is audited as `Cancelled` and leaves the session
    /// `Failed`, so the next call provisions a fresh one.
    pub async fn execute_until<C>(&self, input: ToolInput, cancel: C) -> ToolResult
    where
        C: Future<Output = ()>,
    {
        let started = AtomicBool::new(false);
        let audit_input = input.clone();
        let result = {
            let call = self.execute_tracked(input, &started);
            tokio::pin!(call);
            tokio::select! {
                result = &mut call => Some(result),
                () = cancel => None,
            }
        };

        match result {
            Some(result) => result,
            None => {
                if !started.load(Ordering::SeqCst) {
                    METRICS.inc_cancellations();
                    let mut draft = AuditDraft::for_call(&audit_input, AuditOutcome::Cancelled);
                    draft.reason = Some("cancelled by caller".to_string());
                    self.inner.audit.record(draft);
                    self.inner.bump(|s| s.cancelled += 1);
                }
                ToolResult::failure(FailureKind::Cancelled, "cancelled by caller")
            }
        }
    }

    #[instrument(skip_all, fields(tool = %input.tool_name, caller = %input.caller()))]
    async fn execute_tracked(&self, input: ToolInput, started: &AtomicBool) -> ToolResult {
        let inner = &self.inner;
        inner.bump(|s| s.calls += 1);

        let warnings = match inner.security.validate_tool_call(&input) {
            PolicyVerdict::Allowed { warnings } => warnings,
            PolicyVerdict::Denied(rejection) => {
                inner.bump(|s| s.rejected += 1);
                return ToolResult::failure(FailureKind::Rejected, rejection.reason);
            }
        };

        let guard = AuditGuard::new(inner.clone(), &input, warnings);
        started.store(true, Ordering::SeqCst);
        METRICS.inc_executions();

        let result = inner.dispatch(&input).await;

        obs::emit_tool_executed(
            &input.tool_name,
            result.session_id.as_deref(),
            result.elapsed_ms,
            result.success,
        );
        inner.bump(|s| {
            if result.success {
                s.succeeded += 1;
            } else {
                s.failed += 1;
            }
            if result.timed_out() {
                s.timeouts += 1;
            }
        });
        guard.finish(&result);
        result
    }

    /// Validate without executing. An allowed call is audited with
    /// `outcome`; a rejected one is audited by the security manager.
    pub(crate) fn admit(
        &self,
        input: &ToolInput,
        outcome: AuditOutcome,
        reason: Option<String>,
    ) -> PolicyVerdict {
        let verdict = self.inner.security.validate_tool_call(input);
        if let PolicyVerdict::Allowed { warnings } = &verdict {
            let mut draft = AuditDraft::for_call(input, outcome);
            draft.violations = warnings.clone();
            draft.reason = reason;
            self.inner.audit.record(draft);
        }
        verdict
    }

    pub fn get_audit_logs(&self, filter: &AuditFilter) -> Vec<AuditLogEntry> {
        self.inner.audit.entries(filter)
    }

    pub fn get_violations(&self, risk_level: Option<RiskLevel>) -> Vec<Violation> {
        self.inner.security.get_violations(risk_level)
    }

    pub fn get_stats(&self) -> SecurityStats {
        self.inner.security.get_stats()
    }

    pub fn stats(&self) -> ExecutorStats {
        self.inner
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Close the live session, if any. The executor stays usable.
    pub async fn close(&self) {
        let session = self.inner.slot.lock().await.take();
        if let Some(session) = session {
            self.inner.retire(session, "shutdown").await;
        }
    }

    /// Close the live session and wait for pending audit writes.
    pub async fn shutdown(mut self) {
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
        self.close().await;
        self.inner.audit.flush().await;
    }
}

impl Drop for SandboxExecutor {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
        let Ok(mut slot) = self.inner.slot.try_lock() else {
            return;
        };
        let Some((backend, handle)) = slot.take().and_then(SandboxSession::detach) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(err) = backend.close(&handle).await {
                        warn!(
                            sandbox_id = %handle.id,
                            error = %err,
                            "sandbox close on drop failed"
                        );
                    }
                });
            }
            Err(_) => {
                warn!(sandbox_id = %handle.id, "dropped outside a runtime, sandbox left open")
            }
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

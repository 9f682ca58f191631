//! One provisioned sandbox and its lifecycle.
//!
//! ```text
//! Created -> Connecting -> Ready <-> Executing
//!                 |          |          |
//!                 +--------> Failed <---+
//!                            |
//!           Ready | Failed -> Closed
//! ```
//!
//! Operations take `&mut self`, so one session never runs two operations at
//! once. Every operation is bounded by the session's operation timeout. A
//! timeout, a transport error or a dropped (cancelled) operation leaves the
//! session `Failed`; an application-level error puts it back to `Ready`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::backend::{
    BackendResult, CommandOutput, SandboxBackend, SearchMatch, SessionHandle, SessionSpec,
};
use super::error::{SessionError, SessionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Connecting,
    Ready,
    Executing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marks the session `Failed` unless the in-flight operation settles first.
struct InFlight<'a> {
    state: &'a mut SessionState,
    settled: bool,
}

impl<'a> InFlight<'a> {
    fn begin(state: &'a mut SessionState, during: SessionState) -> Self {
        *state = during;
        Self {
            state,
            settled: false,
        }
    }

    fn settle(mut self, next: SessionState) {
        *self.state = next;
        self.settled = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            *self.state = SessionState::Failed;
        }
    }
}

pub struct SandboxSession {
    id: String,
    backend: Arc<dyn SandboxBackend>,
    spec: SessionSpec,
    handle: Option<SessionHandle>,
    state: SessionState,
    operation_timeout: Duration,
    created_at: DateTime<Utc>,
    last_activity: Instant,
    operations: u64,
}

impl fmt::Debug for SandboxSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxSession")
            .field("id", &self.id)
            .field("backend", &self.backend.kind())
            .field("sandbox_id", &self.sandbox_id())
            .field("state", &self.state)
            .field("operations", &self.operations)
            .finish()
    }
}

impl SandboxSession {
    /// A session in `Created`; call [`connect`](Self::connect) before use.
    pub fn new(backend: Arc<dyn SandboxBackend>, spec: SessionSpec) -> Self {
        let operation_timeout = spec.resource_limits.operation_timeout();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            backend,
            spec,
            handle: None,
            state: SessionState::Created,
            operation_timeout,
            created_at: Utc::now(),
            last_activity: Instant::now(),
            operations: 0,
        }
    }

    /// Local identifier, distinct for every provisioned session.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Backend-assigned identifier, once connected.
    pub fn sandbox_id(&self) -> Option<&str> {
        self.handle.as_ref().map(|h| h.id.as_str())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub fn working_directory(&self) -> &str {
        &self.spec.working_directory
    }

    /// Completed operations so far.
    pub fn operations(&self) -> u64 {
        self.operations
    }

    /// Time since the last connect or operation.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn is_expired(&self, idle_timeout: Duration) -> bool {
        self.idle_for() >= idle_timeout
    }

    /// Provision the remote sandbox. Valid only from `Created`.
    pub async fn connect(&mut self) -> SessionResult<()> {
        if self.state != SessionState::Created {
            return Err(SessionError::NotReady { state: self.state });
        }
        let limit = self.operation_timeout;
        let backend = self.backend.clone();
        let spec = self.spec.clone();

        let guard = InFlight::begin(&mut self.state, SessionState::Connecting);
        match tokio::time::timeout(limit, backend.connect(&spec)).await {
            Ok(Ok(handle)) => {
                guard.settle(SessionState::Ready);
                debug!(session_id = %self.id, sandbox_id = %handle.id, "sandbox connected");
                self.handle = Some(handle);
                self.last_activity = Instant::now();
                Ok(())
            }
            Ok(Err(err)) => {
                guard.settle(SessionState::Failed);
                Err(err.into())
            }
            Err(_) => {
                guard.settle(SessionState::Failed);
                Err(SessionError::Timeout {
                    limit_ms: millis(limit),
                })
            }
        }
    }

    /// Run `command` in `cwd`, bounded by `timeout` capped at the session limit.
    pub async fn execute_command(
        &mut self,
        command: &str,
        cwd: &str,
        timeout: Option<Duration>,
    ) -> SessionResult<CommandOutput> {
        let limit = timeout.map_or(self.operation_timeout, |t| t.min(self.operation_timeout));
        let started = Instant::now();
        let mut output = self
            .run(limit, |backend, handle| async move {
                backend.execute_command(&handle, command, cwd, limit).await
            })
            .await?;
        if output.elapsed_ms == 0 {
            output.elapsed_ms = millis(started.elapsed());
        }
        Ok(output)
    }

    pub async fn read_file(&mut self, path: &str) -> SessionResult<String> {
        let limit = self.operation_timeout;
        self.run(limit, |backend, handle| async move {
            backend.read_file(&handle, path).await
        })
        .await
    }

    pub async fn write_file(&mut self, path: &str, content: &str) -> SessionResult<()> {
        let limit = self.operation_timeout;
        self.run(limit, |backend, handle| async move {
            backend.write_file(&handle, path, content).await
        })
        .await
    }

    pub async fn search_files(
        &mut self,
        query: &str,
        root: &str,
    ) -> SessionResult<Vec<SearchMatch>> {
        let limit = self.operation_timeout;
        self.run(limit, |backend, handle| async move {
            backend.search_files(&handle, query, root).await
        })
        .await
    }

    async fn run<T, F, Fut>(&mut self, limit: Duration, op: F) -> SessionResult<T>
    where
        F: FnOnce(Arc<dyn SandboxBackend>, SessionHandle) -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        let handle = match (&self.handle, self.state) {
            (Some(handle), SessionState::Ready) => handle.clone(),
            (_, state) => return Err(SessionError::NotReady { state }),
        };
        let backend = self.backend.clone();

        let guard = InFlight::begin(&mut self.state, SessionState::Executing);
        let result = tokio::time::timeout(limit, op(backend, handle)).await;
        let outcome = match result {
            Ok(Ok(value)) => {
                guard.settle(SessionState::Ready);
                Ok(value)
            }
            Ok(Err(err)) if err.is_transport() => {
                guard.settle(SessionState::Failed);
                Err(SessionError::from(err))
            }
            Ok(Err(err)) => {
                guard.settle(SessionState::Ready);
                Err(SessionError::from(err))
            }
            Err(_) => {
                guard.settle(SessionState::Failed);
                Err(SessionError::Timeout {
                    limit_ms: millis(limit),
                })
            }
        };

        self.operations += 1;
        self.last_activity = Instant::now();
        if self.state == SessionState::Failed {
            warn!(session_id = %self.id, "sandbox session failed");
        }
        outcome
    }

    /// Release the remote sandbox. Idempotent; backend errors are logged.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(handle) = self.handle.take() {
            if let Err(err) = self.backend.close(&handle).await {
                warn!(
                    session_id = %self.id,
                    sandbox_id = %handle.id,
                    error = %err,
                    "sandbox close failed"
                );
            }
        }
        self.state = SessionState::Closed;
    }

    /// Take the pieces needed to close this session from another task.
    pub(crate) fn detach(mut self) -> Option<(Arc<dyn SandboxBackend>, SessionHandle)> {
        self.state = SessionState::Closed;
        self.handle.take().map(|h| (self.backend.clone(), h))
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::sandbox::memory::MemorySandbox;

    fn session(backend: Arc<MemorySandbox>) -> SandboxSession {
        SandboxSession::new(backend, SessionSpec::from_config(&SandboxConfig::memory()))
    }

    #[tokio::test]
    async fn lifecycle() {
        let backend = Arc::new(MemorySandbox::new());
        let mut s = session(backend.clone());
        assert_eq!(s.state(), SessionState::Created);

        let err = s.read_file("/workspace/a").await.unwrap_err();
        assert_eq!(err, SessionError::NotReady { state: SessionState::Created });

        s.connect().await.unwrap();
        assert!(s.is_ready());
        assert!(s.sandbox_id().is_some());

        s.write_file("/workspace/a", "hi").await.unwrap();
        assert_eq!(s.read_file("/workspace/a").await.unwrap(), "hi");
        assert_eq!(s.operations(), 2);

        s.close().await;
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(backend.closes(), 1);
        assert!(matches!(
            s.read_file("/workspace/a").await,
            Err(SessionError::NotReady { .. })
        ));
        s.close().await;
        assert_eq!(backend.closes(), 1);
    }

    #[tokio::test]
    async fn connect_twice_is_rejected() {
        let mut s = session(Arc::new(MemorySandbox::new()));
        s.connect().await.unwrap();
        assert!(matches!(s.connect().await, Err(SessionError::NotReady { .. })));
    }

    #[tokio::test]
    async fn operation_error_keeps_session_ready() {
        let mut s = session(Arc::new(MemorySandbox::new()));
        s.connect().await.unwrap();
        let err = s.read_file("/workspace/missing").await.unwrap_err();
        assert!(matches!(err, SessionError::Operation(_)));
        assert!(s.is_ready());
    }

    #[tokio::test]
    async fn transport_error_fails_session() {
        let backend = Arc::new(MemorySandbox::new());
        let mut s = session(backend.clone());
        s.connect().await.unwrap();
        backend.fail_next_operations(1);
        let err = s.execute_command("echo hi", "/workspace", None).await.unwrap_err();
        assert!(err.poisons_session());
        assert_eq!(s.state(), SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_session() {
        let mut s = session(Arc::new(MemorySandbox::new()));
        s.connect().await.unwrap();
        let err = s
            .execute_command("sleep 600", "/workspace", Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Timeout { limit_ms: 5_000 });
        assert_eq!(s.state(), SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn requested_timeout_is_capped() {
        let mut s = session(Arc::new(MemorySandbox::new()));
        s.connect().await.unwrap();
        let err = s
            .execute_command("sleep 600", "/workspace", Some(Duration::from_secs(3600)))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Timeout { limit_ms: 60_000 });
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_operation_fails_session() {
        let mut s = session(Arc::new(MemorySandbox::new()));
        s.connect().await.unwrap();
        {
            let op = s.execute_command("sleep 10", "/workspace", None);
            let _ = tokio::time::timeout(Duration::from_secs(1), op).await;
        }
        assert_eq!(s.state(), SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_expiry() {
        let mut s = session(Arc::new(MemorySandbox::new()));
        s.connect().await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!s.is_expired(Duration::from_secs(60)));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(s.is_expired(Duration::from_secs(60)));
    }
}

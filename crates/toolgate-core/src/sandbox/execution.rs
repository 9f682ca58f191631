//! Session provisioning with retry and exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::backend::{SandboxBackend, SessionSpec};
use super::error::{SessionError, SessionResult};
use super::session::SandboxSession;
use crate::config::SandboxConfig;

/// Retry policy for connecting a new session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectPolicy {
    /// Retries after the first attempt (0 = connect once).
    pub max_retries: u32,
    /// Base delay for exponential backoff between attempts (milliseconds).
    pub backoff_base_ms: u64,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 250,
        }
    }
}

impl ConnectPolicy {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            max_retries: config.max_connect_retries,
            backoff_base_ms: config.connect_backoff_ms,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// A connected session and how many attempts it took.
#[derive(Debug)]
pub struct Provisioned {
    pub session: SandboxSession,
    pub attempts: u32,
}

/// Connect a fresh session, retrying transport failures and timeouts.
///
/// Application-level connect errors are returned immediately. The error
/// from the last attempt is returned once the retry budget is spent.
pub async fn provision(
    backend: &Arc<dyn SandboxBackend>,
    spec: &SessionSpec,
    policy: ConnectPolicy,
) -> SessionResult<Provisioned> {
    let max_attempts = policy.max_retries.saturating_add(1);
    let mut attempt = 1;
    loop {
        let mut session = SandboxSession::new(backend.clone(), spec.clone());
        let connected = session.connect().await;
        match connected {
            Ok(()) => {
                return Ok(Provisioned {
                    session,
                    attempts: attempt,
                })
            }
            Err(err) if err.poisons_session() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    backend = backend.kind(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "sandbox connect failed, retrying"
                );
                session.close().await;
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                session.close().await;
                return Err(match err {
                    SessionError::Transport(msg) if max_attempts > 1 => SessionError::Transport(
                        format!("{msg} (after {max_attempts} attempts)"),
                    ),
                    other => other,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::memory::MemorySandbox;
    use crate::sandbox::SessionState;

    fn spec() -> SessionSpec {
        SessionSpec::from_config(&SandboxConfig::memory())
    }

    #[test]
    fn backoff_doubles() {
        let policy = ConnectPolicy {
            max_retries: 3,
            backoff_base_ms: 100,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
    }

    #[test]
    fn policy_follows_config() {
        let config = SandboxConfig {
            max_connect_retries: 5,
            connect_backoff_ms: 10,
            ..SandboxConfig::memory()
        };
        assert_eq!(
            ConnectPolicy::from_config(&config),
            ConnectPolicy {
                max_retries: 5,
                backoff_base_ms: 10
            }
        );
    }

    #[tokio::test]
    async fn connects_first_time() {
        let mem = Arc::new(MemorySandbox::new());
        let backend: Arc<dyn SandboxBackend> = mem.clone();
        let p = provision(&backend, &spec(), ConnectPolicy::default()).await.unwrap();
        assert_eq!(p.attempts, 1);
        assert_eq!(p.session.state(), SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let mem = Arc::new(MemorySandbox::new());
        mem.fail_next_connects(2);
        let backend: Arc<dyn SandboxBackend> = mem.clone();
        let p = provision(&backend, &spec(), ConnectPolicy::default()).await.unwrap();
        assert_eq!(p.attempts, 3);
        assert_eq!(mem.connects(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_retries() {
        let mem = Arc::new(MemorySandbox::new());
        mem.fail_next_connects(10);
        let backend: Arc<dyn SandboxBackend> = mem.clone();
        let policy = ConnectPolicy {
            max_retries: 1,
            backoff_base_ms: 10,
        };
        let err = provision(&backend, &spec(), policy).await.unwrap_err();
        assert!(err.to_string().contains("after 2 attempts"), "{err}");
        assert_eq!(mem.connects(), 2);
    }
}

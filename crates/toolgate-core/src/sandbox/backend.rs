//! The contract a remote execution sandbox has to provide.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{NetworkConfig, ResourceLimits, SandboxConfig};

/// Failure of a backend call.
///
/// `Transport` means the sandbox could not be reached or the session is gone;
/// `Operation` means the sandbox answered but refused the request (missing
/// file, bad path). A command that ran and exited non-zero is neither: it is
/// a normal [`CommandOutput`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("{0}")]
    Operation(String),
}

impl BackendError {
    pub fn is_transport(&self) -> bool {
        matches!(self, BackendError::Transport(_))
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// What to provision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSpec {
    pub template: String,
    pub resource_limits: ResourceLimits,
    pub network: NetworkConfig,
    pub working_directory: String,
}

impl SessionSpec {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            template: config.template.clone(),
            resource_limits: config.resource_limits.clone(),
            network: config.network.clone(),
            working_directory: config.working_directory.clone(),
        }
    }
}

/// Backend-assigned identifier of a provisioned sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle {
    pub id: String,
}

impl SessionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub elapsed_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr, separated by a newline when both are set.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end_matches('\n'), self.stderr),
        }
    }
}

/// One line matched by a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub path: String,
    pub line: u64,
    pub text: String,
}

/// Remote execution sandbox.
///
/// Implementations hold no per-session state of their own beyond what the
/// handle identifies; [`super::SandboxSession`] owns lifecycle and timeouts.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Short name used in logs, e.g. `"http"` or `"memory"`.
    fn kind(&self) -> &'static str;

    async fn connect(&self, spec: &SessionSpec) -> BackendResult<SessionHandle>;

    async fn execute_command(
        &self,
        handle: &SessionHandle,
        command: &str,
        cwd: &str,
        timeout: Duration,
    ) -> BackendResult<CommandOutput>;

    async fn read_file(&self, handle: &SessionHandle, path: &str) -> BackendResult<String>;

    async fn write_file(&self, handle: &SessionHandle, path: &str, content: &str)
        -> BackendResult<()>;

    async fn search_files(
        &self,
        handle: &SessionHandle,
        query: &str,
        root: &str,
    ) -> BackendResult<Vec<SearchMatch>>;

    async fn close(&self, handle: &SessionHandle) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_output() {
        let out = CommandOutput {
            stdout: "a\n".into(),
            stderr: "b".into(),
            exit_code: 1,
            elapsed_ms: 0,
        };
        assert_eq!(out.combined(), "a\nb");
        assert!(!out.success());
        assert_eq!(CommandOutput::default().combined(), "");
    }

    #[test]
    fn spec_follows_config() {
        let config = SandboxConfig::memory();
        let spec = SessionSpec::from_config(&config);
        assert_eq!(spec.template, config.template);
        assert_eq!(spec.working_directory, "/workspace");
    }
}

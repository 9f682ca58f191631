//! Toolgate Remote: HTTP sandbox backend
//!
//! Implements [`toolgate_core::SandboxBackend`] over a REST sandbox
//! service and picks a backend from a [`SandboxConfig`].

pub mod client;
pub mod error;

use std::sync::Arc;

use toolgate_core::{
    MemorySandbox, SandboxBackend, SandboxConfig, SandboxExecutor, SandboxKind,
};
use tracing::info;

pub use client::{HttpBackendConfig, HttpSandboxBackend, API_KEY_ENV, URL_ENV};
pub use error::{RemoteError, Result};

/// Backend for `config.sandbox_kind`.
///
/// For [`SandboxKind::Http`] the configured endpoint and key win over the
/// environment; with neither set this fails with
/// [`RemoteError::NotConfigured`].
pub fn backend_for(config: &SandboxConfig) -> Result<Arc<dyn SandboxBackend>> {
    config.validate()?;
    match config.sandbox_kind {
        SandboxKind::Memory => Ok(Arc::new(MemorySandbox::new())),
        SandboxKind::Http => {
            let mut http = match config.endpoint.as_deref() {
                Some(endpoint) => HttpBackendConfig::new(endpoint),
                None => HttpBackendConfig::from_env()?,
            };
            if let Some(key) = &config.api_key {
                http = http.with_token(key.expose());
            }
            info!(base_url = %http.base_url, "using HTTP sandbox backend");
            Ok(Arc::new(HttpSandboxBackend::new(http)?))
        }
    }
}

/// Executor over the backend [`backend_for`] selects.
pub fn executor_for(config: SandboxConfig) -> Result<SandboxExecutor> {
    let backend = backend_for(&config)?;
    Ok(SandboxExecutor::new(config, backend)?)
}

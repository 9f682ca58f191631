//! REST client for a remote sandbox service
//!
//! Every sandbox is a resource under `/sandboxes`:
//!
//! | Operation  | Request                           | Response                         |
//! |------------|-----------------------------------|----------------------------------|
//! | connect    | `POST /sandboxes`                 | `{"id"}`                         |
//! | execute    | `POST /sandboxes/{id}/commands`   | `{"stdout","stderr","exitCode"}` |
//! | read file  | `GET /sandboxes/{id}/files?path=` | `{"content"}`                    |
//! | write file | `PUT /sandboxes/{id}/files`       | any 2xx                          |
//! | search     | `POST /sandboxes/{id}/search`     | `{"matches":[{path,line,text}]}` |
//! | close      | `DELETE /sandboxes/{id}`          | any 2xx, 404 or 410              |
//!
//! Errors carry `{"error": "..."}` or a plain-text body.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use toolgate_core::{
    BackendResult, CommandOutput, NetworkConfig, ResourceLimits, SandboxBackend, SearchMatch,
    SessionHandle, SessionSpec,
};
use tracing::{debug, info, instrument, warn};

use crate::error::{RemoteError, Result};

/// Endpoint environment variable
pub const URL_ENV: &str = "TOOLGATE_SANDBOX_URL";
/// Bearer token environment variable
pub const API_KEY_ENV: &str = "TOOLGATE_SANDBOX_API_KEY";

/// Added on top of the command's own timeout for the HTTP round trip.
const COMMAND_SLACK: Duration = Duration::from_secs(10);

/// HTTP backend configuration
#[derive(Clone)]
pub struct HttpBackendConfig {
    /// Service base URL, without the `/sandboxes` suffix
    pub base_url: String,
    /// Bearer token (optional for unauthenticated services)
    pub token: Option<String>,
    /// Timeout for every request other than command execution
    pub request_timeout: Duration,
}

impl fmt::Debug for HttpBackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpBackendConfig")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl HttpBackendConfig {
    /// Config for a specific service
    pub fn new(base_url: &str) -> Self {
        HttpBackendConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Read `TOOLGATE_SANDBOX_URL` and `TOOLGATE_SANDBOX_API_KEY`
    pub fn from_env() -> Result<Self> {
        let url = std::env::var(URL_ENV)
            .ok()
            .filter(|u| !u.trim().is_empty())
            .ok_or(RemoteError::NotConfigured)?;
        let mut config = Self::new(&url);
        config.token = std::env::var(API_KEY_ENV).ok().filter(|t| !t.is_empty());
        Ok(config)
    }

    /// Set authentication token
    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandbox<'a> {
    template: &'a str,
    resource_limits: &'a ResourceLimits,
    network: &'a NetworkConfig,
    working_directory: &'a str,
}

#[derive(Deserialize)]
struct SandboxCreated {
    id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunCommand<'a> {
    command: &'a str,
    cwd: &'a str,
    timeout_seconds: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandResponse {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    exit_code: i32,
}

#[derive(Deserialize)]
struct FileResponse {
    content: String,
}

#[derive(Serialize)]
struct WriteFile<'a> {
    path: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct Search<'a> {
    query: &'a str,
    root: &'a str,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    matches: Vec<SearchMatch>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(alias = "message")]
    error: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Sandbox backend speaking the REST contract above
#[derive(Debug, Clone)]
pub struct HttpSandboxBackend {
    config: HttpBackendConfig,
    http: reqwest::Client,
}

impl HttpSandboxBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("toolgate-remote/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Client(e.to_string()))?;
        Ok(HttpSandboxBackend { config, http })
    }

    /// Create client from environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(HttpBackendConfig::from_env()?)
    }

    pub fn config(&self) -> &HttpBackendConfig {
        &self.config
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.config.base_url, path);
        let builder = self
            .http
            .request(method, url)
            .timeout(self.config.request_timeout);
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(RemoteError::Status {
            status: status.as_u16(),
            message: error_message(status, response).await,
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = self.send(builder).await?;
        Ok(response.json::<T>().await?)
    }

    /// Create a sandbox and return its service-assigned id
    pub async fn create(&self, spec: &SessionSpec) -> Result<String> {
        let body = CreateSandbox {
            template: &spec.template,
            resource_limits: &spec.resource_limits,
            network: &spec.network,
            working_directory: &spec.working_directory,
        };
        let created: SandboxCreated = self
            .send_json(self.request(Method::POST, "/sandboxes").json(&body))
            .await?;
        info!(sandbox_id = %created.id, template = %spec.template, "sandbox created");
        Ok(created.id)
    }

    pub async fn run(
        &self,
        sandbox_id: &str,
        command: &str,
        cwd: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let body = RunCommand {
            command,
            cwd,
            timeout_seconds: timeout.as_secs().max(1),
        };
        let started = Instant::now();
        let response: CommandResponse = self
            .send_json(
                self.request(Method::POST, &format!("/sandboxes/{sandbox_id}/commands"))
                    .timeout(timeout + COMMAND_SLACK)
                    .json(&body),
            )
            .await?;
        Ok(CommandOutput {
            stdout: response.stdout,
            stderr: response.stderr,
            exit_code: response.exit_code,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }

    pub async fn read(&self, sandbox_id: &str, path: &str) -> Result<String> {
        let file: FileResponse = self
            .send_json(
                self.request(Method::GET, &format!("/sandboxes/{sandbox_id}/files"))
                    .query(&[("path", path)]),
            )
            .await?;
        Ok(file.content)
    }

    pub async fn write(&self, sandbox_id: &str, path: &str, content: &str) -> Result<()> {
        self.send(
            self.request(Method::PUT, &format!("/sandboxes/{sandbox_id}/files"))
                .json(&WriteFile { path, content }),
        )
        .await?;
        Ok(())
    }

    pub async fn search(
        &self,
        sandbox_id: &str,
        query: &str,
        root: &str,
    ) -> Result<Vec<SearchMatch>> {
        let found: SearchResponse = self
            .send_json(
                self.request(Method::POST, &format!("/sandboxes/{sandbox_id}/search"))
                    .json(&Search { query, root }),
            )
            .await?;
        Ok(found.matches)
    }

    /// Delete a sandbox. One that is already gone counts as deleted.
    pub async fn delete(&self, sandbox_id: &str) -> Result<()> {
        match self
            .send(self.request(Method::DELETE, &format!("/sandboxes/{sandbox_id}")))
            .await
        {
            Ok(_) => Ok(()),
            Err(RemoteError::Status { status, .. }) if status == 404 || status == 410 => {
                debug!(sandbox_id, status, "sandbox already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

async fn error_message(status: StatusCode, response: Response) -> String {
    let text = response.text().await.unwrap_or_default();
    if let Ok(body) = serde_json::from_str::<ErrorBody>(&text) {
        return body.error;
    }
    let text = text.trim();
    if text.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string()
    } else {
        text.to_string()
    }
}

#[async_trait]
impl SandboxBackend for HttpSandboxBackend {
    fn kind(&self) -> &'static str {
        "http"
    }

    #[instrument(skip(self, spec), fields(base_url = %self.config.base_url))]
    async fn connect(&self, spec: &SessionSpec) -> BackendResult<SessionHandle> {
        let id = self.create(spec).await?;
        Ok(SessionHandle::new(id))
    }

    #[instrument(skip(self, handle, command), fields(sandbox_id = %handle.id))]
    async fn execute_command(
        &self,
        handle: &SessionHandle,
        command: &str,
        cwd: &str,
        timeout: Duration,
    ) -> BackendResult<CommandOutput> {
        let out = self.run(&handle.id, command, cwd, timeout).await?;
        debug!(exit_code = out.exit_code, elapsed_ms = out.elapsed_ms, "command finished");
        Ok(out)
    }

    async fn read_file(&self, handle: &SessionHandle, path: &str) -> BackendResult<String> {
        Ok(self.read(&handle.id, path).await?)
    }

    async fn write_file(
        &self,
        handle: &SessionHandle,
        path: &str,
        content: &str,
    ) -> BackendResult<()> {
        Ok(self.write(&handle.id, path, content).await?)
    }

    async fn search_files(
        &self,
        handle: &SessionHandle,
        query: &str,
        root: &str,
    ) -> BackendResult<Vec<SearchMatch>> {
        Ok(self.search(&handle.id, query, root).await?)
    }

    async fn close(&self, handle: &SessionHandle) -> BackendResult<()> {
        if let Err(e) = self.delete(&handle.id).await {
            warn!(sandbox_id = %handle.id, error = %e, "sandbox delete failed");
            return Err(e.into());
        }
        Ok(())
    }
}

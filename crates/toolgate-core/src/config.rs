//! Sandbox and security configuration.
//!
//! Every recognised option is a named field with a documented default;
//! `#[serde(default)]` lets a partial document fill the rest. Call
//! [`SandboxConfig::validate`] (the executor does) before use so malformed
//! patterns and contradictory tool lists fail at construction.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use toolgate_state::RiskLevel;

use crate::security::catalog;
use crate::tool::ToolKind;

/// Configuration errors. These abort construction.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid command pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("tools both allowed and blocked: {}", tools.join(", "))]
    ContradictoryToolLists { tools: Vec<String> },

    #[error("unknown tool name in {list}: {name}")]
    UnknownTool { list: &'static str, name: String },

    #[error("invalid {field}: {reason}")]
    InvalidLimit { field: &'static str, reason: String },

    #[error("sandbox kind {kind} requires an endpoint")]
    MissingEndpoint { kind: SandboxKind },

    #[error("unknown preset: {0} (expected minimal, standard or development)")]
    UnknownPreset(String),
}

/// Result type for configuration checks.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Which sandbox backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxKind {
    /// REST sandbox service (see the `toolgate-remote` crate).
    #[default]
    Http,
    /// In-process fake; for tests and local experiments.
    Memory,
}

impl fmt::Display for SandboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Http => "http",
            Self::Memory => "memory",
        })
    }
}

/// Limits handed to the remote sandbox. Only `timeout_seconds` is also
/// enforced locally, as the bound on every sandbox operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Default: 2
    pub cpu_cores: u32,
    /// Default: 512, minimum 128
    pub memory_mb: u64,
    /// Default: 1024
    pub disk_mb: u64,
    /// Default: 60
    pub timeout_seconds: u64,
    /// Default: 50
    pub max_processes: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_cores: 2,
            memory_mb: 512,
            disk_mb: 1024,
            timeout_seconds: 60,
            max_processes: 50,
        }
    }
}

impl ResourceLimits {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Network access granted inside the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Default: false
    pub enabled: bool,
    /// Default: empty
    pub allowed_domains: Vec<String>,
    /// Default: false
    pub allow_external_api: bool,
}

/// One command rule. Deserializes from a bare pattern string or a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CommandRuleRepr")]
pub struct CommandRule {
    /// Regular expression, matched case-insensitively.
    pub pattern: String,
    /// Rule family reported on violations. Default: "blacklist".
    pub category: String,
    pub description: String,
    /// Default: high
    pub risk_level: RiskLevel,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandRuleRepr {
    Pattern(String),
    Full {
        pattern: String,
        #[serde(default)]
        category: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        risk_level: Option<RiskLevel>,
    },
}

impl From<CommandRuleRepr> for CommandRule {
    fn from(repr: CommandRuleRepr) -> Self {
        match repr {
            CommandRuleRepr::Pattern(pattern) => CommandRule::new(pattern),
            CommandRuleRepr::Full {
                pattern,
                category,
                description,
                risk_level,
            } => {
                let mut rule = CommandRule::new(pattern);
                if let Some(category) = category {
                    rule.category = category;
                }
                if let Some(description) = description {
                    rule.description = description;
                }
                if let Some(risk) = risk_level {
                    rule.risk_level = risk;
                }
                rule
            }
        }
    }
}

impl CommandRule {
    /// User rule: category "blacklist", risk high.
    pub fn new(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        Self {
            description: format!("matches blacklist pattern {pattern}"),
            pattern,
            category: "blacklist".to_string(),
            risk_level: RiskLevel::High,
        }
    }

    pub fn categorized(
        category: &str,
        pattern: &str,
        description: &str,
        risk_level: RiskLevel,
    ) -> Self {
        Self {
            pattern: pattern.to_string(),
            category: category.to_string(),
            description: description.to_string(),
            risk_level,
        }
    }

    pub fn with_risk(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }
}

impl From<&str> for CommandRule {
    fn from(pattern: &str) -> Self {
        CommandRule::new(pattern)
    }
}

/// Tool and command policy.
///
/// Precedence: `blocked_tools` beats `allowed_tools`; a non-empty
/// `command_whitelist` beats `command_blacklist`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Empty means every tool is allowed. Default: empty
    pub allowed_tools: BTreeSet<String>,
    /// Default: empty
    pub blocked_tools: BTreeSet<String>,
    /// Evaluated in order. Default: the built-in dangerous-command catalog
    pub command_blacklist: Vec<CommandRule>,
    /// Regular expressions; when non-empty a command must match one.
    /// Default: empty
    pub command_whitelist: Vec<String>,
    /// Retain violations and audit entries. Default: true
    pub enable_audit_log: bool,
    /// Skip the filesystem path guard. Default: false
    pub allow_root: bool,
    /// Lowest risk that makes a command unsafe. Default: high
    pub block_threshold: RiskLevel,
    /// Expansion of `~` in path checks. Default: "/home/user"
    pub home_directory: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_tools: BTreeSet::new(),
            blocked_tools: BTreeSet::new(),
            command_blacklist: catalog::default_blacklist(),
            command_whitelist: Vec::new(),
            enable_audit_log: true,
            allow_root: false,
            block_threshold: RiskLevel::High,
            home_directory: "/home/user".to_string(),
        }
    }
}

/// Fixed-window admission control per caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Default: 100
    pub max_requests: u32,
    /// Default: 60
    pub window_seconds: u64,
    /// Windows idle for this many window lengths are evicted. Default: 2
    pub retention_windows: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_seconds: 60,
            retention_windows: 2,
        }
    }
}

/// API key that never shows up in `Debug` output or serialized config.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

// ---------------------------------------------------------------------------
// SandboxConfig
// ---------------------------------------------------------------------------

/// Top-level configuration for an executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Default: http
    pub sandbox_kind: SandboxKind,
    /// Sandbox service base URL. Default: none
    pub endpoint: Option<String>,
    /// Default: none
    #[serde(skip_serializing)]
    pub api_key: Option<ApiKey>,
    /// Sandbox image or template name. Default: "base"
    pub template: String,
    pub resource_limits: ResourceLimits,
    pub network: NetworkConfig,
    pub security: SecurityConfig,
    /// `None` disables rate limiting. Default: 100 requests / 60 s
    pub rate_limit: Option<RateLimitConfig>,
    /// Idle time before a session is closed. Default: 60
    pub session_timeout_minutes: u64,
    /// Close idle sessions automatically. Default: true
    pub auto_cleanup: bool,
    /// How often the background reaper looks for idle sessions. Default: 30
    pub reaper_interval_seconds: u64,
    /// Extra connect attempts after a transport failure. Default: 2
    pub max_connect_retries: u32,
    /// Base delay of the exponential connect backoff. Default: 250
    pub connect_backoff_ms: u64,
    /// Default: "/workspace"
    pub working_directory: String,
    /// Default: false
    pub debug: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            sandbox_kind: SandboxKind::Http,
            endpoint: None,
            api_key: None,
            template: "base".to_string(),
            resource_limits: ResourceLimits::default(),
            network: NetworkConfig::default(),
            security: SecurityConfig::default(),
            rate_limit: Some(RateLimitConfig::default()),
            session_timeout_minutes: 60,
            auto_cleanup: true,
            reaper_interval_seconds: 30,
            max_connect_retries: 2,
            connect_backoff_ms: 250,
            working_directory: "/workspace".to_string(),
            debug: false,
        }
    }
}

/// Named configuration bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// 1 core, 256 MB, 30 s, no network.
    Minimal,
    /// 2 cores, 512 MB, 60 s, no network.
    Standard,
    /// 4 cores, 2048 MB, 300 s, package registries reachable, debug on.
    Development,
}

impl FromStr for Preset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minimal" => Ok(Self::Minimal),
            "standard" => Ok(Self::Standard),
            "development" => Ok(Self::Development),
            _ => Err(ConfigError::UnknownPreset(s.to_string())),
        }
    }
}

impl SandboxConfig {
    /// Build a named preset on top of the defaults.
    pub fn preset(preset: Preset) -> Self {
        let mut config = Self::default();
        match preset {
            Preset::Minimal => {
                config.resource_limits.cpu_cores = 1;
                config.resource_limits.memory_mb = 256;
                config.resource_limits.timeout_seconds = 30;
            }
            Preset::Standard => {
                config.resource_limits.cpu_cores = 2;
                config.resource_limits.memory_mb = 512;
                config.resource_limits.timeout_seconds = 60;
            }
            Preset::Development => {
                config.resource_limits.cpu_cores = 4;
                config.resource_limits.memory_mb = 2048;
                config.resource_limits.timeout_seconds = 300;
                config.network = NetworkConfig {
                    enabled: true,
                    allowed_domains: vec![
                        "pypi.org".to_string(),
                        "npmjs.com".to_string(),
                        "github.com".to_string(),
                    ],
                    allow_external_api: false,
                };
                config.debug = true;
            }
        }
        config
    }

    /// In-process fake backend with otherwise default settings.
    pub fn memory() -> Self {
        Self {
            sandbox_kind: SandboxKind::Memory,
            ..Self::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(ApiKey::new(key));
        self
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_minutes.saturating_mul(60))
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_seconds)
    }

    /// Check every option. Returns the first problem found.
    pub fn validate(&self) -> ConfigResult<()> {
        let limits = &self.resource_limits;
        if limits.timeout_seconds < 1 {
            return Err(invalid("resource_limits.timeout_seconds", "must be at least 1"));
        }
        if limits.memory_mb < 128 {
            return Err(invalid("resource_limits.memory_mb", "must be at least 128"));
        }
        if limits.cpu_cores == 0 {
            return Err(invalid("resource_limits.cpu_cores", "must be positive"));
        }
        if limits.disk_mb == 0 {
            return Err(invalid("resource_limits.disk_mb", "must be positive"));
        }
        if limits.max_processes == 0 {
            return Err(invalid("resource_limits.max_processes", "must be positive"));
        }
        if self.session_timeout_minutes == 0 {
            return Err(invalid("session_timeout_minutes", "must be positive"));
        }
        if self.auto_cleanup && self.reaper_interval_seconds == 0 {
            return Err(invalid("reaper_interval_seconds", "must be positive"));
        }
        if !self.working_directory.starts_with('/') {
            return Err(invalid("working_directory", "must be an absolute path"));
        }
        if let Some(rate) = &self.rate_limit {
            if rate.max_requests == 0 {
                return Err(invalid("rate_limit.max_requests", "must be positive"));
            }
            if rate.window_seconds == 0 {
                return Err(invalid("rate_limit.window_seconds", "must be positive"));
            }
        }
        if self.sandbox_kind == SandboxKind::Http
            && self.endpoint.as_deref().is_some_and(|e| e.trim().is_empty())
        {
            return Err(ConfigError::MissingEndpoint {
                kind: self.sandbox_kind,
            });
        }
        self.security.validate()
    }
}

impl SecurityConfig {
    /// Check tool names, list overlap and every pattern.
    pub fn validate(&self) -> ConfigResult<()> {
        for (list, names) in [
            ("allowed_tools", &self.allowed_tools),
            ("blocked_tools", &self.blocked_tools),
        ] {
            if let Some(name) = names.iter().find(|n| ToolKind::from_name(n).is_none()) {
                return Err(ConfigError::UnknownTool {
                    list,
                    name: name.clone(),
                });
            }
        }

        let overlap: Vec<String> = self
            .allowed_tools
            .intersection(&self.blocked_tools)
            .cloned()
            .collect();
        if !overlap.is_empty() {
            return Err(ConfigError::ContradictoryToolLists { tools: overlap });
        }

        for rule in &self.command_blacklist {
            compile_pattern(&rule.pattern)?;
        }
        for pattern in &self.command_whitelist {
            compile_pattern(pattern)?;
        }
        if !self.home_directory.starts_with('/') {
            return Err(invalid("security.home_directory", "must be an absolute path"));
        }
        Ok(())
    }
}

/// Compile a command pattern the way the analyzer does.
pub(crate) fn compile_pattern(pattern: &str) -> ConfigResult<regex::Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidLimit {
        field,
        reason: reason.to_string(),
    }
}

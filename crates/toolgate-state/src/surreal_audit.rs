//! SurrealDB-backed AuditStore implementation
//!
//! Uses `schema::AuditRecord` for persistence, converting to/from
//! `storage_traits::AuditLogEntry` at the boundary. Supports in-memory,
//! local (`surrealkv://`) and remote connections.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

use crate::error::StoreError;
use crate::migrations;
use crate::schema::AuditRecord;
use crate::storage_traits::{AuditFilter, AuditLogEntry, AuditStore, StoreResult};

/// Connection settings for a SurrealDB audit store.
#[derive(Debug, Clone)]
pub struct SurrealConfig {
    /// Engine URL (e.g. "mem://", "surrealkv://.toolgate/audit", "wss://host")
    pub endpoint: String,
    /// Namespace (default: "toolgate")
    pub namespace: String,
    /// Database name (default: "audit")
    pub database: String,
    /// Root credentials, when the server requires authentication
    pub credentials: Option<(String, String)>,
}

impl SurrealConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            namespace: "toolgate".to_string(),
            database: "audit".to_string(),
            credentials: None,
        }
    }

    /// Set custom namespace
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    /// Set custom database
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    /// Sign in as a root user after connecting
    pub fn with_root(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - TOOLGATE_AUDIT_URL (required)
    /// - TOOLGATE_AUDIT_NAMESPACE (optional, default: "toolgate")
    /// - TOOLGATE_AUDIT_DATABASE (optional, default: "audit")
    /// - TOOLGATE_AUDIT_USERNAME / TOOLGATE_AUDIT_PASSWORD (optional, both or neither)
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint =
            std::env::var("TOOLGATE_AUDIT_URL").map_err(|_| "TOOLGATE_AUDIT_URL not set")?;
        let mut config = Self::new(endpoint);
        if let Ok(ns) = std::env::var("TOOLGATE_AUDIT_NAMESPACE") {
            config.namespace = ns;
        }
        if let Ok(db) = std::env::var("TOOLGATE_AUDIT_DATABASE") {
            config.database = db;
        }
        if let (Ok(user), Ok(pass)) = (
            std::env::var("TOOLGATE_AUDIT_USERNAME"),
            std::env::var("TOOLGATE_AUDIT_PASSWORD"),
        ) {
            config.credentials = Some((user, pass));
        }
        Ok(config)
    }
}

/// SurrealDB-backed implementation of [`AuditStore`].
#[derive(Clone)]
pub struct SurrealAuditStore {
    db: Surreal<Any>,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct SeqRow {
    seq: u64,
}

impl SurrealAuditStore {
    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> StoreResult<Self> {
        Self::connect(SurrealConfig::new("mem://")).await
    }

    /// Open (or create) a local on-disk store under `dir`.
    pub async fn open_local(dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            StoreError::Connection(format!(
                "Failed to create database directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Self::connect(SurrealConfig::new(format!("surrealkv://{}", dir.display()))).await
    }

    /// Connect using `TOOLGATE_AUDIT_URL` and friends, falling back to in-memory.
    pub async fn from_env() -> StoreResult<Self> {
        match SurrealConfig::from_env() {
            Ok(config) => Self::connect(config).await,
            Err(_) => {
                info!("TOOLGATE_AUDIT_URL not set, using in-memory audit store");
                Self::in_memory().await
            }
        }
    }

    /// Connect with explicit settings and run schema setup.
    #[instrument(
        skip(config),
        fields(
            endpoint = %config.endpoint,
            namespace = %config.namespace,
            database = %config.database
        )
    )]
    pub async fn connect(config: SurrealConfig) -> StoreResult<Self> {
        let db = surrealdb::engine::any::connect(&config.endpoint)
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to connect to {}: {}", config.endpoint, e))
            })?;

        if let Some((username, password)) = &config.credentials {
            db.signin(Root {
                username: username.as_str(),
                password: password.as_str(),
            })
            .await
            .map_err(|e| StoreError::Connection(format!("Root authentication failed: {e}")))?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to select namespace/database: {e}"))
            })?;

        migrations::init_schema(&db).await?;
        info!("SurrealAuditStore connected");
        Ok(Self { db })
    }
}

#[async_trait]
impl AuditStore for SurrealAuditStore {
    async fn append(&self, entry: &AuditLogEntry) -> StoreResult<()> {
        let row = AuditRecord::from_entry(entry)?;
        debug!(seq = entry.seq, tool = %entry.tool_name, "persisting audit entry");

        let created: Result<Option<AuditRecord>, surrealdb::Error> =
            self.db.create("audit_log").content(row).await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("already contains") => {
                Err(StoreError::DuplicateEntry { seq: entry.seq })
            }
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    async fn query(&self, filter: &AuditFilter) -> StoreResult<Vec<AuditLogEntry>> {
        let mut clauses = Vec::new();
        if filter.tool_name.is_some() {
            clauses.push("tool_name = $tool");
        }
        if filter.caller_id.is_some() {
            clauses.push("caller_id = $caller");
        }
        if filter.outcome.is_some() {
            clauses.push("outcome = $outcome");
        }
        if filter.success.is_some() {
            clauses.push("success = $success");
        }

        let mut sql = String::from("SELECT * FROM audit_log");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY seq ASC");

        let mut query = self.db.query(sql);
        if let Some(tool) = &filter.tool_name {
            query = query.bind(("tool", tool.clone()));
        }
        if let Some(caller) = &filter.caller_id {
            query = query.bind(("caller", caller.clone()));
        }
        if let Some(outcome) = filter.outcome {
            query = query.bind(("outcome", outcome.as_str().to_string()));
        }
        if let Some(success) = filter.success {
            query = query.bind(("success", success));
        }

        let mut res = query
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let rows: Vec<AuditRecord> = res
            .take(0)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let entries = rows
            .into_iter()
            .map(AuditRecord::into_entry)
            .collect::<StoreResult<Vec<_>>>()?;

        // Time range and limit are applied after the round trip.
        Ok(filter.apply(entries.iter()))
    }

    async fn count(&self) -> StoreResult<u64> {
        let mut res = self
            .db
            .query("SELECT count() AS count FROM audit_log GROUP ALL")
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let rows: Vec<CountRow> = res
            .take(0)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(rows.first().map_or(0, |r| r.count))
    }

    async fn last_seq(&self) -> StoreResult<Option<u64>> {
        let mut res = self
            .db
            .query("SELECT seq FROM audit_log ORDER BY seq DESC LIMIT 1")
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let rows: Vec<SeqRow> = res
            .take(0)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(rows.first().map(|r| r.seq))
    }
}

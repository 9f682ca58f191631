//! SurrealDB schema migrations and initialization
//!
//! Safe to call multiple times (idempotent).

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::storage_traits::StoreResult;

/// Initialize all toolgate tables in SurrealDB
pub async fn init_schema(db: &Surreal<Any>) -> StoreResult<()> {
    info!("Initializing toolgate SurrealDB schema");
    init_audit_log_table(db).await?;
    info!("toolgate schema initialization complete");
    Ok(())
}

/// Initialize `audit_log` table with constraints and indexes
///
/// Schema:
/// ```text
/// TABLE audit_log {
///   seq:             INT (unique, completion order)
///   timestamp:       DATETIME (indexed)
///   tool_name:       STRING (indexed)
///   arguments:       OBJECT (redacted)
///   success:         BOOL
///   outcome:         STRING (executed | failed | rejected | timed_out | ...)
///   reason:          STRING?
///   duration_ms:     INT
///   exit_code:       INT?
///   output_preview:  STRING?
///   violations:      ARRAY
///   caller_id:       STRING? (indexed)
///   session_id:      STRING?
/// }
/// ```
///
/// Rows are append-only: updates and deletes are not permitted.
async fn init_audit_log_table(db: &Surreal<Any>) -> StoreResult<()> {
    debug!("Initializing audit_log table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS audit_log
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_audit_seq ON TABLE audit_log COLUMNS seq UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_audit_tool ON TABLE audit_log COLUMNS tool_name;
        DEFINE INDEX IF NOT EXISTS idx_audit_caller ON TABLE audit_log COLUMNS caller_id;
        DEFINE INDEX IF NOT EXISTS idx_audit_timestamp ON TABLE audit_log COLUMNS timestamp;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StoreError::SchemaSetup(e.to_string()))?
        .check()
        .map_err(|e| StoreError::SchemaSetup(e.to_string()))?;

    info!("audit_log table initialized");
    Ok(())
}

//! Ledger schema

use crate::Result;
use sqlx::SqlitePool;
use tracing::{debug, info};

/// Version written to `schema_version` after a successful migration
pub const SCHEMA_VERSION: i64 = 1;

/// Create the ledger tables if they do not exist
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    info!("Running database migrations");

    create_schema_version_table(pool).await?;
    create_task_records_table(pool).await?;
    create_workflow_runs_table(pool).await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?1)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    info!(version = SCHEMA_VERSION, "Database migrations completed successfully");
    Ok(())
}

/// Highest applied schema version, `None` on a fresh database
pub async fn current_version(pool: &SqlitePool) -> Result<Option<i64>> {
    let exists: Option<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
    )
    .fetch_optional(pool)
    .await?;
    if exists.is_none() {
        return Ok(None);
    }
    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await?;
    Ok(version)
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    debug!("Creating schema_version table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
    "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_task_records_table(pool: &SqlitePool) -> Result<()> {
    debug!("Creating task_records table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_records (
            task_id TEXT PRIMARY KEY,
            agent_type TEXT NOT NULL,
            operation_name TEXT NOT NULL,
            input_data TEXT NOT NULL,
            priority TEXT NOT NULL DEFAULT 'normal',
            status TEXT NOT NULL CHECK (status IN ('pending', 'running', 'completed', 'failed', 'cancelled')),
            result TEXT,
            error TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_task_records_status_created ON task_records(status, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_task_records_agent_type ON task_records(agent_type)")
        .execute(pool)
        .await?;
    Ok(())
}

async fn create_workflow_runs_table(pool: &SqlitePool) -> Result<()> {
    debug!("Creating workflow_runs table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workflow_runs (
            run_id TEXT PRIMARY KEY,
            workflow_name TEXT NOT NULL,
            status TEXT NOT NULL,
            input TEXT NOT NULL,
            task_ids TEXT NOT NULL DEFAULT '[]',
            results TEXT NOT NULL DEFAULT 'null',
            error TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_workflow_runs_status ON workflow_runs(status, created_at)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

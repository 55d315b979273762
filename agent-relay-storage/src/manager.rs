//! Storage manager owning the connection pool and repositories

use crate::migrations;
use crate::repositories::{TaskRepository, WorkflowRunRepository};
use crate::Result;
use agent_relay_core::config::LedgerSettings;
use agent_relay_core::task::TaskStatus;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
    pub migrate_on_startup: bool,
}

impl DatabaseConfig {
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            max_connections: None,
            migrate_on_startup: true,
        }
    }
}

impl From<&LedgerSettings> for DatabaseConfig {
    fn from(settings: &LedgerSettings) -> Self {
        Self {
            url: settings.database_url.clone(),
            max_connections: Some(settings.max_connections),
            migrate_on_startup: true,
        }
    }
}

/// Owns the pool and hands out repositories
pub struct StorageManager {
    pool: Pool<Sqlite>,
    tasks: Arc<TaskRepository>,
    runs: Arc<WorkflowRunRepository>,
}

impl StorageManager {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!(url = %config.url, "Connecting to SQLite database");

        let connect_opts = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.unwrap_or(5))
            .connect_with(connect_opts)
            .await?;

        info!("Database connection established");

        let manager = Self {
            tasks: Arc::new(TaskRepository::new(pool.clone())),
            runs: Arc::new(WorkflowRunRepository::new(pool.clone())),
            pool,
        };
        if config.migrate_on_startup {
            manager.migrate().await?;
        }
        Ok(manager)
    }

    pub async fn migrate(&self) -> Result<()> {
        migrations::run_migrations(&self.pool).await
    }

    pub fn tasks(&self) -> Arc<TaskRepository> {
        self.tasks.clone()
    }

    pub fn runs(&self) -> Arc<WorkflowRunRepository> {
        self.runs.clone()
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<DatabaseStats> {
        Ok(DatabaseStats {
            tasks_count: self.tasks.count().await?,
            pending_tasks: self.tasks.count_by_status(TaskStatus::Pending).await?,
            running_tasks: self.tasks.count_by_status(TaskStatus::Running).await?,
            runs_count: self.runs.count().await?,
        })
    }

    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }
}

/// Row counts for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub tasks_count: i64,
    pub pending_tasks: i64,
    pub running_tasks: i64,
    pub runs_count: i64,
}

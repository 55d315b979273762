//! Workflow run repository

use super::{format_timestamp, parse_optional_timestamp, parse_timestamp, parse_uuid};
use crate::{Error, Result};
use agent_relay_core::ledger::{WorkflowRun, WorkflowRunStatus};
use sqlx::{FromRow, Pool, Sqlite};
use tracing::debug;
use uuid::Uuid;

const TABLE: &str = "workflow_runs";

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowRunRow {
    pub run_id: String,
    pub workflow_name: String,
    pub status: String,
    pub input: String,
    pub task_ids: String,
    pub results: String,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl WorkflowRunRow {
    pub fn into_run(self) -> Result<WorkflowRun> {
        let status = self
            .status
            .parse::<WorkflowRunStatus>()
            .map_err(|e| Error::corrupt(TABLE, e.to_string()))?;
        Ok(WorkflowRun {
            run_id: parse_uuid(TABLE, &self.run_id)?,
            workflow_name: self.workflow_name,
            status,
            input: serde_json::from_str(&self.input)?,
            task_ids: serde_json::from_str(&self.task_ids)?,
            results: serde_json::from_str(&self.results)?,
            error: self.error,
            created_at: parse_timestamp(TABLE, &self.created_at)?,
            started_at: parse_optional_timestamp(TABLE, self.started_at.as_deref())?,
            completed_at: parse_optional_timestamp(TABLE, self.completed_at.as_deref())?,
        })
    }
}

pub struct WorkflowRunRepository {
    pool: Pool<Sqlite>,
}

impl WorkflowRunRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Insert or replace a run
    pub async fn create(&self, run: &WorkflowRun) -> Result<()> {
        debug!(run_id = %run.run_id, workflow = %run.workflow_name, "Creating workflow run");
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO workflow_runs (run_id, workflow_name, status, input, task_ids,
                                                  results, error, created_at, started_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        )
        .bind(run.run_id.to_string())
        .bind(&run.workflow_name)
        .bind(run.status.as_str())
        .bind(serde_json::to_string(&run.input)?)
        .bind(serde_json::to_string(&run.task_ids)?)
        .bind(serde_json::to_string(&run.results)?)
        .bind(&run.error)
        .bind(format_timestamp(&run.created_at))
        .bind(run.started_at.as_ref().map(format_timestamp))
        .bind(run.completed_at.as_ref().map(format_timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update(&self, run: &WorkflowRun) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = ?2, task_ids = ?3, results = ?4, error = ?5, started_at = ?6,
                completed_at = ?7
            WHERE run_id = ?1
        "#,
        )
        .bind(run.run_id.to_string())
        .bind(run.status.as_str())
        .bind(serde_json::to_string(&run.task_ids)?)
        .bind(serde_json::to_string(&run.results)?)
        .bind(&run.error)
        .bind(run.started_at.as_ref().map(format_timestamp))
        .bind(run.completed_at.as_ref().map(format_timestamp))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound {
                entity: "workflow_run".to_string(),
                id: run.run_id.to_string(),
            });
        }
        debug!(run_id = %run.run_id, status = %run.status, "Updated workflow run");
        Ok(())
    }

    pub async fn find_by_id(&self, run_id: Uuid) -> Result<Option<WorkflowRun>> {
        let row = sqlx::query_as::<_, WorkflowRunRow>(
            r#"
            SELECT run_id, workflow_name, status, input, task_ids, results, error,
                   created_at, started_at, completed_at
            FROM workflow_runs
            WHERE run_id = ?1
        "#,
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkflowRunRow::into_run).transpose()
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM workflow_runs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn test_run_lifecycle() {
        let (_dir, pool) = test_pool().await;
        let repo = WorkflowRunRepository::new(pool);
        let mut run = WorkflowRun::new("quick_research", json!({"ticker": "AAPL"}));
        repo.create(&run).await.unwrap();

        run.status = WorkflowRunStatus::Completed;
        run.task_ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        run.results = json!({"business_overview_report": {"summary": "ok"}});
        run.started_at = Some(run.created_at);
        run.completed_at = Some(Utc::now());
        repo.update(&run).await.unwrap();

        let stored = repo.find_by_id(run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowRunStatus::Completed);
        assert_eq!(stored.task_ids, run.task_ids);
        assert_eq!(stored.results, run.results);
        assert_eq!(stored.input, json!({"ticker": "AAPL"}));
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_run() {
        let (_dir, pool) = test_pool().await;
        let repo = WorkflowRunRepository::new(pool);
        let run = WorkflowRun::new("daily_market_scan", json!({}));
        assert!(matches!(
            repo.update(&run).await,
            Err(Error::NotFound { .. })
        ));
        assert!(repo.find_by_id(run.run_id).await.unwrap().is_none());
    }
}

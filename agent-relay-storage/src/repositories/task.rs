//! Task record repository

use super::{format_timestamp, parse_optional_timestamp, parse_timestamp, parse_uuid};
use crate::{Error, Result};
use agent_relay_core::ledger::{TaskRecord, TaskUpdate};
use agent_relay_core::task::{TaskEnvelope, TaskPriority, TaskStatus};
use chrono::Utc;
use serde_json::Value;
use sqlx::{FromRow, Pool, Sqlite};
use tracing::debug;
use uuid::Uuid;

const TABLE: &str = "task_records";

const COLUMNS: &str = "task_id, agent_type, operation_name, input_data, priority, status, \
                       result, error, created_at, started_at, completed_at";

/// Raw `task_records` row
#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub task_id: String,
    pub agent_type: String,
    pub operation_name: String,
    pub input_data: String,
    pub priority: String,
    pub status: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl TaskRow {
    pub fn into_record(self) -> Result<TaskRecord> {
        let status = self
            .status
            .parse::<TaskStatus>()
            .map_err(|e| Error::corrupt(TABLE, e.to_string()))?;
        let priority: TaskPriority = serde_json::from_value(Value::String(self.priority))?;
        let result = self
            .result
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()?;

        Ok(TaskRecord {
            task_id: parse_uuid(TABLE, &self.task_id)?,
            agent_type: self.agent_type,
            operation_name: self.operation_name,
            input_data: serde_json::from_str(&self.input_data)?,
            priority,
            status,
            result,
            error: self.error,
            created_at: parse_timestamp(TABLE, &self.created_at)?,
            started_at: parse_optional_timestamp(TABLE, self.started_at.as_deref())?,
            completed_at: parse_optional_timestamp(TABLE, self.completed_at.as_deref())?,
        })
    }
}

fn priority_text(priority: TaskPriority) -> Result<String> {
    match serde_json::to_value(priority)? {
        Value::String(text) => Ok(text),
        other => Err(Error::corrupt(TABLE, format!("unexpected priority encoding {}", other))),
    }
}

fn json_text(value: Option<&Value>) -> Result<Option<String>> {
    value.map(serde_json::to_string).transpose().map_err(Error::from)
}

/// Repository for task ledger rows
pub struct TaskRepository {
    pool: Pool<Sqlite>,
}

impl TaskRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Insert a new record; a duplicate task id is a conflict
    pub async fn create(&self, record: &TaskRecord) -> Result<()> {
        debug!(task_id = %record.task_id, status = %record.status, "Creating task record");

        let result = sqlx::query(
            r#"
            INSERT INTO task_records (task_id, agent_type, operation_name, input_data, priority,
                                      status, result, error, created_at, started_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(task_id) DO NOTHING
        "#,
        )
        .bind(record.task_id.to_string())
        .bind(&record.agent_type)
        .bind(&record.operation_name)
        .bind(serde_json::to_string(&record.input_data)?)
        .bind(priority_text(record.priority)?)
        .bind(record.status.as_str())
        .bind(json_text(record.result.as_ref())?)
        .bind(&record.error)
        .bind(format_timestamp(&record.created_at))
        .bind(record.started_at.as_ref().map(format_timestamp))
        .bind(record.completed_at.as_ref().map(format_timestamp))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Core(agent_relay_core::Error::validation(format!(
                "Task {} already recorded",
                record.task_id
            ))));
        }
        Ok(())
    }

    /// Move a pending task to running, inserting the row when the task was
    /// never recorded
    pub async fn mark_running(&self, envelope: &TaskEnvelope) -> Result<()> {
        let started_at = format_timestamp(&envelope.started_at.unwrap_or_else(Utc::now));
        let status = match envelope.status {
            TaskStatus::Pending => TaskStatus::Running,
            other => other,
        };

        sqlx::query(
            r#"
            INSERT INTO task_records (task_id, agent_type, operation_name, input_data, priority,
                                      status, result, error, created_at, started_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, ?7, ?8, NULL)
            ON CONFLICT(task_id) DO UPDATE
                SET status = 'running', started_at = excluded.started_at
                WHERE task_records.status = 'pending'
        "#,
        )
        .bind(envelope.task_id.to_string())
        .bind(&envelope.agent_type)
        .bind(&envelope.operation_name)
        .bind(serde_json::to_string(&envelope.input_data)?)
        .bind(priority_text(envelope.priority)?)
        .bind(status.as_str())
        .bind(format_timestamp(&envelope.created_at))
        .bind(started_at)
        .execute(&self.pool)
        .await?;

        debug!(task_id = %envelope.task_id, "Marked task running");
        Ok(())
    }

    /// Apply a terminal write unless the task is already terminal
    ///
    /// Returns whether the row changed.
    pub async fn update_terminal(&self, task_id: Uuid, update: &TaskUpdate) -> Result<bool> {
        update.validate()?;

        let result = sqlx::query(
            r#"
            UPDATE task_records
            SET status = ?2, result = ?3, error = ?4, completed_at = ?5
            WHERE task_id = ?1 AND status IN ('pending', 'running')
        "#,
        )
        .bind(task_id.to_string())
        .bind(update.status.as_str())
        .bind(json_text(update.result.as_ref())?)
        .bind(&update.error)
        .bind(format_timestamp(&update.completed_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            debug!(task_id = %task_id, status = %update.status, "Recorded terminal status");
            return Ok(true);
        }
        if self.exists(task_id).await? {
            debug!(task_id = %task_id, "Ignoring write to terminal task");
            Ok(false)
        } else {
            Err(Error::NotFound {
                entity: "task".to_string(),
                id: task_id.to_string(),
            })
        }
    }

    pub async fn find_by_id(&self, task_id: Uuid) -> Result<Option<TaskRecord>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM task_records WHERE task_id = ?1",
            COLUMNS
        ))
        .bind(task_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TaskRow::into_record).transpose()
    }

    /// Oldest first
    pub async fn list_by_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM task_records WHERE status = ?1 ORDER BY created_at ASC LIMIT ?2",
            COLUMNS
        ))
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TaskRow::into_record).collect()
    }

    pub async fn exists(&self, task_id: Uuid) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM task_records WHERE task_id = ?1")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_by_status(&self, status: TaskStatus) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_records WHERE status = ?1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;
    use serde_json::json;

    fn envelope(ticker: &str) -> TaskEnvelope {
        TaskEnvelope::builder()
            .agent_type("due_diligence")
            .operation_name("business_overview_report")
            .input("ticker", json!(ticker))
            .priority(TaskPriority::High)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let (_dir, pool) = test_pool().await;
        let repo = TaskRepository::new(pool);
        let envelope = envelope("AAPL");
        let record = TaskRecord::from(&envelope);

        repo.create(&record).await.unwrap();
        let stored = repo.find_by_id(envelope.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.priority, TaskPriority::High);
        assert_eq!(stored.input_data.get("ticker"), Some(&json!("AAPL")));
        assert_eq!(
            stored.created_at.timestamp_micros(),
            record.created_at.timestamp_micros()
        );

        assert!(repo.create(&record).await.is_err());
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_terminal_write_is_final() {
        let (_dir, pool) = test_pool().await;
        let repo = TaskRepository::new(pool);
        let envelope = envelope("MSFT");
        repo.create(&TaskRecord::from(&envelope)).await.unwrap();
        repo.mark_running(&envelope).await.unwrap();
        assert_eq!(
            repo.find_by_id(envelope.task_id).await.unwrap().unwrap().status,
            TaskStatus::Running
        );

        let first = TaskUpdate::completed(json!({"summary": "cloud"}));
        assert!(repo.update_terminal(envelope.task_id, &first).await.unwrap());
        let late = TaskUpdate::failed("Task timeout after 3.0s");
        assert!(!repo.update_terminal(envelope.task_id, &late).await.unwrap());

        let stored = repo.find_by_id(envelope.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result, Some(json!({"summary": "cloud"})));
        assert!(stored.error.is_none());
        assert!(stored.completed_at.is_some());

        // running does not move a terminal row back
        repo.mark_running(&envelope).await.unwrap();
        assert_eq!(
            repo.find_by_id(envelope.task_id).await.unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_update_unknown_task() {
        let (_dir, pool) = test_pool().await;
        let repo = TaskRepository::new(pool);
        let err = repo
            .update_terminal(Uuid::new_v4(), &TaskUpdate::cancelled("operator"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_mark_running_inserts_unknown_task() {
        let (_dir, pool) = test_pool().await;
        let repo = TaskRepository::new(pool);
        let envelope = envelope("NVDA");

        repo.mark_running(&envelope).await.unwrap();
        let stored = repo.find_by_id(envelope.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
        assert!(stored.started_at.is_some());
    }

    #[tokio::test]
    async fn test_list_by_status_oldest_first() {
        let (_dir, pool) = test_pool().await;
        let repo = TaskRepository::new(pool);
        let mut ids = Vec::new();
        for (offset, ticker) in ["A", "B", "C"].iter().enumerate() {
            let mut record = TaskRecord::from(&envelope(ticker));
            record.created_at = Utc::now() - chrono::Duration::seconds(10 - offset as i64);
            ids.push(record.task_id);
            repo.create(&record).await.unwrap();
        }
        repo.update_terminal(ids[1], &TaskUpdate::failed("boom"))
            .await
            .unwrap();

        let pending = repo.list_by_status(TaskStatus::Pending, 10).await.unwrap();
        let pending_ids: Vec<Uuid> = pending.iter().map(|r| r.task_id).collect();
        assert_eq!(pending_ids, vec![ids[0], ids[2]]);
        assert_eq!(repo.list_by_status(TaskStatus::Pending, 1).await.unwrap().len(), 1);
        assert_eq!(repo.count_by_status(TaskStatus::Failed).await.unwrap(), 1);
    }
}

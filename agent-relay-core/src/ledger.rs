//! Task ledger
//!
//! Durable record of task and workflow-run status for out-of-band polling.
//! The ledger sits beside the pub/sub reply path: dispatch keeps working
//! without it, only polling is lost. Terminal states are final, so whichever
//! of the worker, the dispatcher or an operator writes a terminal status
//! first wins and later writes are ignored.

use crate::task::{InputData, TaskEnvelope, TaskPriority, TaskResult, TaskStatus};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Ledger row for one task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub agent_type: String,
    pub operation_name: String,
    pub input_data: InputData,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    #[serde(
        default,
        deserialize_with = "crate::task::present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&TaskEnvelope> for TaskRecord {
    fn from(envelope: &TaskEnvelope) -> Self {
        Self {
            task_id: envelope.task_id,
            agent_type: envelope.agent_type.clone(),
            operation_name: envelope.operation_name.clone(),
            input_data: envelope.input_data.clone(),
            priority: envelope.priority,
            status: envelope.status,
            result: envelope.result.clone(),
            error: envelope.error.clone(),
            created_at: envelope.created_at,
            started_at: envelope.started_at,
            completed_at: envelope.completed_at,
        }
    }
}

/// Terminal write for a task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl TaskUpdate {
    pub fn completed(result: Value) -> Self {
        Self {
            status: TaskStatus::Completed,
            result: Some(result),
            error: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failed<S: Into<String>>(error: S) -> Self {
        Self {
            status: TaskStatus::Failed,
            result: None,
            error: Some(error.into()),
            completed_at: Utc::now(),
        }
    }

    pub fn cancelled<S: Into<String>>(reason: S) -> Self {
        Self {
            status: TaskStatus::Cancelled,
            result: None,
            error: Some(reason.into()),
            completed_at: Utc::now(),
        }
    }

    /// Terminal write carried by a published task result
    pub fn from_result(result: &TaskResult) -> Self {
        let status = result.terminal_status();
        if result.success {
            Self {
                status,
                result: Some(result.data.clone().unwrap_or(Value::Null)),
                error: None,
                completed_at: result.timestamp,
            }
        } else {
            Self {
                status,
                result: None,
                error: Some(
                    result
                        .error
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                ),
                completed_at: result.timestamp,
            }
        }
    }

    /// Terminal status with exactly one of result or error
    pub fn validate(&self) -> Result<()> {
        if !self.status.is_terminal() {
            return Err(Error::validation(format!(
                "Ledger update requires a terminal status, got {}",
                self.status
            )));
        }
        if self.result.is_some() == self.error.is_some() {
            return Err(Error::validation(
                "Ledger update must carry exactly one of result or error",
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a workflow run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowRunStatus::Completed | WorkflowRunStatus::Failed | WorkflowRunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowRunStatus::Pending => "pending",
            WorkflowRunStatus::Running => "running",
            WorkflowRunStatus::Completed => "completed",
            WorkflowRunStatus::Failed => "failed",
            WorkflowRunStatus::Cancelled => "cancelled",
        }
    }

    /// `completed` iff every child is terminal and at least one succeeded
    pub fn from_children<I>(children: I) -> Self
    where
        I: IntoIterator<Item = TaskStatus>,
    {
        let mut any_succeeded = false;
        for status in children {
            if !status.is_terminal() {
                return WorkflowRunStatus::Failed;
            }
            any_succeeded |= status == TaskStatus::Completed;
        }
        if any_succeeded {
            WorkflowRunStatus::Completed
        } else {
            WorkflowRunStatus::Failed
        }
    }
}

impl fmt::Display for WorkflowRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowRunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(WorkflowRunStatus::Pending),
            "running" => Ok(WorkflowRunStatus::Running),
            "completed" => Ok(WorkflowRunStatus::Completed),
            "failed" => Ok(WorkflowRunStatus::Failed),
            "cancelled" => Ok(WorkflowRunStatus::Cancelled),
            other => Err(Error::validation(format!(
                "Unknown workflow run status: {}",
                other
            ))),
        }
    }
}

/// A group of dispatches executed under one run id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRun {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub status: WorkflowRunStatus,
    pub input: Value,
    pub task_ids: Vec<Uuid>,
    /// Aggregated sections, filled in when the run finishes
    pub results: Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new<S: Into<String>>(workflow_name: S, input: Value) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            workflow_name: workflow_name.into(),
            status: WorkflowRunStatus::Pending,
            input,
            task_ids: Vec::new(),
            results: Value::Null,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Repository interface over durable task and run state
#[async_trait]
pub trait TaskLedger: Send + Sync {
    /// Record a new task, normally as `pending`
    async fn create(&self, record: &TaskRecord) -> Result<()>;

    /// Record that a worker started the task, inserting it if unknown
    async fn mark_running(&self, envelope: &TaskEnvelope) -> Result<()>;

    /// Apply a terminal write. Ignored when the task is already terminal.
    async fn update(&self, task_id: Uuid, update: TaskUpdate) -> Result<()>;

    async fn get(&self, task_id: Uuid) -> Result<Option<TaskRecord>>;

    /// Oldest first
    async fn list_by_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<TaskRecord>>;

    async fn create_run(&self, run: &WorkflowRun) -> Result<()>;

    /// Replace the stored run with `run`
    async fn update_run(&self, run: &WorkflowRun) -> Result<()>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>>;

    /// Out-of-band cancellation; `false` if the task was already terminal
    async fn cancel(&self, task_id: Uuid, reason: &str) -> Result<bool> {
        match self.get(task_id).await? {
            Some(record) if !record.status.is_terminal() => {
                self.update(task_id, TaskUpdate::cancelled(reason)).await?;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::not_found("task", task_id.to_string())),
        }
    }
}

/// Process-local ledger
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    tasks: DashMap<Uuid, TaskRecord>,
    runs: DashMap<Uuid, WorkflowRun>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[async_trait]
impl TaskLedger for InMemoryLedger {
    async fn create(&self, record: &TaskRecord) -> Result<()> {
        if self.tasks.contains_key(&record.task_id) {
            return Err(Error::validation(format!(
                "Task {} already recorded",
                record.task_id
            )));
        }
        self.tasks.insert(record.task_id, record.clone());
        Ok(())
    }

    async fn mark_running(&self, envelope: &TaskEnvelope) -> Result<()> {
        let mut entry = self
            .tasks
            .entry(envelope.task_id)
            .or_insert_with(|| TaskRecord::from(envelope));
        if entry.status == TaskStatus::Pending {
            entry.status = TaskStatus::Running;
            entry.started_at = envelope.started_at.or_else(|| Some(Utc::now()));
        }
        Ok(())
    }

    async fn update(&self, task_id: Uuid, update: TaskUpdate) -> Result<()> {
        update.validate()?;
        let mut record = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::not_found("task", task_id.to_string()))?;
        if record.status.is_terminal() {
            return Ok(());
        }
        record.status = update.status;
        record.result = update.result;
        record.error = update.error;
        record.completed_at = Some(update.completed_at);
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<TaskRecord>> {
        Ok(self.tasks.get(&task_id).map(|r| r.value().clone()))
    }

    async fn list_by_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<TaskRecord>> {
        let mut records: Vec<TaskRecord> = self
            .tasks
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        records.truncate(limit);
        Ok(records)
    }

    async fn create_run(&self, run: &WorkflowRun) -> Result<()> {
        self.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &WorkflowRun) -> Result<()> {
        let mut stored = self
            .runs
            .get_mut(&run.run_id)
            .ok_or_else(|| Error::not_found("workflow_run", run.run_id.to_string()))?;
        *stored = run.clone();
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>> {
        Ok(self.runs.get(&run_id).map(|r| r.value().clone()))
    }
}

/// Fails tasks whose result never arrived
///
/// Pub/sub delivery is lossy: a task published before any worker subscribed,
/// or a worker that died mid-task, leaves a `pending` or `running` row behind
/// forever. The sweep closes such rows once they exceed a staleness threshold.
pub struct Reconciler {
    ledger: Arc<dyn TaskLedger>,
    batch_size: usize,
}

impl Reconciler {
    pub fn new(ledger: Arc<dyn TaskLedger>) -> Self {
        Self {
            ledger,
            batch_size: 500,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Mark stale non-terminal tasks failed; returns the ids swept
    pub async fn sweep(&self, stale_after: Duration) -> Result<Vec<Uuid>> {
        let stale_after = chrono::Duration::from_std(stale_after)
            .map_err(|e| Error::validation(format!("Invalid staleness threshold: {}", e)))?;
        let cutoff = Utc::now() - stale_after;
        let mut swept = Vec::new();

        for status in [TaskStatus::Pending, TaskStatus::Running] {
            let records = self.ledger.list_by_status(status, self.batch_size).await?;
            for record in records {
                let last_activity = record.started_at.unwrap_or(record.created_at);
                if last_activity > cutoff {
                    continue;
                }
                let message = format!(
                    "abandoned: no result received while {} since {}",
                    status,
                    last_activity.to_rfc3339()
                );
                match self
                    .ledger
                    .update(record.task_id, TaskUpdate::failed(message))
                    .await
                {
                    Ok(()) => swept.push(record.task_id),
                    Err(e) => warn!(task_id = %record.task_id, error = %e, "Failed to sweep task"),
                }
            }
        }

        if !swept.is_empty() {
            info!(count = swept.len(), "Reconciled abandoned tasks");
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ErrorKind;
    use serde_json::{json, Map};

    fn envelope() -> TaskEnvelope {
        let mut input = Map::new();
        input.insert("ticker".to_string(), json!("AAPL"));
        TaskEnvelope::new("dd", "business_overview", input).unwrap()
    }

    #[tokio::test]
    async fn test_create_get_update() {
        let ledger = InMemoryLedger::new();
        let envelope = envelope();
        ledger.create(&TaskRecord::from(&envelope)).await.unwrap();

        let record = ledger.get(envelope.task_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);

        ledger
            .update(envelope.task_id, TaskUpdate::completed(json!({"summary": "ok"})))
            .await
            .unwrap();
        let record = ledger.get(envelope.task_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(record.completed_at.is_some());
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn test_terminal_status_is_final() {
        let ledger = InMemoryLedger::new();
        let envelope = envelope();
        ledger.create(&TaskRecord::from(&envelope)).await.unwrap();

        assert!(ledger.cancel(envelope.task_id, "operator").await.unwrap());
        ledger
            .update(envelope.task_id, TaskUpdate::completed(json!({})))
            .await
            .unwrap();

        let record = ledger.get(envelope.task_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);
        assert!(!ledger.cancel(envelope.task_id, "again").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_unknown_task_is_not_found() {
        let ledger = InMemoryLedger::new();
        let err = ledger
            .update(Uuid::new_v4(), TaskUpdate::failed("x"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_rejects_non_terminal_status() {
        let ledger = InMemoryLedger::new();
        let envelope = envelope();
        ledger.create(&TaskRecord::from(&envelope)).await.unwrap();
        let update = TaskUpdate {
            status: TaskStatus::Running,
            result: None,
            error: Some("x".into()),
            completed_at: Utc::now(),
        };
        assert!(ledger.update(envelope.task_id, update).await.is_err());
    }

    #[tokio::test]
    async fn test_mark_running_inserts_unknown_task() {
        let ledger = InMemoryLedger::new();
        let mut envelope = envelope();
        envelope.start().unwrap();
        ledger.mark_running(&envelope).await.unwrap();

        let record = ledger.get(envelope.task_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Running);
        assert_eq!(record.started_at, envelope.started_at);
    }

    #[test]
    fn test_update_from_failed_result() {
        let result = TaskResult::failure(
            Uuid::new_v4(),
            "dd",
            ErrorKind::Handler,
            "boom",
            Duration::ZERO,
        );
        let update = TaskUpdate::from_result(&result);
        assert_eq!(update.status, TaskStatus::Failed);
        assert_eq!(update.error.as_deref(), Some("boom"));
        assert!(update.result.is_none());
    }

    #[test]
    fn test_run_status_from_children() {
        use TaskStatus::*;
        assert_eq!(
            WorkflowRunStatus::from_children([Completed, Failed]),
            WorkflowRunStatus::Completed
        );
        assert_eq!(
            WorkflowRunStatus::from_children([Failed, Failed]),
            WorkflowRunStatus::Failed
        );
        assert_eq!(
            WorkflowRunStatus::from_children([Completed, Running]),
            WorkflowRunStatus::Failed
        );
        assert_eq!(
            WorkflowRunStatus::from_children(Vec::<TaskStatus>::new()),
            WorkflowRunStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_reconciler_sweeps_only_stale_tasks() {
        let ledger = Arc::new(InMemoryLedger::new());

        let mut stale = TaskRecord::from(&envelope());
        stale.created_at = Utc::now() - chrono::Duration::hours(2);
        ledger.create(&stale).await.unwrap();

        let fresh = TaskRecord::from(&envelope());
        ledger.create(&fresh).await.unwrap();

        let reconciler = Reconciler::new(ledger.clone());
        let swept = reconciler.sweep(Duration::from_secs(3600)).await.unwrap();

        assert_eq!(swept, vec![stale.task_id]);
        let record = ledger.get(stale.task_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error.unwrap().starts_with("abandoned"));
        let record = ledger.get(fresh.task_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_workflow_run_storage() {
        let ledger = InMemoryLedger::new();
        let mut run = WorkflowRun::new("quick_research", json!({"ticker": "AAPL"}));
        ledger.create_run(&run).await.unwrap();

        run.status = WorkflowRunStatus::Completed;
        run.task_ids.push(Uuid::new_v4());
        ledger.update_run(&run).await.unwrap();

        let stored = ledger.get_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(stored, run);
    }
}

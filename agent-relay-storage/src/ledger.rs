//! SQLite-backed [`TaskLedger`]

use crate::manager::{DatabaseConfig, StorageManager};
use agent_relay_core::ledger::{TaskLedger, TaskRecord, TaskUpdate, WorkflowRun};
use agent_relay_core::task::{TaskEnvelope, TaskStatus};
use agent_relay_core::Result;
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Durable ledger shared by dispatchers and workers in separate processes
#[derive(Clone)]
pub struct SqliteLedger {
    storage: Arc<StorageManager>,
}

impl SqliteLedger {
    pub fn new(storage: Arc<StorageManager>) -> Self {
        Self { storage }
    }

    /// Open (and migrate) the database at `config.url`
    pub async fn connect(config: &DatabaseConfig) -> crate::Result<Self> {
        Ok(Self::new(Arc::new(StorageManager::new(config).await?)))
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }
}

#[async_trait]
impl TaskLedger for SqliteLedger {
    async fn create(&self, record: &TaskRecord) -> Result<()> {
        Ok(self.storage.tasks().create(record).await?)
    }

    async fn mark_running(&self, envelope: &TaskEnvelope) -> Result<()> {
        Ok(self.storage.tasks().mark_running(envelope).await?)
    }

    async fn update(&self, task_id: Uuid, update: TaskUpdate) -> Result<()> {
        self.storage.tasks().update_terminal(task_id, &update).await?;
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<TaskRecord>> {
        Ok(self.storage.tasks().find_by_id(task_id).await?)
    }

    async fn list_by_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<TaskRecord>> {
        Ok(self.storage.tasks().list_by_status(status, limit).await?)
    }

    async fn create_run(&self, run: &WorkflowRun) -> Result<()> {
        Ok(self.storage.runs().create(run).await?)
    }

    async fn update_run(&self, run: &WorkflowRun) -> Result<()> {
        Ok(self.storage.runs().update(run).await?)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>> {
        Ok(self.storage.runs().find_by_id(run_id).await?)
    }

    async fn cancel(&self, task_id: Uuid, reason: &str) -> Result<bool> {
        Ok(self
            .storage
            .tasks()
            .update_terminal(task_id, &TaskUpdate::cancelled(reason))
            .await?)
    }
}

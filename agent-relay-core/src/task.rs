//! Task envelope and task result models
//!
//! A [`TaskEnvelope`] describes one unit of work dispatched to a worker. It is
//! immutable after creation apart from its status fields, which only move
//! forward through the lifecycle `pending -> running -> {completed, failed}`
//! (with `cancelled` reachable from any non-terminal state).
//!
//! A [`TaskResult`] is the terminal outcome a worker publishes on the task's
//! reply channel. Both types serialize to a stable JSON wire format so that a
//! worker in another process can reconstruct them.
//!
//! # Examples
//!
//! ```rust
//! use agent_relay_core::task::*;
//! use serde_json::json;
//!
//! let envelope = TaskEnvelope::builder()
//!     .agent_type("due_diligence")
//!     .operation_name("business_overview")
//!     .input("ticker", json!("AAPL"))
//!     .priority(TaskPriority::High)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(envelope.status, TaskStatus::Pending);
//! ```

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Operation parameters carried by a task
pub type InputData = Map<String, Value>;

/// Deserialize a present field, `null` included, as `Some`
///
/// Paired with `skip_serializing_if = "Option::is_none"` so an absent field
/// and a `null` output stay distinct on the wire.
pub(crate) fn present_value<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(Error::validation(format!("Unknown task status: {}", other))),
        }
    }
}

/// Advisory priority of a task. The broker does not reorder by priority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

/// Unit of work dispatched to a worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEnvelope {
    pub task_id: Uuid,
    pub agent_type: String,
    pub operation_name: String,
    pub input_data: InputData,
    #[serde(default)]
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl TaskEnvelope {
    /// Create a new pending envelope with a fresh task id
    pub fn new<S1, S2>(agent_type: S1, operation_name: S2, input_data: InputData) -> Result<Self>
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        let agent_type = agent_type.into();
        let operation_name = operation_name.into();
        Self::validate_name("agent_type", &agent_type)?;
        Self::validate_name("operation_name", &operation_name)?;

        Ok(Self {
            task_id: Uuid::new_v4(),
            agent_type,
            operation_name,
            input_data,
            priority: TaskPriority::Normal,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            metadata: Map::new(),
        })
    }

    /// Create a builder for constructing a TaskEnvelope
    pub fn builder() -> TaskEnvelopeBuilder {
        TaskEnvelopeBuilder::new()
    }

    fn validate_name(field: &str, value: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(Error::validation(format!("{} cannot be empty", field)));
        }
        Ok(())
    }

    /// Transition `pending -> running`
    pub fn start(&mut self) -> Result<()> {
        if self.status != TaskStatus::Pending {
            return Err(Error::state_transition(format!(
                "Cannot start task {} in status {}",
                self.task_id, self.status
            )));
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Transition `running -> completed` with the handler output
    pub fn complete(&mut self, result: Value) -> Result<()> {
        if self.status != TaskStatus::Running {
            return Err(Error::state_transition(format!(
                "Cannot complete task {} in status {}",
                self.task_id, self.status
            )));
        }
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Transition `running -> failed` with an error message
    pub fn fail<S: Into<String>>(&mut self, error: S) -> Result<()> {
        if self.status != TaskStatus::Running {
            return Err(Error::state_transition(format!(
                "Cannot fail task {} in status {}",
                self.task_id, self.status
            )));
        }
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Move any non-terminal task to `cancelled`
    pub fn cancel<S: Into<String>>(&mut self, reason: S) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::state_transition(format!(
                "Cannot cancel task {} in terminal status {}",
                self.task_id, self.status
            )));
        }
        self.status = TaskStatus::Cancelled;
        self.error = Some(reason.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Check the result/error exclusivity rule for the current status
    pub fn check_outcome_invariant(&self) -> Result<()> {
        let consistent = if self.status.is_terminal() {
            self.result.is_some() != self.error.is_some()
        } else {
            self.result.is_none() && self.error.is_none()
        };
        if consistent {
            Ok(())
        } else {
            Err(Error::validation(format!(
                "Task {} in status {} has inconsistent result/error fields",
                self.task_id, self.status
            )))
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Builder for creating TaskEnvelope instances
#[derive(Debug, Default)]
pub struct TaskEnvelopeBuilder {
    agent_type: Option<String>,
    operation_name: Option<String>,
    input_data: InputData,
    priority: TaskPriority,
    metadata: Map<String, Value>,
}

impl TaskEnvelopeBuilder {
    /// Create a new envelope builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker category
    pub fn agent_type<S: Into<String>>(mut self, agent_type: S) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    /// Set the operation to run
    pub fn operation_name<S: Into<String>>(mut self, operation_name: S) -> Self {
        self.operation_name = Some(operation_name.into());
        self
    }

    /// Replace the whole input map
    pub fn input_data(mut self, input_data: InputData) -> Self {
        self.input_data = input_data;
        self
    }

    /// Add a single input parameter
    pub fn input<S: Into<String>>(mut self, key: S, value: Value) -> Self {
        self.input_data.insert(key.into(), value);
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a metadata annotation
    pub fn metadata<S: Into<String>>(mut self, key: S, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Build the TaskEnvelope instance
    pub fn build(self) -> Result<TaskEnvelope> {
        let agent_type = self
            .agent_type
            .ok_or_else(|| Error::validation("agent_type is required"))?;
        let operation_name = self
            .operation_name
            .ok_or_else(|| Error::validation("operation_name is required"))?;

        let mut envelope = TaskEnvelope::new(agent_type, operation_name, self.input_data)?;
        envelope.priority = self.priority;
        envelope.metadata = self.metadata;
        Ok(envelope)
    }
}

/// Why a task result is a failure
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Required input missing; raised before any external call
    Validation,
    /// Generation backends exhausted (primary retries and fallback)
    Provider,
    /// Anything else raised inside an operation handler
    Handler,
    /// Caller-side wait expired; says nothing about the worker
    Timeout,
    Cancelled,
    Broker,
}

impl ErrorKind {
    /// Classify a core error
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Dependency { .. } => ErrorKind::Provider,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::Broker { .. } => ErrorKind::Broker,
            _ => ErrorKind::Handler,
        }
    }
}

/// Terminal outcome published by a worker on `results:{task_id}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub agent_type: String,
    pub success: bool,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    pub execution_time_seconds: f64,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub model_used: String,
    pub timestamp: DateTime<Utc>,
}

impl TaskResult {
    /// Successful result carrying handler output
    pub fn success(
        task_id: Uuid,
        agent_type: impl Into<String>,
        data: Value,
        execution_time: Duration,
    ) -> Self {
        Self {
            task_id,
            agent_type: agent_type.into(),
            success: true,
            data: Some(data),
            error: None,
            error_kind: None,
            execution_time_seconds: execution_time.as_secs_f64(),
            tokens_used: 0,
            model_used: String::new(),
            timestamp: Utc::now(),
        }
    }

    /// Failed result with a classified error
    pub fn failure(
        task_id: Uuid,
        agent_type: impl Into<String>,
        kind: ErrorKind,
        error: impl Into<String>,
        execution_time: Duration,
    ) -> Self {
        Self {
            task_id,
            agent_type: agent_type.into(),
            success: false,
            data: None,
            error: Some(error.into()),
            error_kind: Some(kind),
            execution_time_seconds: execution_time.as_secs_f64(),
            tokens_used: 0,
            model_used: String::new(),
            timestamp: Utc::now(),
        }
    }

    /// Synthetic result returned to a caller whose wait expired
    pub fn timed_out(task_id: Uuid, agent_type: impl Into<String>, timeout: Duration) -> Self {
        Self::failure(
            task_id,
            agent_type,
            ErrorKind::Timeout,
            format!("Task timeout after {:.1}s", timeout.as_secs_f64()),
            timeout,
        )
    }

    /// Attach provider usage metrics
    pub fn with_usage(mut self, tokens_used: u64, model_used: impl Into<String>) -> Self {
        self.tokens_used = tokens_used;
        self.model_used = model_used.into();
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.error_kind == Some(ErrorKind::Timeout)
    }

    /// Ledger status implied by this result
    pub fn terminal_status(&self) -> TaskStatus {
        match (self.success, self.error_kind) {
            (true, _) => TaskStatus::Completed,
            (false, Some(ErrorKind::Cancelled)) => TaskStatus::Cancelled,
            (false, _) => TaskStatus::Failed,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Request to stop a queued or running task, sent on `cancel:{agent_type}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CancelRequest {
    pub task_id: Uuid,
    #[serde(default)]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn input(ticker: &str) -> InputData {
        let mut map = Map::new();
        map.insert("ticker".to_string(), json!(ticker));
        map
    }

    #[test]
    fn test_envelope_defaults() {
        let envelope = TaskEnvelope::new("dd", "business_overview", input("AAPL")).unwrap();

        assert_eq!(envelope.status, TaskStatus::Pending);
        assert_eq!(envelope.priority, TaskPriority::Normal);
        assert!(envelope.started_at.is_none());
        assert!(envelope.completed_at.is_none());
        assert!(envelope.metadata.is_empty());
        envelope.check_outcome_invariant().unwrap();
    }

    #[test]
    fn test_envelope_requires_names() {
        assert_matches!(
            TaskEnvelope::new("", "op", Map::new()),
            Err(Error::Validation { .. })
        );
        assert_matches!(
            TaskEnvelope::builder().agent_type("dd").build(),
            Err(Error::Validation { .. })
        );
    }

    #[test]
    fn test_lifecycle_completed() {
        let mut envelope = TaskEnvelope::new("dd", "business_overview", input("AAPL")).unwrap();
        envelope.start().unwrap();
        assert_eq!(envelope.status, TaskStatus::Running);
        assert!(envelope.started_at.is_some());

        envelope.complete(json!({"summary": "ok"})).unwrap();
        assert_eq!(envelope.status, TaskStatus::Completed);
        assert!(envelope.completed_at.is_some());
        envelope.check_outcome_invariant().unwrap();
    }

    #[test]
    fn test_illegal_transitions_leave_envelope_unchanged() {
        let mut envelope = TaskEnvelope::new("dd", "op", Map::new()).unwrap();
        assert_matches!(
            envelope.complete(json!({})),
            Err(Error::StateTransition { .. })
        );

        envelope.start().unwrap();
        let started_at = envelope.started_at;
        assert_matches!(envelope.start(), Err(Error::StateTransition { .. }));
        assert_eq!(envelope.started_at, started_at);

        envelope.fail("boom").unwrap();
        let snapshot = envelope.clone();
        assert_matches!(envelope.cancel("late"), Err(Error::StateTransition { .. }));
        assert_eq!(envelope, snapshot);
    }

    #[test]
    fn test_cancel_from_pending() {
        let mut envelope = TaskEnvelope::new("dd", "op", Map::new()).unwrap();
        envelope.cancel("operator request").unwrap();
        assert_eq!(envelope.status, TaskStatus::Cancelled);
        assert_eq!(envelope.error.as_deref(), Some("operator request"));
        envelope.check_outcome_invariant().unwrap();
    }

    #[test]
    fn test_wire_format_uses_lowercase_enums() {
        let envelope = TaskEnvelope::builder()
            .agent_type("risk")
            .operation_name("risk_assessment")
            .priority(TaskPriority::Critical)
            .metadata("workflow", json!("quick"))
            .build()
            .unwrap();

        let value: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(value["priority"], "critical");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["task_id"], envelope.task_id.to_string());
        assert!(value["result"].is_null());
        assert_eq!(value["metadata"]["workflow"], "quick");
    }

    #[test]
    fn test_null_output_survives_the_wire() {
        let mut envelope = TaskEnvelope::new("dd", "op", Map::new()).unwrap();
        envelope.start().unwrap();
        envelope.complete(Value::Null).unwrap();

        let decoded = TaskEnvelope::from_json(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(decoded.result, Some(Value::Null));
        decoded.check_outcome_invariant().unwrap();
        assert_eq!(decoded, envelope);

        let result = TaskResult::success(envelope.task_id, "dd", Value::Null, Duration::ZERO);
        let decoded: TaskResult =
            serde_json::from_str(&serde_json::to_string(&result).unwrap()).unwrap();
        assert_eq!(decoded.data, Some(Value::Null));
        assert_eq!(decoded, result);
    }

    #[test]
    fn test_envelope_accepts_missing_terminal_fields() {
        let payload = json!({
            "task_id": Uuid::new_v4(),
            "agent_type": "dd",
            "operation_name": "business_overview",
            "input_data": {"ticker": "MSFT"},
            "status": "pending",
            "created_at": Utc::now(),
        });
        let envelope = TaskEnvelope::from_json(&payload.to_string()).unwrap();
        assert_eq!(envelope.priority, TaskPriority::Normal);
        assert!(envelope.result.is_none());
    }

    #[test]
    fn test_result_terminal_status() {
        let id = Uuid::new_v4();
        let ok = TaskResult::success(id, "dd", json!({}), Duration::from_millis(5));
        assert_eq!(ok.terminal_status(), TaskStatus::Completed);

        let timeout = TaskResult::timed_out(id, "dd", Duration::from_secs(3));
        assert!(timeout.is_timeout());
        assert!(timeout.error.as_deref().unwrap().contains("timeout"));
        assert_eq!(timeout.terminal_status(), TaskStatus::Failed);

        let cancelled = TaskResult::failure(
            id,
            "dd",
            ErrorKind::Cancelled,
            "stopped",
            Duration::ZERO,
        );
        assert_eq!(cancelled.terminal_status(), TaskStatus::Cancelled);
    }

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(
            ErrorKind::from_error(&Error::validation("x")),
            ErrorKind::Validation
        );
        assert_eq!(
            ErrorKind::from_error(&Error::dependency("openai", "down")),
            ErrorKind::Provider
        );
        assert_eq!(
            ErrorKind::from_error(&Error::Internal("x".into())),
            ErrorKind::Handler
        );
    }
}

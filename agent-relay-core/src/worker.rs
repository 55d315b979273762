//! Worker runtime and operation registry
//!
//! A [`WorkerRuntime`] subscribes to `tasks:{agent_type}` and executes one
//! task at a time in arrival order. The operation named by each envelope is
//! looked up in the runtime's [`CapabilitySet`]; unknown names go to the
//! fallback handler when one is registered. Whatever a handler does (return
//! an error, panic, get cancelled) the runtime publishes a [`TaskResult`] on
//! `results:{task_id}` and moves on to the next task.

use crate::channel::{publish_json, Broker, ChannelNames, Subscription};
use crate::context::RelayContext;
use crate::ledger::{TaskLedger, TaskUpdate};
use crate::task::{CancelRequest, ErrorKind, InputData, TaskEnvelope, TaskResult};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MAX_PENDING_CANCELLATIONS: usize = 1024;

/// Output of a successful operation
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutput {
    pub data: Value,
    pub tokens_used: u64,
    pub model_used: String,
}

impl HandlerOutput {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            tokens_used: 0,
            model_used: String::new(),
        }
    }

    pub fn with_usage<S: Into<String>>(mut self, tokens_used: u64, model_used: S) -> Self {
        self.tokens_used = tokens_used;
        self.model_used = model_used.into();
        self
    }
}

impl From<Value> for HandlerOutput {
    fn from(data: Value) -> Self {
        Self::new(data)
    }
}

/// What a handler sees of the task it is executing
#[derive(Debug, Clone)]
pub struct TaskContext {
    envelope: TaskEnvelope,
    cancellation: CancellationToken,
}

impl TaskContext {
    pub fn new(envelope: TaskEnvelope, cancellation: CancellationToken) -> Self {
        Self {
            envelope,
            cancellation,
        }
    }

    pub fn envelope(&self) -> &TaskEnvelope {
        &self.envelope
    }

    pub fn task_id(&self) -> Uuid {
        self.envelope.task_id
    }

    pub fn operation_name(&self) -> &str {
        &self.envelope.operation_name
    }

    pub fn input(&self) -> &InputData {
        &self.envelope.input_data
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.envelope.input_data.get(field)
    }

    /// String input field, or a validation error
    pub fn require_str(&self, field: &str) -> Result<&str> {
        self.get(field)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::validation(format!("Field '{}' must be a string", field)))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Call between steps of a long operation
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::cancelled("Task cancelled by request"))
        } else {
            Ok(())
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// One named operation a worker can perform
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Input fields that must be present and non-null
    fn required_fields(&self) -> &[&str] {
        &[]
    }

    async fn handle(&self, ctx: &TaskContext) -> Result<HandlerOutput>;
}

/// Adapter turning an async closure into an [`OperationHandler`]
pub struct FnHandler<F> {
    required: Vec<&'static str>,
    func: F,
}

/// Wrap a closure taking an owned [`TaskContext`]
pub fn handler_fn<F, Fut>(func: F) -> FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerOutput>> + Send,
{
    FnHandler {
        required: Vec::new(),
        func,
    }
}

impl<F> FnHandler<F> {
    pub fn require(mut self, fields: &[&'static str]) -> Self {
        self.required.extend_from_slice(fields);
        self
    }
}

#[async_trait]
impl<F, Fut> OperationHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerOutput>> + Send,
{
    fn required_fields(&self) -> &[&str] {
        &self.required
    }

    async fn handle(&self, ctx: &TaskContext) -> Result<HandlerOutput> {
        (self.func)(ctx.clone()).await
    }
}

/// Name to handler table with an optional catch-all
#[derive(Default, Clone)]
pub struct OperationRegistry {
    handlers: HashMap<String, Arc<dyn OperationHandler>>,
    fallback: Option<Arc<dyn OperationHandler>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one under the same name
    pub fn register<S: Into<String>>(&mut self, name: S, handler: Arc<dyn OperationHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn set_fallback(&mut self, handler: Arc<dyn OperationHandler>) {
        self.fallback = Some(handler);
    }

    /// Exact match first, then the fallback
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn OperationHandler>> {
        self.handlers
            .get(name)
            .cloned()
            .or_else(|| self.fallback.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Registered operation names, sorted
    pub fn operations(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Operations offered by one agent type
#[derive(Clone)]
pub struct CapabilitySet {
    agent_type: String,
    registry: OperationRegistry,
}

impl CapabilitySet {
    pub fn new<S: Into<String>>(agent_type: S) -> Self {
        Self {
            agent_type: agent_type.into(),
            registry: OperationRegistry::new(),
        }
    }

    pub fn operation<S, H>(mut self, name: S, handler: H) -> Self
    where
        S: Into<String>,
        H: OperationHandler + 'static,
    {
        self.registry.register(name, Arc::new(handler));
        self
    }

    pub fn operation_arc<S: Into<String>>(
        mut self,
        name: S,
        handler: Arc<dyn OperationHandler>,
    ) -> Self {
        self.registry.register(name, handler);
        self
    }

    pub fn fallback<H: OperationHandler + 'static>(mut self, handler: H) -> Self {
        self.registry.set_fallback(Arc::new(handler));
        self
    }

    pub fn fallback_arc(mut self, handler: Arc<dyn OperationHandler>) -> Self {
        self.registry.set_fallback(handler);
        self
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }
}

/// Tracks the running task's token and cancellations that arrive early
#[derive(Default)]
struct CancelTracker {
    state: Mutex<CancelState>,
}

#[derive(Default)]
struct CancelState {
    current: Option<(Uuid, CancellationToken)>,
    early: VecDeque<Uuid>,
}

impl CancelTracker {
    fn request(&self, task_id: Uuid) {
        let mut state = self.state.lock();
        if let Some((running, token)) = &state.current {
            if *running == task_id {
                token.cancel();
                return;
            }
        }
        if state.early.len() >= MAX_PENDING_CANCELLATIONS {
            state.early.pop_front();
        }
        state.early.push_back(task_id);
    }

    /// Register `task_id` as running; a request seen before this call or
    /// racing with it cancels the returned token
    fn begin(&self, task_id: Uuid, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        let mut state = self.state.lock();
        if let Some(pos) = state.early.iter().position(|id| *id == task_id) {
            state.early.remove(pos);
            token.cancel();
        }
        state.current = Some((task_id, token.clone()));
        token
    }

    fn finish(&self) {
        self.state.lock().current = None;
    }
}

/// Handle to a spawned worker loop
pub struct WorkerHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop the loop and wait for it to exit
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "Worker loop terminated abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Long-lived consumer for one agent type
pub struct WorkerRuntime {
    capabilities: CapabilitySet,
    broker: Arc<dyn Broker>,
    ledger: Option<Arc<dyn TaskLedger>>,
    channels: ChannelNames,
    shutdown: CancellationToken,
    cancellations: CancelTracker,
}

impl WorkerRuntime {
    pub fn new(context: &RelayContext, capabilities: CapabilitySet) -> Self {
        Self {
            capabilities,
            broker: context.broker.clone(),
            ledger: context.ledger.clone(),
            channels: context.channels.clone(),
            shutdown: CancellationToken::new(),
            cancellations: CancelTracker::default(),
        }
    }

    /// Do not write task state to the ledger
    pub fn without_ledger(mut self) -> Self {
        self.ledger = None;
        self
    }

    pub fn agent_type(&self) -> &str {
        self.capabilities.agent_type()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Subscribe, then process tasks until shutdown or channel close
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let (tasks, cancels) = self.subscribe().await?;
        self.run_loop(tasks, cancels).await;
        Ok(())
    }

    /// Subscribe before returning, then process tasks in the background
    pub async fn spawn(self: Arc<Self>) -> Result<WorkerHandle> {
        let (tasks, cancels) = self.subscribe().await?;
        let shutdown = self.shutdown.clone();
        let join = tokio::spawn(self.run_loop(tasks, cancels));
        Ok(WorkerHandle { shutdown, join })
    }

    async fn subscribe(&self) -> Result<(Subscription, Subscription)> {
        let tasks = self
            .broker
            .subscribe(&self.channels.tasks(self.agent_type()))
            .await?;
        let cancels = self
            .broker
            .subscribe(&self.channels.cancel(self.agent_type()))
            .await?;
        Ok((tasks, cancels))
    }

    async fn run_loop(self: Arc<Self>, mut tasks: Subscription, cancels: Subscription) {
        info!(
            agent_type = %self.agent_type(),
            operations = ?self.capabilities.registry().operations(),
            "Worker runtime started"
        );

        let listener_stop = self.shutdown.child_token();
        let listener = tokio::spawn(Self::listen_for_cancellations(
            self.clone(),
            cancels,
            listener_stop.clone(),
        ));

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(agent_type = %self.agent_type(), "Worker runtime shutting down");
                    break;
                }
                message = tasks.recv() => match message {
                    Some(payload) => {
                        self.process_payload(&payload).await;
                    }
                    None => {
                        warn!(agent_type = %self.agent_type(), "Task channel closed");
                        break;
                    }
                }
            }
        }

        listener_stop.cancel();
        if let Err(e) = listener.await {
            error!(error = %e, "Cancellation listener terminated abnormally");
        }
    }

    async fn listen_for_cancellations(
        self: Arc<Self>,
        mut cancels: Subscription,
        stop: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                message = cancels.recv() => match message {
                    Some(payload) => match serde_json::from_str::<CancelRequest>(&payload) {
                        Ok(request) => {
                            info!(
                                task_id = %request.task_id,
                                reason = request.reason.as_deref().unwrap_or(""),
                                "Cancellation requested"
                            );
                            self.cancellations.request(request.task_id);
                        }
                        Err(e) => warn!(error = %e, "Dropping malformed cancellation message"),
                    },
                    None => break,
                }
            }
        }
    }

    /// Decode one task payload and execute it. Undecodable payloads and tasks
    /// addressed to another agent type are dropped.
    pub async fn process_payload(&self, payload: &str) -> Option<TaskResult> {
        let envelope = match TaskEnvelope::from_json(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(agent_type = %self.agent_type(), error = %e, "Dropping malformed task payload");
                return None;
            }
        };

        if envelope.agent_type != self.agent_type() {
            warn!(
                task_id = %envelope.task_id,
                expected = %self.agent_type(),
                actual = %envelope.agent_type,
                "Dropping task addressed to another agent type"
            );
            return None;
        }

        Some(self.execute(envelope).await)
    }

    /// Run one task to completion and publish its result
    pub async fn execute(&self, mut envelope: TaskEnvelope) -> TaskResult {
        let started = Instant::now();
        let task_id = envelope.task_id;
        let token = self.cancellations.begin(task_id, &self.shutdown);

        let outcome = match envelope.start() {
            Ok(()) => {
                debug!(
                    task_id = %task_id,
                    operation = %envelope.operation_name,
                    "Task started"
                );
                self.publish_status(&envelope).await;
                if let Some(ledger) = &self.ledger {
                    if let Err(e) = ledger.mark_running(&envelope).await {
                        warn!(task_id = %task_id, error = %e, "Failed to record task start");
                    }
                }
                self.invoke(&envelope, token).await
            }
            Err(e) => Err(e),
        };
        self.cancellations.finish();

        let elapsed = started.elapsed();
        let result = match outcome {
            Ok(output) => {
                if let Err(e) = envelope.complete(output.data.clone()) {
                    warn!(task_id = %task_id, error = %e, "Envelope transition failed");
                }
                TaskResult::success(task_id, &envelope.agent_type, output.data, elapsed)
                    .with_usage(output.tokens_used, output.model_used)
            }
            Err(err) => {
                let kind = ErrorKind::from_error(&err);
                let message = err.to_string();
                let transition = if kind == ErrorKind::Cancelled {
                    envelope.cancel(message.clone())
                } else {
                    envelope.fail(message.clone())
                };
                if let Err(e) = transition {
                    warn!(task_id = %task_id, error = %e, "Envelope transition failed");
                }
                error!(
                    task_id = %task_id,
                    operation = %envelope.operation_name,
                    kind = ?kind,
                    category = err.category(),
                    error = %message,
                    "Task failed"
                );
                TaskResult::failure(task_id, &envelope.agent_type, kind, message, elapsed)
            }
        };

        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.update(task_id, TaskUpdate::from_result(&result)).await {
                warn!(task_id = %task_id, error = %e, "Failed to record task outcome");
            }
        }

        match publish_json(self.broker.as_ref(), &self.channels.results(&task_id), &result).await {
            Ok(0) => debug!(task_id = %task_id, "No caller waiting for reply"),
            Ok(_) => {}
            Err(e) => error!(task_id = %task_id, error = %e, "Failed to publish task result"),
        }
        self.publish_status(&envelope).await;

        info!(
            task_id = %task_id,
            operation = %envelope.operation_name,
            success = result.success,
            elapsed_ms = elapsed.as_millis() as u64,
            "Task finished"
        );
        result
    }

    async fn invoke(
        &self,
        envelope: &TaskEnvelope,
        token: CancellationToken,
    ) -> Result<HandlerOutput> {
        if token.is_cancelled() {
            return Err(Error::cancelled("Task cancelled before start"));
        }

        let handler = self
            .capabilities
            .registry()
            .resolve(&envelope.operation_name)
            .ok_or_else(|| {
                Error::handler(format!(
                    "Unsupported operation '{}' for agent type '{}'",
                    envelope.operation_name, envelope.agent_type
                ))
            })?;

        validate_required(handler.required_fields(), &envelope.input_data)?;

        let ctx = TaskContext::new(envelope.clone(), token.clone());
        let call = AssertUnwindSafe(handler.handle(&ctx)).catch_unwind();

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::cancelled("Task cancelled by request")),
            outcome = call => match outcome {
                Ok(result) => result,
                Err(panic) => Err(Error::handler(format!(
                    "Operation handler panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            },
        }
    }

    async fn publish_status(&self, envelope: &TaskEnvelope) {
        let channel = self.channels.status(&envelope.agent_type);
        if let Err(e) = publish_json(self.broker.as_ref(), &channel, envelope).await {
            debug!(task_id = %envelope.task_id, error = %e, "Status broadcast failed");
        }
    }
}

/// Fail with `Missing required fields: [..]` when any field is absent or null
pub fn validate_required(required: &[&str], input: &InputData) -> Result<()> {
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|field| input.get(*field).map_or(true, Value::is_null))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "Missing required fields: {:?}",
            missing
        )))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::ledger::TaskLedger;
    use crate::task::TaskStatus;
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn context() -> RelayContext {
        RelayContext::in_memory(Settings::default())
    }

    #[test]
    fn test_cancel_tracker_early_and_running_requests() {
        let tracker = CancelTracker::default();
        let parent = CancellationToken::new();
        let (early, running, other) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        tracker.request(early);
        assert!(tracker.begin(early, &parent).is_cancelled());
        tracker.finish();

        let token = tracker.begin(running, &parent);
        assert!(!token.is_cancelled());
        tracker.request(other);
        assert!(!token.is_cancelled());
        tracker.request(running);
        assert!(token.is_cancelled());
        tracker.finish();

        assert!(tracker.begin(other, &parent).is_cancelled());
    }

    #[test]
    fn test_cancel_tracker_request_racing_begin_is_never_lost() {
        let parent = CancellationToken::new();
        for _ in 0..200 {
            let tracker = CancelTracker::default();
            let task_id = Uuid::new_v4();
            let token = std::thread::scope(|scope| {
                scope.spawn(|| tracker.request(task_id));
                scope.spawn(|| tracker.begin(task_id, &parent)).join().unwrap()
            });
            assert!(token.is_cancelled());
        }
    }

    fn envelope(operation: &str, input: Value) -> TaskEnvelope {
        let input = match input {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        TaskEnvelope::new("dd", operation, input).unwrap()
    }

    fn capabilities() -> CapabilitySet {
        CapabilitySet::new("dd")
            .operation(
                "business_overview",
                handler_fn(|ctx: TaskContext| async move {
                    let ticker = ctx.require_str("ticker")?.to_string();
                    Ok::<_, Error>(
                        HandlerOutput::new(json!({ "summary": format!("{} overview", ticker) }))
                            .with_usage(42, "stub-model"),
                    )
                })
                .require(&["ticker"]),
            )
            .operation(
                "explode",
                handler_fn(|_ctx: TaskContext| async move {
                    Err::<HandlerOutput, _>(Error::handler("upstream data missing"))
                }),
            )
            .operation(
                "panic",
                handler_fn(|_ctx: TaskContext| async move {
                    if true {
                        panic!("handler bug");
                    }
                    Ok(HandlerOutput::new(Value::Null))
                }),
            )
    }

    #[test]
    fn test_registry_resolution() {
        let mut registry = OperationRegistry::new();
        assert!(registry.resolve("anything").is_none());

        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        registry.register(
            "known",
            Arc::new(handler_fn(move |_ctx: TaskContext| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(HandlerOutput::new(Value::Null))
                }
            })),
        );
        assert!(registry.contains("known"));
        assert!(registry.resolve("unknown").is_none());

        registry.set_fallback(Arc::new(handler_fn(|_ctx: TaskContext| async move {
            Ok(HandlerOutput::new(json!("generic")))
        })));
        assert!(registry.resolve("unknown").is_some());
        assert_eq!(registry.operations(), vec!["known"]);
    }

    #[test]
    fn test_validate_required_fields() {
        let mut input = Map::new();
        input.insert("ticker".to_string(), json!("AAPL"));
        input.insert("period".to_string(), Value::Null);

        validate_required(&["ticker"], &input).unwrap();
        let err = validate_required(&["ticker", "period", "sector"], &input).unwrap_err();
        assert!(err.is_validation());
        assert!(err
            .to_string()
            .contains(r#"Missing required fields: ["period", "sector"]"#));
    }

    #[tokio::test]
    async fn test_execute_success_publishes_result() {
        let ctx = context();
        let runtime = WorkerRuntime::new(&ctx, capabilities());
        let envelope = envelope("business_overview", json!({"ticker": "AAPL"}));
        let mut reply = ctx
            .broker
            .subscribe(&ctx.channels.results(&envelope.task_id))
            .await
            .unwrap();

        let result = runtime.execute(envelope.clone()).await;
        assert!(result.success);
        assert_eq!(result.data, Some(json!({"summary": "AAPL overview"})));
        assert_eq!(result.tokens_used, 42);
        assert_eq!(result.model_used, "stub-model");

        let published: TaskResult = serde_json::from_str(&reply.recv().await.unwrap()).unwrap();
        assert_eq!(published, result);

        let record = ctx
            .ledger
            .as_ref()
            .unwrap()
            .get(envelope.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(record.started_at.is_some());
    }

    #[tokio::test]
    async fn test_validation_failure_skips_handler() {
        let ctx = context();
        let runtime = WorkerRuntime::new(&ctx, capabilities());
        let result = runtime
            .execute(envelope("business_overview", json!({})))
            .await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Validation));
        assert!(result.error.unwrap().contains("Missing required fields"));
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_become_failed_results() {
        let ctx = context();
        let runtime = WorkerRuntime::new(&ctx, capabilities());

        let failed = runtime.execute(envelope("explode", json!({}))).await;
        assert!(!failed.success);
        assert_eq!(failed.error_kind, Some(ErrorKind::Handler));
        assert!(failed.error.unwrap().contains("upstream data missing"));

        let panicked = runtime.execute(envelope("panic", json!({}))).await;
        assert!(!panicked.success);
        assert!(panicked.error.unwrap().contains("handler bug"));
    }

    #[tokio::test]
    async fn test_unknown_operation_without_fallback() {
        let ctx = context();
        let runtime = WorkerRuntime::new(&ctx, capabilities());
        let result = runtime.execute(envelope("nonexistent", json!({}))).await;
        assert_eq!(result.error_kind, Some(ErrorKind::Handler));
        assert!(result.error.unwrap().contains("Unsupported operation"));
    }

    #[tokio::test]
    async fn test_unknown_operation_uses_fallback() {
        let ctx = context();
        let caps = capabilities().fallback(handler_fn(|ctx: TaskContext| async move {
            Ok(HandlerOutput::new(json!({ "generic": ctx.operation_name() })))
        }));
        let runtime = WorkerRuntime::new(&ctx, caps);
        let result = runtime.execute(envelope("peer_comparison", json!({}))).await;
        assert!(result.success);
        assert_eq!(result.data, Some(json!({"generic": "peer_comparison"})));
    }

    #[tokio::test]
    async fn test_process_payload_drops_malformed_and_foreign_tasks() {
        let ctx = context();
        let runtime = WorkerRuntime::new(&ctx, capabilities());
        assert!(runtime.process_payload("{not json").await.is_none());

        let foreign = TaskEnvelope::new("risk", "risk_assessment", Map::new()).unwrap();
        assert!(runtime
            .process_payload(&foreign.to_json().unwrap())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_loop_survives_failures() {
        let ctx = context();
        let runtime = Arc::new(WorkerRuntime::new(&ctx, capabilities()));
        let handle = runtime.clone().spawn().await.unwrap();

        let bad = envelope("panic", json!({}));
        let good = envelope("business_overview", json!({"ticker": "MSFT"}));
        let mut reply = ctx
            .broker
            .subscribe(&ctx.channels.results(&good.task_id))
            .await
            .unwrap();

        let tasks = ctx.channels.tasks("dd");
        ctx.broker.publish(&tasks, &bad.to_json().unwrap()).await.unwrap();
        ctx.broker.publish(&tasks, &good.to_json().unwrap()).await.unwrap();

        let result: TaskResult = serde_json::from_str(&reply.recv().await.unwrap()).unwrap();
        assert!(result.success);
        assert!(!handle.is_finished());
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_message_stops_running_task() {
        let ctx = context();
        let caps = CapabilitySet::new("dd").operation(
            "slow",
            handler_fn(|_ctx: TaskContext| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(HandlerOutput::new(Value::Null))
            }),
        );
        let runtime = Arc::new(WorkerRuntime::new(&ctx, caps));
        let handle = runtime.clone().spawn().await.unwrap();

        let task = envelope("slow", json!({}));
        let mut reply = ctx
            .broker
            .subscribe(&ctx.channels.results(&task.task_id))
            .await
            .unwrap();
        ctx.broker
            .publish(&ctx.channels.tasks("dd"), &task.to_json().unwrap())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let cancel = CancelRequest {
            task_id: task.task_id,
            reason: Some("caller gave up".to_string()),
        };
        publish_json(ctx.broker.as_ref(), &ctx.channels.cancel("dd"), &cancel)
            .await
            .unwrap();

        let result: TaskResult = serde_json::from_str(&reply.recv().await.unwrap()).unwrap();
        assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
        assert!(result.execution_time_seconds < 60.0);

        let record = ctx
            .ledger
            .as_ref()
            .unwrap()
            .get(task.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_early_cancellation_skips_task() {
        let ctx = context();
        let runtime = WorkerRuntime::new(&ctx, capabilities());
        let task = envelope("business_overview", json!({"ticker": "AAPL"}));

        runtime.cancellations.request(task.task_id);
        let result = runtime.execute(task).await;
        assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
    }
}

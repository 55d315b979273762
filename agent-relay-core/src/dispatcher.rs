//! Request/reply over pub/sub
//!
//! The dispatcher turns a publish on `tasks:{agent_type}` plus a wait on
//! `results:{task_id}` into one awaitable call. The task id is the only
//! correlation key, so concurrent dispatches to the same agent type never see
//! each other's replies.
//!
//! A timeout ends the caller's wait only. The worker keeps running and may
//! still write a terminal ledger entry later; its reply goes to a channel
//! nobody listens to and is dropped. Setting `cancel_on_timeout` additionally
//! publishes a cancellation request, which workers honour between steps.

use crate::cache::ResultCache;
use crate::channel::{publish_json, Broker, ChannelNames, Subscription};
use crate::context::RelayContext;
use crate::ledger::{TaskLedger, TaskRecord, TaskUpdate};
use crate::task::{CancelRequest, InputData, TaskEnvelope, TaskResult};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Dispatcher behaviour
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    pub default_timeout: Duration,
    pub cancel_on_timeout: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            cancel_on_timeout: false,
        }
    }
}

pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    ledger: Option<Arc<dyn TaskLedger>>,
    channels: ChannelNames,
    config: DispatcherConfig,
    cache: ResultCache,
}

impl Dispatcher {
    pub fn new(context: &RelayContext) -> Self {
        let settings = &context.settings;
        Self {
            broker: context.broker.clone(),
            ledger: context.ledger.clone(),
            channels: context.channels.clone(),
            config: DispatcherConfig {
                default_timeout: settings.task_timeout(),
                cancel_on_timeout: settings.agent.cancel_on_timeout,
            },
            cache: ResultCache::new(settings.cache_ttl(), settings.agent.cache_capacity),
        }
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Publish a new task and wait for its reply
    ///
    /// Returns a failed result with a `timeout` error kind when no reply
    /// arrives in time. Only broker failures surface as `Err`.
    pub async fn dispatch(
        &self,
        agent_type: &str,
        operation_name: &str,
        input_data: InputData,
        timeout: Duration,
    ) -> Result<TaskResult> {
        let envelope = TaskEnvelope::new(agent_type, operation_name, input_data)?;
        self.dispatch_envelope(envelope, timeout).await
    }

    /// Like [`dispatch`](Self::dispatch), reusing a successful result of an
    /// identical dispatch made within the cache window
    pub async fn dispatch_cached(
        &self,
        agent_type: &str,
        operation_name: &str,
        input_data: InputData,
        timeout: Duration,
    ) -> Result<TaskResult> {
        let key = ResultCache::key(agent_type, operation_name, &input_data);
        self.cache
            .get_or_dispatch(
                key,
                self.dispatch(agent_type, operation_name, input_data, timeout),
            )
            .await
    }

    /// Dispatch a caller-built envelope
    pub async fn dispatch_envelope(
        &self,
        envelope: TaskEnvelope,
        timeout: Duration,
    ) -> Result<TaskResult> {
        let task_id = envelope.task_id;
        let agent_type = envelope.agent_type.clone();

        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.create(&TaskRecord::from(&envelope)).await {
                warn!(task_id = %task_id, error = %e, "Ledger unavailable; dispatching without it");
            }
        }

        // Subscribe first so a fast worker's reply cannot slip past us
        let mut reply = self.broker.subscribe(&self.channels.results(&task_id)).await?;

        let payload = envelope.to_json()?;
        let delivered = self
            .broker
            .publish(&self.channels.tasks(&agent_type), &payload)
            .await?;
        if delivered == 0 {
            warn!(
                task_id = %task_id,
                agent_type = %agent_type,
                "No worker subscribed; task will not be delivered"
            );
        }
        debug!(
            task_id = %task_id,
            agent_type = %agent_type,
            operation = %envelope.operation_name,
            timeout_ms = timeout.as_millis() as u64,
            "Task dispatched"
        );

        match tokio::time::timeout(timeout, Self::await_reply(&mut reply, task_id)).await {
            Ok(Some(result)) => {
                drop(reply);
                if let Some(ledger) = &self.ledger {
                    if let Err(e) = ledger.update(task_id, TaskUpdate::from_result(&result)).await
                    {
                        warn!(task_id = %task_id, error = %e, "Failed to record task outcome");
                    }
                }
                info!(
                    task_id = %task_id,
                    agent_type = %agent_type,
                    success = result.success,
                    "Task reply received"
                );
                Ok(result)
            }
            Ok(None) => Err(Error::broker(format!(
                "Reply channel for task {} closed before a reply arrived",
                task_id
            ))),
            Err(_) => {
                drop(reply);
                warn!(
                    task_id = %task_id,
                    agent_type = %agent_type,
                    timeout_ms = timeout.as_millis() as u64,
                    "Task timed out waiting for reply"
                );
                if self.config.cancel_on_timeout {
                    if let Err(e) = self
                        .cancel(&agent_type, task_id, Some("dispatch timed out".to_string()))
                        .await
                    {
                        warn!(task_id = %task_id, error = %e, "Failed to send cancellation");
                    }
                }
                Ok(TaskResult::timed_out(task_id, agent_type, timeout))
            }
        }
    }

    /// Ask workers of `agent_type` to stop `task_id`; returns how many
    /// workers were listening
    pub async fn cancel(
        &self,
        agent_type: &str,
        task_id: Uuid,
        reason: Option<String>,
    ) -> Result<usize> {
        let request = CancelRequest { task_id, reason };
        let listeners =
            publish_json(self.broker.as_ref(), &self.channels.cancel(agent_type), &request)
                .await?;
        info!(task_id = %task_id, agent_type = %agent_type, listeners, "Cancellation sent");
        Ok(listeners)
    }

    async fn await_reply(reply: &mut Subscription, task_id: Uuid) -> Option<TaskResult> {
        while let Some(payload) = reply.recv().await {
            match serde_json::from_str::<TaskResult>(&payload) {
                Ok(result) if result.task_id == task_id => return Some(result),
                Ok(result) => warn!(
                    expected = %task_id,
                    actual = %result.task_id,
                    "Ignoring reply for another task"
                ),
                Err(e) => warn!(task_id = %task_id, error = %e, "Dropping malformed reply"),
            }
        }
        None
    }
}

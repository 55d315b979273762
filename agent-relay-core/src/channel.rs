//! Message channel fabric
//!
//! Named publish/subscribe channels with at-most-once, non-durable delivery.
//! A message published while a channel has no subscribers is dropped, and a
//! subscriber that falls more than the channel capacity behind loses the
//! oldest messages. Dispatch, reply and status traffic all flow through a
//! [`Broker`]; [`InMemoryBroker`] serves a single process, and networked
//! implementations forward the same operations to a relay.
//!
//! The broker also offers a leased mutual-exclusion lock for handlers that
//! need at-most-one concurrent execution per key. The dispatch path itself
//! never takes it.

use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Channel names under a configurable prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    prefix: String,
}

impl ChannelNames {
    pub fn new<S: Into<String>>(prefix: S) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `P:tasks:{agent_type}`, consumed by workers of that type
    pub fn tasks(&self, agent_type: &str) -> String {
        format!("{}:tasks:{}", self.prefix, agent_type)
    }

    /// `P:results:{task_id}`, the reply channel of a single dispatch
    pub fn results(&self, task_id: &Uuid) -> String {
        format!("{}:results:{}", self.prefix, task_id)
    }

    /// `P:status:{agent_type}`
    pub fn status(&self, agent_type: &str) -> String {
        format!("{}:status:{}", self.prefix, agent_type)
    }

    /// `P:cancel:{agent_type}`
    pub fn cancel(&self, agent_type: &str) -> String {
        format!("{}:cancel:{}", self.prefix, agent_type)
    }
}

impl Default for ChannelNames {
    fn default() -> Self {
        Self::new("agent-relay")
    }
}

type DropHook = Box<dyn FnOnce() + Send + Sync>;

/// Live subscription to one channel; dropping it unsubscribes
pub struct Subscription {
    channel: String,
    receiver: Option<broadcast::Receiver<String>>,
    on_drop: Vec<DropHook>,
}

impl Subscription {
    pub fn new<S: Into<String>>(channel: S, receiver: broadcast::Receiver<String>) -> Self {
        Self {
            channel: channel.into(),
            receiver: Some(receiver),
            on_drop: Vec::new(),
        }
    }

    /// Register a callback to run after the receiver is released
    pub fn on_drop<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.on_drop.push(Box::new(hook));
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next message. Returns `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<String> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(payload) => return Some(payload),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        channel = %self.channel,
                        skipped,
                        "Subscriber lagged behind; messages dropped"
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        drop(self.receiver.take());
        for hook in self.on_drop.drain(..) {
            hook();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish()
    }
}

/// Proof of holding a named lock for the duration of its lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    pub name: String,
    pub token: Uuid,
    pub lease: Duration,
}

/// Publish/subscribe broker with named channels and leased locks
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload; returns how many subscribers received it
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;

    /// Subscribe to a channel. Only messages published afterwards are seen.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Take the named lock if it is free or its lease has expired
    async fn try_acquire_lock(&self, name: &str, lease: Duration) -> Result<Option<LockGuard>>;

    /// Release a lock; `false` if the lease expired or another holder took it
    async fn release_lock(&self, guard: &LockGuard) -> Result<bool>;

    async fn ping(&self) -> Result<()>;

    /// Disconnect; subsequent operations fail
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Retry `try_acquire_lock` until it succeeds or `wait` elapses
    async fn acquire_lock(
        &self,
        name: &str,
        lease: Duration,
        wait: Duration,
    ) -> Result<Option<LockGuard>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(guard) = self.try_acquire_lock(name, lease).await? {
                return Ok(Some(guard));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }
}

/// Serialize `value` as JSON and publish it
pub async fn publish_json<T: Serialize + ?Sized>(
    broker: &dyn Broker,
    channel: &str,
    value: &T,
) -> Result<usize> {
    let payload = serde_json::to_string(value)?;
    broker.publish(channel, &payload).await
}

#[derive(Debug)]
struct LockEntry {
    token: Uuid,
    expires_at: Instant,
}

/// Single-process broker over tokio broadcast channels
pub struct InMemoryBroker {
    channels: Arc<DashMap<String, broadcast::Sender<String>>>,
    locks: Mutex<HashMap<String, LockEntry>>,
    capacity: usize,
    closed: AtomicBool,
}

impl InMemoryBroker {
    /// Create a broker whose channels buffer up to `capacity` messages
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            locks: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of live subscriptions on a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Number of channels with at least one subscriber
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::broker("broker is closed"));
        }
        Ok(())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        self.ensure_open()?;
        let delivered = match self.channels.get(channel) {
            Some(sender) => sender.send(payload.to_string()).unwrap_or(0),
            None => 0,
        };
        if delivered == 0 {
            debug!(channel = %channel, "Published to channel without subscribers");
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.ensure_open()?;
        let receiver = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let channels = Arc::downgrade(&self.channels);
        let name = channel.to_string();
        Ok(Subscription::new(channel, receiver).on_drop(move || {
            if let Some(channels) = channels.upgrade() {
                channels.remove_if(&name, |_, sender| sender.receiver_count() == 0);
            }
        }))
    }

    async fn try_acquire_lock(&self, name: &str, lease: Duration) -> Result<Option<LockGuard>> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut locks = self.locks.lock();
        if let Some(entry) = locks.get(name) {
            if entry.expires_at > now {
                return Ok(None);
            }
        }
        let token = Uuid::new_v4();
        locks.insert(
            name.to_string(),
            LockEntry {
                token,
                expires_at: now + lease,
            },
        );
        Ok(Some(LockGuard {
            name: name.to_string(),
            token,
            lease,
        }))
    }

    async fn release_lock(&self, guard: &LockGuard) -> Result<bool> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut locks = self.locks.lock();
        match locks.get(&guard.name) {
            Some(entry) if entry.token == guard.token && entry.expires_at > now => {
                locks.remove(&guard.name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.channels.clear();
        self.locks.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        let names = ChannelNames::new("research");
        let id = Uuid::nil();
        assert_eq!(names.tasks("dd"), "research:tasks:dd");
        assert_eq!(
            names.results(&id),
            "research:results:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(names.status("dd"), "research:status:dd");
        assert_eq!(names.cancel("dd"), "research:cancel:dd");
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_is_dropped() {
        let broker = InMemoryBroker::default();
        assert_eq!(broker.publish("a", "lost").await.unwrap(), 0);

        let mut sub = broker.subscribe("a").await.unwrap();
        assert_eq!(broker.publish("a", "kept").await.unwrap(), 1);
        assert_eq!(sub.recv().await.as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_message() {
        let broker = InMemoryBroker::default();
        let mut first = broker.subscribe("fanout").await.unwrap();
        let mut second = broker.subscribe("fanout").await.unwrap();

        assert_eq!(broker.publish("fanout", "hello").await.unwrap(), 2);
        assert_eq!(first.recv().await.as_deref(), Some("hello"));
        assert_eq!(second.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_dropping_last_subscription_removes_channel() {
        let broker = InMemoryBroker::default();
        let first = broker.subscribe("results:x").await.unwrap();
        let second = broker.subscribe("results:x").await.unwrap();
        assert_eq!(broker.channel_count(), 1);

        drop(first);
        assert_eq!(broker.subscriber_count("results:x"), 1);
        drop(second);
        assert_eq!(broker.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_old_messages() {
        let broker = InMemoryBroker::new(2);
        let mut sub = broker.subscribe("busy").await.unwrap();
        for i in 0..5 {
            broker.publish("busy", &i.to_string()).await.unwrap();
        }
        assert_eq!(sub.recv().await.as_deref(), Some("3"));
        assert_eq!(sub.recv().await.as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_closed_broker_rejects_operations() {
        let broker = InMemoryBroker::default();
        let mut sub = broker.subscribe("a").await.unwrap();
        broker.close().await.unwrap();

        assert!(sub.recv().await.is_none());
        assert!(matches!(
            broker.publish("a", "x").await,
            Err(Error::Broker { .. })
        ));
        assert!(broker.ping().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_lease_and_release() {
        let broker = InMemoryBroker::default();
        let lease = Duration::from_secs(10);

        let guard = broker.try_acquire_lock("AAPL", lease).await.unwrap().unwrap();
        assert!(broker.try_acquire_lock("AAPL", lease).await.unwrap().is_none());
        assert!(broker.release_lock(&guard).await.unwrap());

        let guard = broker.try_acquire_lock("AAPL", lease).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        let stolen = broker.try_acquire_lock("AAPL", lease).await.unwrap().unwrap();
        assert_ne!(stolen.token, guard.token);
        assert!(!broker.release_lock(&guard).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_acquire_waits_for_expiry() {
        let broker = InMemoryBroker::default();
        broker
            .try_acquire_lock("scan", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        let waited = broker
            .acquire_lock("scan", Duration::from_secs(1), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(waited.is_some());

        let gave_up = broker
            .acquire_lock("scan", Duration::from_secs(30), Duration::from_millis(200))
            .await
            .unwrap();
        assert!(gave_up.is_none());
    }
}

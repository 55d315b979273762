//! [`Broker`] implementation over a relay hub connection
//!
//! Requests are correlated with replies by a per-connection id. Messages for
//! channels this process subscribed to are fanned out locally, so any number
//! of local subscriptions to one channel share the hub's delivery: the hub
//! sees one `subscribe` when the first local receiver appears and one
//! `unsubscribe` when the last one goes.

use crate::protocol::{ClientFrame, ServerFrame};
use agent_relay_core::channel::{Broker, LockGuard, Subscription};
use agent_relay_core::{Error, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, OnceCell};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type Pending = DashMap<u64, oneshot::Sender<ServerFrame>>;
type LocalChannels = DashMap<String, LocalChannel>;

/// Local fan-out for one channel
struct LocalChannel {
    sender: broadcast::Sender<String>,
    /// Set once the hub acknowledged this connection's subscription
    hub: Arc<OnceCell<()>>,
}

impl LocalChannel {
    fn new(capacity: usize) -> Self {
        Self {
            sender: broadcast::channel(capacity).0,
            hub: Arc::new(OnceCell::new()),
        }
    }
}

/// Networked broker speaking the relay protocol
pub struct RelayBroker {
    url: String,
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Arc<Pending>,
    channels: Arc<LocalChannels>,
    next_id: AtomicU64,
    capacity: usize,
    request_timeout: Duration,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RelayBroker {
    /// Connect to a hub at `url` (`ws://host:port`)
    pub async fn connect(url: &str, capacity: usize) -> crate::Result<Self> {
        let (websocket, _) = connect_async(url).await?;
        info!(url = %url, "Connected to relay hub");

        let (mut sink, mut stream) = websocket.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!(error = %e, "Relay write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let pending: Arc<Pending> = Arc::new(DashMap::new());
        let channels: Arc<LocalChannels> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let reader = {
            let pending = pending.clone();
            let channels = channels.clone();
            let closed = closed.clone();
            let outgoing = outgoing.clone();
            let url = url.to_string();
            tokio::spawn(async move {
                while let Some(message) = stream.next().await {
                    let text = match message {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Binary(data)) => match String::from_utf8(data) {
                            Ok(text) => text,
                            Err(_) => continue,
                        },
                        Ok(Message::Ping(payload)) => {
                            let _ = outgoing.send(Message::Pong(payload));
                            continue;
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            warn!(url = %url, error = %e, "Relay connection error");
                            break;
                        }
                    };
                    route_frame(&text, &pending, &channels);
                }

                closed.store(true, Ordering::Release);
                // Dropping the senders fails in-flight requests and ends
                // local subscriptions
                pending.clear();
                channels.clear();
                info!(url = %url, "Relay connection closed");
            })
        };

        Ok(Self {
            url: url.to_string(),
            outgoing,
            pending,
            channels,
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            closed,
            reader,
            writer,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::broker(format!("relay connection to {} is closed", self.url)));
        }
        Ok(())
    }

    fn send_frame(&self, frame: &ClientFrame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        self.outgoing
            .send(Message::Text(text))
            .map_err(|_| Error::broker("relay writer has stopped"))
    }

    /// Send a request frame and wait for its reply
    async fn request(&self, frame: ClientFrame) -> Result<ServerFrame> {
        self.ensure_open()?;
        let id = frame
            .id()
            .ok_or_else(|| Error::Internal("relay request frame without id".to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        if let Err(e) = self.send_frame(&frame) {
            self.pending.remove(&id);
            return Err(e);
        }

        let reply = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(Error::broker("relay connection closed before reply"));
            }
            Err(_) => {
                self.pending.remove(&id);
                return Err(Error::broker(format!(
                    "relay request {} timed out after {:?}",
                    id, self.request_timeout
                )));
            }
        };

        match reply {
            ServerFrame::Reply {
                error: Some(message),
                ..
            } => Err(Error::broker(message)),
            reply => Ok(reply),
        }
    }
}

fn route_frame(text: &str, pending: &Pending, channels: &LocalChannels) {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(reply @ ServerFrame::Reply { .. }) => {
            let ServerFrame::Reply { id, .. } = &reply else {
                return;
            };
            match pending.remove(id) {
                Some((_, tx)) => {
                    let _ = tx.send(reply);
                }
                None => debug!(id, "Reply for an abandoned request"),
            }
        }
        Ok(ServerFrame::Message { channel, payload }) => {
            if let Some(local) = channels.get(&channel) {
                let _ = local.sender.send(payload);
            }
        }
        Err(e) => warn!(error = %e, "Dropping malformed relay frame"),
    }
}

#[async_trait]
impl Broker for RelayBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let reply = self
            .request(ClientFrame::Publish {
                id: self.next_id(),
                channel: channel.to_string(),
                payload: payload.to_string(),
            })
            .await?;
        match reply {
            ServerFrame::Reply { delivered, .. } => Ok(delivered.unwrap_or(0)),
            ServerFrame::Message { .. } => Ok(0),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.ensure_open()?;
        // Take the local receiver first so nothing published after the
        // hub's acknowledgement is missed
        let (receiver, hub) = {
            let local = self
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| LocalChannel::new(self.capacity));
            (local.sender.subscribe(), local.hub.clone())
        };

        // Only the first local subscriber asks the hub; later ones wait for
        // that acknowledgement
        let acknowledged = hub
            .get_or_try_init(|| async {
                self.request(ClientFrame::Subscribe {
                    id: self.next_id(),
                    channel: channel.to_string(),
                })
                .await
                .map(|_| ())
            })
            .await;
        if let Err(e) = acknowledged {
            drop(receiver);
            self.channels
                .remove_if(channel, |_, local| local.sender.receiver_count() == 0);
            return Err(e);
        }

        let channels = Arc::downgrade(&self.channels);
        let outgoing = self.outgoing.clone();
        let name = channel.to_string();
        Ok(Subscription::new(channel, receiver).on_drop(move || {
            let Some(channels) = channels.upgrade() else {
                return;
            };
            // The frame is queued while the entry is held so a resubscribe
            // cannot overtake it
            if let Entry::Occupied(entry) = channels.entry(name.clone()) {
                if entry.get().sender.receiver_count() == 0 {
                    let hub_subscribed = entry.get().hub.initialized();
                    entry.remove();
                    if hub_subscribed {
                        if let Ok(text) =
                            serde_json::to_string(&ClientFrame::Unsubscribe { channel: name })
                        {
                            let _ = outgoing.send(Message::Text(text));
                        }
                    }
                }
            };
        }))
    }

    async fn try_acquire_lock(&self, name: &str, lease: Duration) -> Result<Option<LockGuard>> {
        let reply = self
            .request(ClientFrame::AcquireLock {
                id: self.next_id(),
                name: name.to_string(),
                lease_ms: lease.as_millis() as u64,
            })
            .await?;
        match reply {
            ServerFrame::Reply {
                lock: Some(grant), ..
            } => Ok(Some(LockGuard {
                name: name.to_string(),
                token: grant.token,
                lease,
            })),
            _ => Ok(None),
        }
    }

    async fn release_lock(&self, guard: &LockGuard) -> Result<bool> {
        let reply = self
            .request(ClientFrame::ReleaseLock {
                id: self.next_id(),
                name: guard.name.clone(),
                token: guard.token,
            })
            .await?;
        match reply {
            ServerFrame::Reply { released, .. } => Ok(released.unwrap_or(false)),
            ServerFrame::Message { .. } => Ok(false),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.request(ClientFrame::Ping { id: self.next_id() }).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.outgoing.send(Message::Close(None));
        self.pending.clear();
        self.channels.clear();
        info!(url = %self.url, "Relay broker closed");
        Ok(())
    }
}

impl Drop for RelayBroker {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl std::fmt::Debug for RelayBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayBroker")
            .field("url", &self.url)
            .field("closed", &self.is_closed())
            .field("local_channels", &self.channels.len())
            .finish()
    }
}

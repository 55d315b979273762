//! WebSocket relay hub
//!
//! Lets dispatchers and workers in separate processes share one channel
//! fabric. The hub owns an [`InMemoryBroker`]; each client connection
//! subscribes, publishes and takes locks on it through JSON frames (see
//! [`crate::protocol`]). Delivery keeps the in-memory semantics: at most
//! once, nothing retained for channels without subscribers.

use crate::protocol::{ClientFrame, LockGrant, ServerFrame};
use crate::Result;
use agent_relay_core::channel::{Broker, InMemoryBroker, LockGuard};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Accepts relay clients and routes their frames through a shared broker
pub struct RelayHub {
    listener: TcpListener,
    broker: Arc<InMemoryBroker>,
    connections: Arc<AtomicUsize>,
}

impl RelayHub {
    /// Bind the hub; channels buffer up to `capacity` messages per subscriber
    pub async fn bind(addr: &str, capacity: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Relay hub listening");
        Ok(Self {
            listener,
            broker: Arc::new(InMemoryBroker::new(capacity)),
            connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn broker(&self) -> Arc<InMemoryBroker> {
        self.broker.clone()
    }

    /// Number of connected clients
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Accept connections until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Relay hub shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let broker = self.broker.clone();
                        let connections = self.connections.clone();
                        let stop = shutdown.child_token();
                        tokio::spawn(async move {
                            connections.fetch_add(1, Ordering::AcqRel);
                            if let Err(e) = serve_connection(stream, peer, broker, stop).await {
                                warn!(peer = %peer, error = %e, "Relay connection ended with error");
                            }
                            connections.fetch_sub(1, Ordering::AcqRel);
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept relay connection"),
                }
            }
        }
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<InMemoryBroker>,
    shutdown: CancellationToken,
) -> Result<()> {
    let websocket = accept_async(stream).await?;
    info!(peer = %peer, "Relay client connected");

    let (mut sink, mut incoming) = websocket.split();
    let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = outgoing_rx.recv().await {
            if let Err(e) = sink.send(message).await {
                debug!(error = %e, "Relay client write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = Session::new(broker, outgoing);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            message = incoming.next() => match message {
                Some(Ok(Message::Text(text))) => session.handle_text(&text).await,
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => session.handle_text(&text).await,
                    Err(e) => warn!(peer = %peer, error = %e, "Dropping non-UTF-8 frame"),
                },
                Some(Ok(Message::Ping(payload))) => session.send(Message::Pong(payload)),
                Some(Ok(Message::Close(frame))) => {
                    debug!(peer = %peer, frame = ?frame, "Relay client closed connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(peer = %peer, error = %e, "Relay connection error");
                    break;
                }
                None => break,
            }
        }
    }

    let released = session.close();
    writer.abort();
    info!(peer = %peer, subscriptions = released, "Relay client disconnected");
    Ok(())
}

/// Per-connection state: forwarding tasks keyed by channel, one per
/// subscribe frame
struct Session {
    broker: Arc<InMemoryBroker>,
    outgoing: mpsc::UnboundedSender<Message>,
    forwarders: HashMap<String, Vec<JoinHandle<()>>>,
}

impl Session {
    fn new(broker: Arc<InMemoryBroker>, outgoing: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            broker,
            outgoing,
            forwarders: HashMap::new(),
        }
    }

    fn send(&self, message: Message) {
        // A closed writer means the connection is going away
        let _ = self.outgoing.send(message);
    }

    fn send_frame(&self, frame: &ServerFrame) {
        match serde_json::to_string(frame) {
            Ok(text) => self.send(Message::Text(text)),
            Err(e) => error!(error = %e, "Failed to encode relay frame"),
        }
    }

    async fn handle_text(&mut self, text: &str) {
        let frame = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed relay frame");
                let id = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|v| v.get("id").and_then(|id| id.as_u64()));
                if let Some(id) = id {
                    self.send_frame(&ServerFrame::error(id, format!("malformed frame: {}", e)));
                }
                return;
            }
        };

        let id = frame.id();
        match self.apply(frame).await {
            Ok(Some(reply)) => self.send_frame(&reply),
            Ok(None) => {}
            Err(e) => {
                if let Some(id) = id {
                    self.send_frame(&ServerFrame::error(id, e.to_string()));
                }
            }
        }
    }

    async fn apply(&mut self, frame: ClientFrame) -> agent_relay_core::Result<Option<ServerFrame>> {
        match frame {
            ClientFrame::Subscribe { id, channel } => {
                let mut subscription = self.broker.subscribe(&channel).await?;
                let outgoing = self.outgoing.clone();
                let name = channel.clone();
                let forwarder = tokio::spawn(async move {
                    while let Some(payload) = subscription.recv().await {
                        let frame = ServerFrame::Message {
                            channel: name.clone(),
                            payload,
                        };
                        let Ok(text) = serde_json::to_string(&frame) else {
                            continue;
                        };
                        if outgoing.send(Message::Text(text)).is_err() {
                            break;
                        }
                    }
                });
                self.forwarders.entry(channel.clone()).or_default().push(forwarder);
                debug!(channel = %channel, "Client subscribed");
                Ok(Some(ServerFrame::ack(id)))
            }
            ClientFrame::Unsubscribe { channel } => {
                if let Some(handles) = self.forwarders.get_mut(&channel) {
                    if let Some(handle) = handles.pop() {
                        handle.abort();
                    }
                    if handles.is_empty() {
                        self.forwarders.remove(&channel);
                    }
                }
                debug!(channel = %channel, "Client unsubscribed");
                Ok(None)
            }
            ClientFrame::Publish { id, channel, payload } => {
                let delivered = self.broker.publish(&channel, &payload).await?;
                Ok(Some(ServerFrame::Reply {
                    id,
                    delivered: Some(delivered),
                    lock: None,
                    released: None,
                    error: None,
                }))
            }
            ClientFrame::AcquireLock { id, name, lease_ms } => {
                let guard = self
                    .broker
                    .try_acquire_lock(&name, Duration::from_millis(lease_ms))
                    .await?;
                Ok(Some(ServerFrame::Reply {
                    id,
                    delivered: None,
                    lock: guard.map(|guard| LockGrant {
                        token: guard.token,
                        lease_ms,
                    }),
                    released: None,
                    error: None,
                }))
            }
            ClientFrame::ReleaseLock { id, name, token } => {
                let guard = LockGuard {
                    name,
                    token,
                    lease: Duration::ZERO,
                };
                let released = self.broker.release_lock(&guard).await?;
                Ok(Some(ServerFrame::Reply {
                    id,
                    delivered: None,
                    lock: None,
                    released: Some(released),
                    error: None,
                }))
            }
            ClientFrame::Ping { id } => {
                self.broker.ping().await?;
                Ok(Some(ServerFrame::ack(id)))
            }
        }
    }

    /// Abort every forwarder; returns how many were live
    fn close(&mut self) -> usize {
        let mut released = 0;
        for (_, handles) in self.forwarders.drain() {
            for handle in handles {
                handle.abort();
                released += 1;
            }
        }
        released
    }
}

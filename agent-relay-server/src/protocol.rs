//! Relay wire protocol
//!
//! Every WebSocket text frame carries one JSON object tagged by `op`.
//! Clients send [`ClientFrame`]s; requests that carry an `id` are answered
//! with a [`ServerFrame::Reply`] bearing the same id. Messages published on a
//! channel the connection subscribed to arrive as [`ServerFrame::Message`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frames sent by a relay client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        id: u64,
        channel: String,
    },
    /// Fire-and-forget; releases one prior subscription
    Unsubscribe {
        channel: String,
    },
    Publish {
        id: u64,
        channel: String,
        payload: String,
    },
    AcquireLock {
        id: u64,
        name: String,
        lease_ms: u64,
    },
    ReleaseLock {
        id: u64,
        name: String,
        token: Uuid,
    },
    Ping {
        id: u64,
    },
}

impl ClientFrame {
    /// Request id, `None` for frames that expect no reply
    pub fn id(&self) -> Option<u64> {
        match self {
            ClientFrame::Subscribe { id, .. }
            | ClientFrame::Publish { id, .. }
            | ClientFrame::AcquireLock { id, .. }
            | ClientFrame::ReleaseLock { id, .. }
            | ClientFrame::Ping { id } => Some(*id),
            ClientFrame::Unsubscribe { .. } => None,
        }
    }
}

/// Lock granted by the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockGrant {
    pub token: Uuid,
    pub lease_ms: u64,
}

/// Frames sent by the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerFrame {
    Reply {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delivered: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lock: Option<LockGrant>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        released: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Message {
        channel: String,
        payload: String,
    },
}

impl ServerFrame {
    /// Empty successful reply
    pub fn ack(id: u64) -> Self {
        ServerFrame::Reply {
            id,
            delivered: None,
            lock: None,
            released: None,
            error: None,
        }
    }

    pub fn error<S: Into<String>>(id: u64, message: S) -> Self {
        ServerFrame::Reply {
            id,
            delivered: None,
            lock: None,
            released: None,
            error: Some(message.into()),
        }
    }
}

//! Relay hub, worker processes and CLI for Agent Relay
//!
//! Ties the core runtime to its deployments: a WebSocket [`relay::RelayHub`]
//! that lets processes share one channel fabric, a [`relay_client::RelayBroker`]
//! that speaks to it, the generation-backed handlers and capability sets
//! workers run, and the predefined research workflows.

pub mod capabilities;
pub mod context;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod relay;
pub mod relay_client;
pub mod telemetry;
pub mod workflows;

pub use context::{connect_broker, AppContext};
pub use error::{Error, Result};
pub use relay::RelayHub;
pub use relay_client::RelayBroker;

/// Re-export the member crates for convenience
pub use agent_relay_core as core;
pub use agent_relay_llm as llm;
pub use agent_relay_prompts as prompts;
pub use agent_relay_storage as storage;

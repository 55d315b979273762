//! Core types and runtime for Agent Relay
//!
//! This crate holds the task envelope and result wire types, the broker
//! abstraction that carries them, the worker runtime that executes
//! operations, the dispatcher that awaits correlated replies, and the
//! workflow orchestrator that composes dispatches into multi-phase runs.

pub mod cache;
pub mod channel;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod ledger;
pub mod orchestration;
pub mod task;
pub mod worker;

pub use error::{Error, Result};

pub use channel::{Broker, ChannelNames, InMemoryBroker, Subscription};
pub use config::Settings;
pub use context::RelayContext;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use ledger::{InMemoryLedger, TaskLedger};
pub use task::{TaskEnvelope, TaskResult, TaskStatus};
pub use worker::{CapabilitySet, OperationHandler, WorkerRuntime};

//! Storage layer for Agent Relay
//!
//! Persists task records and workflow runs in SQLite and exposes them
//! through the core [`TaskLedger`](agent_relay_core::ledger::TaskLedger)
//! trait, so dispatchers and workers in different processes can share task
//! status.

pub mod error;
pub mod ledger;
pub mod manager;
pub mod migrations;
pub mod repositories;

pub use error::{Error, Result};
pub use ledger::SqliteLedger;
pub use manager::{DatabaseConfig, DatabaseStats, StorageManager};

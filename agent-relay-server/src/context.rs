//! Process wiring: broker connection, ledger, dispatcher and generation
//! service built from [`Settings`]

use crate::relay_client::RelayBroker;
use crate::{Error, Result};
use agent_relay_core::config::{BrokerSettings, Settings};
use agent_relay_core::orchestration::WorkflowOrchestrator;
use agent_relay_core::{Broker, Dispatcher, InMemoryBroker, RelayContext, TaskLedger};
use agent_relay_llm::GenerationService;
use agent_relay_storage::{DatabaseConfig, SqliteLedger, StorageManager};
use std::sync::Arc;
use tracing::{info, warn};

/// Everything one process needs to run a role
pub struct AppContext {
    pub relay: RelayContext,
    pub storage: Option<Arc<StorageManager>>,
}

impl AppContext {
    /// Validate settings, connect to the broker and open the ledger
    pub async fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let broker = connect_broker(&settings.broker).await?;

        let storage = if settings.ledger.enabled {
            let config = DatabaseConfig::from(&settings.ledger);
            let storage = Arc::new(StorageManager::new(&config).await?);
            info!(database = %db_scheme(&config.url), "Task ledger opened");
            Some(storage)
        } else {
            info!("Task ledger disabled");
            None
        };

        let mut relay = RelayContext::new(settings, broker);
        if let Some(storage) = &storage {
            relay = relay.with_ledger(Arc::new(SqliteLedger::new(storage.clone())));
        }
        Ok(Self { relay, storage })
    }

    pub fn settings(&self) -> &Settings {
        &self.relay.settings
    }

    pub fn ledger(&self) -> Option<Arc<dyn TaskLedger>> {
        self.relay.ledger.clone()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(&self.relay))
    }

    pub fn orchestrator(&self) -> WorkflowOrchestrator {
        WorkflowOrchestrator::new(&self.relay, self.dispatcher())
    }

    pub fn generation_service(&self) -> Result<Arc<GenerationService>> {
        Ok(Arc::new(GenerationService::from_settings(&self.settings().llm)?))
    }

    /// Disconnect from the broker and close the database pool
    pub async fn close(&self) -> Result<()> {
        let broker = self.relay.close().await;
        if let Some(storage) = &self.storage {
            storage.close().await;
        }
        broker.map_err(Error::from)
    }
}

/// `memory` gives an in-process broker; `ws://` and `wss://` URLs connect
/// to a relay hub
pub async fn connect_broker(settings: &BrokerSettings) -> Result<Arc<dyn Broker>> {
    let url = settings.url.trim();
    if url == "memory" {
        info!("Using in-process broker");
        return Ok(Arc::new(InMemoryBroker::new(settings.channel_capacity)));
    }
    if url.starts_with("ws://") || url.starts_with("wss://") {
        let broker = RelayBroker::connect(url, settings.channel_capacity).await?;
        return Ok(Arc::new(broker));
    }
    warn!(url = %url, "Unsupported broker URL");
    Err(Error::configuration(format!(
        "unsupported broker url '{}': expected 'memory' or a ws:// address",
        url
    )))
}

/// Database kind for logs, without credentials or paths
fn db_scheme(url: &str) -> &'static str {
    if url.starts_with("sqlite:") {
        "SQLite"
    } else {
        "Unknown DB"
    }
}

//! Shared process context
//!
//! Built once at process start and handed to the dispatcher, worker runtimes
//! and orchestrator. Holds read-mostly handles only.

use crate::channel::{Broker, ChannelNames, InMemoryBroker};
use crate::config::Settings;
use crate::ledger::{InMemoryLedger, TaskLedger};
use crate::Result;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct RelayContext {
    pub settings: Arc<Settings>,
    pub broker: Arc<dyn Broker>,
    pub ledger: Option<Arc<dyn TaskLedger>>,
    pub channels: ChannelNames,
}

impl RelayContext {
    pub fn new(settings: Settings, broker: Arc<dyn Broker>) -> Self {
        let channels = ChannelNames::new(settings.broker.channel_prefix.clone());
        Self {
            settings: Arc::new(settings),
            broker,
            ledger: None,
            channels,
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn TaskLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Single-process context with an in-memory broker and ledger
    pub fn in_memory(settings: Settings) -> Self {
        let broker = Arc::new(InMemoryBroker::new(settings.broker.channel_capacity));
        Self::new(settings, broker).with_ledger(Arc::new(InMemoryLedger::new()))
    }

    /// Disconnect from the broker
    pub async fn close(&self) -> Result<()> {
        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "Broker did not close cleanly");
            return Err(e);
        }
        info!("Relay context closed");
        Ok(())
    }
}

impl std::fmt::Debug for RelayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayContext")
            .field("channels", &self.channels)
            .field("ledger", &self.ledger.is_some())
            .finish()
    }
}

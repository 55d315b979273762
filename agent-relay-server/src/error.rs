//! Error types for the relay server and worker processes

use thiserror::Error;

/// Server application error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Core domain error: {0}")]
    Core(#[from] agent_relay_core::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] agent_relay_storage::Error),

    #[error("Generation error: {0}")]
    Llm(#[from] agent_relay_llm::LlmError),

    #[error("Prompt error: {0}")]
    Prompt(#[from] agent_relay_prompts::PromptError),

    #[error("Relay protocol error: {0}")]
    Protocol(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration(message.into())
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol(message.into())
    }
}

/// Relay failures reach callers of the `Broker` trait as broker errors
impl From<Error> for agent_relay_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Core(inner) => inner,
            other => agent_relay_core::Error::broker(other.to_string()),
        }
    }
}

/// Convenience result type for server operations
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for storage operations

use thiserror::Error;

/// Storage layer error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Core domain error: {0}")]
    Core(#[from] agent_relay_core::Error),

    #[error("Not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Corrupt row in {table}: {message}")]
    CorruptRow { table: String, message: String },
}

impl Error {
    pub fn corrupt<T: Into<String>, M: Into<String>>(table: T, message: M) -> Self {
        Self::CorruptRow {
            table: table.into(),
            message: message.into(),
        }
    }
}

/// Storage failures surface through the ledger trait as ledger errors
impl From<Error> for agent_relay_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Core(inner) => inner,
            Error::NotFound { entity, id } => agent_relay_core::Error::not_found(entity, id),
            other => agent_relay_core::Error::ledger(other.to_string()),
        }
    }
}

/// Convenience result type for storage operations
pub type Result<T> = std::result::Result<T, Error>;

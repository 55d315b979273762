//! Error types for the dispatch and orchestration layer

use thiserror::Error;

/// Core error type for dispatch, worker and workflow operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("UUID parsing error: {0}")]
    UuidParse(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("State transition error: {message}")]
    StateTransition { message: String },

    #[error("Broker error: {message}")]
    Broker { message: String },

    #[error("Ledger error: {message}")]
    Ledger { message: String },

    #[error("Task cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Handler error: {message}")]
    Handler { message: String },

    #[error("Dependency error: {dependency} - {message}")]
    Dependency { dependency: String, message: String },
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<uuid::Error> for Error {
    fn from(err: uuid::Error) -> Self {
        Error::UuidParse(err.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Configuration {
            message: err.to_string(),
        }
    }
}

impl Error {
    /// Create a validation error with a formatted message
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not found error for a specific entity type and ID
    pub fn not_found<S1: Into<String>, S2: Into<String>>(entity_type: S1, id: S2) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a state transition error
    pub fn state_transition<S: Into<String>>(message: S) -> Self {
        Self::StateTransition {
            message: message.into(),
        }
    }

    /// Create a broker error
    pub fn broker<S: Into<String>>(message: S) -> Self {
        Self::Broker {
            message: message.into(),
        }
    }

    /// Create a ledger error
    pub fn ledger<S: Into<String>>(message: S) -> Self {
        Self::Ledger {
            message: message.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(reason: S) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create a handler error
    pub fn handler<S: Into<String>>(message: S) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Create a dependency error
    pub fn dependency<S1: Into<String>, S2: Into<String>>(dependency: S1, message: S2) -> Self {
        Self::Dependency {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    /// Check if this error is a validation error
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }

    /// Check if this error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Check if this error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation",
            Error::NotFound { .. } => "not_found",
            Error::Serialization(_) => "serialization",
            Error::UuidParse(_) => "uuid_parse",
            Error::Internal(_) => "internal",
            Error::Configuration { .. } => "configuration",
            Error::StateTransition { .. } => "state_transition",
            Error::Broker { .. } => "broker",
            Error::Ledger { .. } => "ledger",
            Error::Cancelled { .. } => "cancelled",
            Error::Handler { .. } => "handler",
            Error::Dependency { .. } => "dependency",
        }
    }
}

/// Convenience result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let validation_err = Error::validation("Missing required fields: [\"ticker\"]");
        assert!(validation_err.is_validation());
        assert!(!validation_err.is_not_found());
        assert_eq!(validation_err.category(), "validation");

        let not_found_err = Error::not_found("task", "123");
        assert!(not_found_err.is_not_found());
        assert_eq!(not_found_err.category(), "not_found");

        let cancelled = Error::cancelled("caller gave up");
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.category(), "cancelled");
        assert_eq!(Error::dependency("openai", "503").category(), "dependency");
    }

    #[test]
    fn test_error_from_conversions() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let core_err: Error = json_err.into();
        assert_eq!(core_err.category(), "serialization");

        let uuid_err = uuid::Uuid::parse_str("invalid-uuid").unwrap_err();
        let core_err: Error = uuid_err.into();
        assert_eq!(core_err.category(), "uuid_parse");
    }

    #[test]
    fn test_error_display() {
        let err = Error::dependency("anthropic", "rate limited");
        let display_str = format!("{}", err);
        assert!(display_str.contains("Dependency error"));
        assert!(display_str.contains("anthropic"));
        assert!(display_str.contains("rate limited"));
    }
}

//! Error types for generation providers

use thiserror::Error;

/// Result type for generation calls
pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Rate limited: {message}")]
    RateLimited { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Model not found: {model}")]
    ModelNotFound { model: String },

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Failed to parse provider response: {message}")]
    Parse { message: String },

    #[error("Structured output did not parse: {message}")]
    StructuredOutput { message: String, raw: String },

    #[error("Unknown provider: {name}")]
    UnknownProvider { name: String },

    #[error("Provider error: {message}")]
    Other { message: String },
}

impl LlmError {
    pub fn missing_api_key(provider: &str) -> Self {
        Self::AuthenticationFailed {
            message: format!("API key not configured for {}", provider),
        }
    }

    pub fn parse<S: Into<String>>(message: S) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Whether the same request may succeed if repeated
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. }
                | LlmError::ServerError { .. }
                | LlmError::Network { .. }
                | LlmError::Timeout { .. }
        )
    }

    pub fn category(&self) -> &'static str {
        match self {
            LlmError::AuthenticationFailed { .. } => "authentication",
            LlmError::RateLimited { .. } => "rate_limit",
            LlmError::InvalidRequest { .. } => "invalid_request",
            LlmError::ModelNotFound { .. } => "model_not_found",
            LlmError::ServerError { .. } => "server",
            LlmError::Network { .. } => "network",
            LlmError::Timeout { .. } => "timeout",
            LlmError::Parse { .. } => "parse",
            LlmError::StructuredOutput { .. } => "structured_output",
            LlmError::UnknownProvider { .. } => "configuration",
            LlmError::Other { .. } => "other",
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout { seconds: 0 }
        } else {
            LlmError::Network {
                message: err.to_string(),
            }
        }
    }
}

/// Surfaces as a dependency failure so task results classify it as a
/// provider error
impl From<LlmError> for agent_relay_core::Error {
    fn from(err: LlmError) -> Self {
        agent_relay_core::Error::dependency("llm", err.to_string())
    }
}

/// Map a non-success HTTP status to a provider error
pub fn parse_http_error(status: u16, body: &str, provider: &str) -> LlmError {
    match status {
        401 => LlmError::AuthenticationFailed {
            message: format!("{}: Invalid API key", provider),
        },
        403 => LlmError::AuthenticationFailed {
            message: format!("{}: Access denied", provider),
        },
        404 => LlmError::ModelNotFound {
            model: body.to_string(),
        },
        429 => LlmError::RateLimited {
            message: body.to_string(),
        },
        400 | 422 => LlmError::InvalidRequest {
            message: body.to_string(),
        },
        500..=599 => LlmError::ServerError {
            status,
            message: body.to_string(),
        },
        _ => LlmError::Other {
            message: format!("HTTP {}: {}", status, body),
        },
    }
}

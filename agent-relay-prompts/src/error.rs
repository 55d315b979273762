//! Error types for prompt rendering

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PromptError {
    #[error("Template variable missing: {name}")]
    MissingVariable { name: String },

    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    #[error("Prompt not found: {name}")]
    PromptNotFound { name: String },

    #[error("Failed to read prompt file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience result type for prompt operations
pub type Result<T> = std::result::Result<T, PromptError>;

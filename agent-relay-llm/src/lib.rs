//! Generation providers for Agent Relay
//!
//! A [`GenerationService`] wraps a primary [`GenerationProvider`] in bounded
//! exponential retry and falls back to a secondary provider once when the
//! primary gives up. Structured requests append a schema instruction and
//! return a [`GenerationOutput`].

pub mod anthropic;
pub mod error;
pub mod openai;
pub mod provider;
pub mod retry;
pub mod service;
pub mod structured;

pub use error::{LlmError, Result};
pub use provider::{Generation, GenerationProvider, GenerationRequest};
pub use retry::RetryPolicy;
pub use service::{build_provider, GenerationService};
pub use structured::{GenerationOutput, StructuredGeneration};

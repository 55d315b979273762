//! Provider trait and request/response types

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single-turn generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    /// Provider default when unset
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask the backend for a JSON object reply when it supports it
    #[serde(default)]
    pub json_mode: bool,
}

impl GenerationRequest {
    pub fn new<S: Into<String>>(prompt: S) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            model: None,
            temperature: 0.7,
            max_tokens: 4096,
            json_mode: false,
        }
    }

    pub fn system_prompt<S: Into<String>>(mut self, system_prompt: S) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn json_mode(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

/// Text produced by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub tokens_used: u64,
    pub model: String,
    pub provider: String,
}

/// A generation backend
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Identifier used in configuration and logs
    fn name(&self) -> &str;

    fn default_model(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation>;
}

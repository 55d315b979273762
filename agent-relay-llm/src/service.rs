//! Generation service: primary provider with retry, then a single fallback
//! attempt

use crate::anthropic::AnthropicProvider;
use crate::error::{LlmError, Result};
use crate::openai::OpenAiProvider;
use crate::provider::{Generation, GenerationProvider, GenerationRequest};
use crate::retry::RetryPolicy;
use crate::structured::{with_schema_instruction, StructuredGeneration};
use agent_relay_core::config::{LlmSettings, ProviderSettings};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Build a provider client from its configuration entry
pub fn build_provider(
    name: &str,
    settings: &ProviderSettings,
    timeout: Duration,
) -> Result<Arc<dyn GenerationProvider>> {
    let api_key = settings.resolve_api_key();
    match settings.kind.as_str() {
        "openai" => {
            let mut provider = OpenAiProvider::new(name, settings.default_model.clone(), api_key)
                .with_timeout(timeout);
            if let Some(base_url) = &settings.base_url {
                provider = provider.with_base_url(base_url.clone());
            }
            Ok(Arc::new(provider))
        }
        "anthropic" => {
            let mut provider =
                AnthropicProvider::new(settings.default_model.clone(), api_key).with_timeout(timeout);
            if let Some(base_url) = &settings.base_url {
                provider = provider.with_base_url(base_url.clone());
            }
            Ok(Arc::new(provider))
        }
        other => Err(LlmError::UnknownProvider {
            name: format!("{} (kind '{}')", name, other),
        }),
    }
}

pub struct GenerationService {
    primary: Arc<dyn GenerationProvider>,
    fallback: Option<Arc<dyn GenerationProvider>>,
    retry: RetryPolicy,
    temperature: f32,
    max_tokens: u32,
}

impl GenerationService {
    pub fn new(primary: Arc<dyn GenerationProvider>) -> Self {
        Self {
            primary,
            fallback: None,
            retry: RetryPolicy::default(),
            temperature: 0.7,
            max_tokens: 4096,
        }
    }

    /// Build the configured primary and fallback providers
    pub fn from_settings(settings: &LlmSettings) -> Result<Self> {
        let timeout = Duration::from_secs(settings.request_timeout_seconds);
        let lookup = |name: &str| {
            settings
                .providers
                .get(name)
                .ok_or_else(|| LlmError::UnknownProvider {
                    name: name.to_string(),
                })
                .and_then(|provider| build_provider(name, provider, timeout))
        };

        let mut service = Self::new(lookup(&settings.default_provider)?)
            .with_retry_policy(RetryPolicy::from(&settings.retry));
        service.temperature = settings.temperature;
        service.max_tokens = settings.max_tokens;

        if let Some(fallback) = settings
            .fallback_provider
            .as_deref()
            .filter(|name| *name != settings.default_provider)
        {
            service = service.with_fallback(lookup(fallback)?);
        }
        Ok(service)
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn GenerationProvider>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn primary_name(&self) -> &str {
        self.primary.name()
    }

    pub fn fallback_name(&self) -> Option<&str> {
        self.fallback.as_deref().map(|p| p.name())
    }

    /// Request carrying the configured temperature and token limit
    pub fn request<S: Into<String>>(&self, prompt: S) -> GenerationRequest {
        GenerationRequest::new(prompt)
            .temperature(self.temperature)
            .max_tokens(self.max_tokens)
    }

    pub async fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        let primary_error = match self.generate_with_retry(request).await {
            Ok(generation) => return Ok(generation),
            Err(e) => e,
        };

        let Some(fallback) = &self.fallback else {
            return Err(primary_error);
        };
        warn!(
            primary = %self.primary.name(),
            fallback = %fallback.name(),
            error = %primary_error,
            "Primary provider failed, attempting fallback"
        );

        // Model names are provider-specific
        let mut request = request.clone();
        request.model = None;
        let generation = fallback.generate(&request).await?;
        info!(provider = %fallback.name(), tokens = generation.tokens_used, "Fallback generation succeeded");
        Ok(generation)
    }

    async fn generate_with_retry(&self, request: &GenerationRequest) -> Result<Generation> {
        let attempts = self.retry.attempts();
        let mut attempt = 1;
        loop {
            match self.primary.generate(request).await {
                Ok(generation) => return Ok(generation),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        provider = %self.primary.name(),
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Generation failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Generate a JSON document matching `schema`
    ///
    /// Replies that do not parse come back as
    /// [`GenerationOutput::Unparsed`](crate::GenerationOutput::Unparsed).
    pub async fn generate_structured(
        &self,
        request: &GenerationRequest,
        schema: &Value,
    ) -> Result<StructuredGeneration> {
        let mut request = request.clone();
        request.prompt = with_schema_instruction(&request.prompt, schema);
        request.json_mode = true;
        let generation = self.generate(&request).await?;
        Ok(StructuredGeneration::from_generation(generation))
    }
}

impl std::fmt::Debug for GenerationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationService")
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback_name())
            .field("retry", &self.retry)
            .finish()
    }
}

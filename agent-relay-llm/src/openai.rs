//! OpenAI-compatible chat completions
//!
//! Also serves Perplexity, Gemini's compatibility endpoint and any other
//! backend that speaks the same protocol through `base_url`.

use crate::error::{parse_http_error, LlmError, Result};
use crate::provider::{Generation, GenerationProvider, GenerationRequest};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new<S1, S2>(name: S1, default_model: S2, api_key: Option<String>) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            name: name.into(),
            base_url: OPENAI_API_BASE.to_string(),
            api_key,
            default_model: default_model.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_request_body(&self, request: &GenerationRequest) -> serde_json::Value {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.default_model),
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if request.json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }
}

#[async_trait]
impl GenerationProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| LlmError::missing_api_key(&self.name))?;

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&self.build_request_body(request))
            .send()
            .await?;

        let status = response.status().as_u16();
        let body_text = response.text().await?;
        if !(200..300).contains(&status) {
            return Err(parse_http_error(status, &body_text, &self.name));
        }

        let parsed: ChatCompletion = serde_json::from_str(&body_text)
            .map_err(|e| LlmError::parse(format!("Failed to parse response: {}", e)))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::parse("Response contained no message content"))?;
        let tokens_used = parsed.usage.map(|u| u.total_tokens).unwrap_or(0);

        debug!(provider = %self.name, model = %parsed.model, tokens = tokens_used, "Generation complete");
        Ok(Generation {
            text,
            tokens_used,
            model: parsed.model,
            provider: self.name.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    model: String,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: u64,
}

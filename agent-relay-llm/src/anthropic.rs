//! Anthropic messages API

use crate::error::{parse_http_error, LlmError, Result};
use crate::provider::{Generation, GenerationProvider, GenerationRequest};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new<S: Into<String>>(default_model: S, api_key: Option<String>) -> Self {
        Self {
            base_url: ANTHROPIC_API_BASE.to_string(),
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

    fn build_request_body(&self, request: &GenerationRequest) -> serde_json::Value {
        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.default_model),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{ "role": "user", "content": request.prompt }],
        });
        if let Some(system) = &request.system_prompt {
            body["system"] = json!(system);
        }
        body
    }
}

#[async_trait]
impl GenerationProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| LlmError::missing_api_key("anthropic"))?;

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.build_request_body(request))
            .send()
            .await?;

        let status = response.status().as_u16();
        let body_text = response.text().await?;
        if !(200..300).contains(&status) {
            return Err(parse_http_error(status, &body_text, "anthropic"));
        }

        let parsed: MessagesResponse = serde_json::from_str(&body_text)
            .map_err(|e| LlmError::parse(format!("Failed to parse response: {}", e)))?;
        let text: String = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();
        let tokens_used = parsed.usage.input_tokens + parsed.usage.output_tokens;

        debug!(provider = "anthropic", model = %parsed.model, tokens = tokens_used, "Generation complete");
        Ok(Generation {
            text,
            tokens_used,
            model: parsed.model,
            provider: "anthropic".to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: String,
    content: Vec<ContentBlock>,
    usage: MessagesUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_generate_joins_text_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "ak-test"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "claude-3-sonnet-20240229",
                "content": [
                    {"type": "text", "text": "Margins are "},
                    {"type": "text", "text": "expanding."}
                ],
                "usage": {"input_tokens": 40, "output_tokens": 12}
            })))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new("claude-3-sonnet-20240229", Some("ak-test".into()))
            .with_base_url(server.uri());
        let generation = provider
            .generate(&GenerationRequest::new("Assess margins").system_prompt("Be terse"))
            .await
            .unwrap();
        assert_eq!(generation.text, "Margins are expanding.");
        assert_eq!(generation.tokens_used, 52);
        assert_eq!(generation.provider, "anthropic");
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate_limit_error"))
            .mount(&server)
            .await;

        let provider =
            AnthropicProvider::new("claude", Some("ak".into())).with_base_url(server.uri());
        let err = provider.generate(&GenerationRequest::new("x")).await.unwrap_err();
        assert_matches!(err, LlmError::RateLimited { .. });
    }

    #[test]
    fn test_system_prompt_is_top_level() {
        let provider = AnthropicProvider::new("claude", None);
        let body = provider.build_request_body(&GenerationRequest::new("q").system_prompt("sys"));
        assert_eq!(body["system"], "sys");
        assert_eq!(body["messages"][0]["role"], "user");
    }
}

//! Process-wide settings
//!
//! Settings are layered: built-in defaults, then the optional
//! `config/default` and `config/local` files, then environment variables
//! prefixed with `AGENT_RELAY_` (nested keys separated by `__`, e.g.
//! `AGENT_RELAY_BROKER__CHANNEL_PREFIX`).

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub ledger: LedgerSettings,
    pub llm: LlmSettings,
    pub agent: AgentSettings,
    pub logging: LoggingSettings,
}

/// Channel fabric settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSettings {
    /// `memory` for an in-process broker, or `ws://host:port` for a relay hub
    pub url: String,
    pub channel_prefix: String,
    /// Per-channel buffer; slower subscribers lose the oldest messages
    pub channel_capacity: usize,
    /// Address the relay hub binds to
    pub relay_bind: String,
}

/// Task ledger settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerSettings {
    pub enabled: bool,
    pub database_url: String,
    pub max_connections: u32,
}

/// Generation service settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmSettings {
    pub default_provider: String,
    pub fallback_provider: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Advisory; left to the backend to enforce
    pub max_tokens_per_minute: u32,
    /// Advisory; left to the backend to enforce
    pub max_requests_per_minute: u32,
    pub request_timeout_seconds: u64,
    pub retry: RetrySettings,
    pub providers: HashMap<String, ProviderSettings>,
}

/// Retry schedule for the primary provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Connection details for one generation backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderSettings {
    /// Wire protocol: `openai` (chat completions) or `anthropic` (messages)
    pub kind: String,
    pub default_model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable consulted when `api_key` is unset
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl ProviderSettings {
    fn new(kind: &str, default_model: &str, base_url: Option<&str>, api_key_env: &str) -> Self {
        Self {
            kind: kind.to_string(),
            default_model: default_model.to_string(),
            base_url: base_url.map(str::to_string),
            api_key: None,
            api_key_env: Some(api_key_env.to_string()),
        }
    }

    /// Inline key first, then the configured environment variable
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.is_empty())
            .or_else(|| {
                self.api_key_env
                    .as_deref()
                    .and_then(|name| std::env::var(name).ok())
                    .filter(|key| !key.is_empty())
            })
    }
}

/// Worker, dispatcher and orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSettings {
    pub task_timeout_seconds: u64,
    pub cache_ttl_seconds: u64,
    pub cache_capacity: u64,
    /// Publish a cancellation message when a dispatch times out
    pub cancel_on_timeout: bool,
    pub max_parallel: usize,
    pub stale_task_seconds: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

impl Default for Settings {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert(
            "openai".to_string(),
            ProviderSettings::new("openai", "gpt-4-turbo-preview", None, "OPENAI_API_KEY"),
        );
        providers.insert(
            "anthropic".to_string(),
            ProviderSettings::new(
                "anthropic",
                "claude-3-sonnet-20240229",
                None,
                "ANTHROPIC_API_KEY",
            ),
        );
        providers.insert(
            "gemini".to_string(),
            ProviderSettings::new(
                "openai",
                "gemini-2.5-flash",
                Some("https://generativelanguage.googleapis.com/v1beta/openai"),
                "GEMINI_API_KEY",
            ),
        );
        providers.insert(
            "perplexity".to_string(),
            ProviderSettings::new(
                "openai",
                "sonar-pro",
                Some("https://api.perplexity.ai"),
                "PERPLEXITY_API_KEY",
            ),
        );

        Self {
            broker: BrokerSettings {
                url: "memory".to_string(),
                channel_prefix: "agent-relay".to_string(),
                channel_capacity: 1024,
                relay_bind: "127.0.0.1:7400".to_string(),
            },
            ledger: LedgerSettings {
                enabled: true,
                database_url: "sqlite:./agent_relay.db".to_string(),
                max_connections: 5,
            },
            llm: LlmSettings {
                default_provider: "openai".to_string(),
                fallback_provider: Some("anthropic".to_string()),
                temperature: 0.7,
                max_tokens: 4096,
                max_tokens_per_minute: 100_000,
                max_requests_per_minute: 60,
                request_timeout_seconds: 120,
                retry: RetrySettings {
                    max_attempts: 3,
                    base_delay_ms: 2_000,
                    max_delay_ms: 10_000,
                },
                providers,
            },
            agent: AgentSettings {
                task_timeout_seconds: 300,
                cache_ttl_seconds: 3_600,
                cache_capacity: 10_000,
                cancel_on_timeout: false,
                max_parallel: 8,
                stale_task_seconds: 3_600,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}

impl Settings {
    /// Load settings from the default locations and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load settings, reading `path` in addition to the default files
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&Settings::default())?;

        let mut builder = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false));

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix("AGENT_RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings that would make dispatch impossible
    pub fn validate(&self) -> Result<()> {
        if self.broker.channel_prefix.trim().is_empty() {
            return Err(Error::configuration("broker.channel_prefix cannot be empty"));
        }
        if self.broker.channel_capacity == 0 {
            return Err(Error::configuration("broker.channel_capacity must be positive"));
        }
        if self.agent.task_timeout_seconds == 0 {
            return Err(Error::configuration(
                "agent.task_timeout_seconds must be positive",
            ));
        }
        if self.agent.max_parallel == 0 {
            return Err(Error::configuration("agent.max_parallel must be positive"));
        }
        if self.llm.retry.max_attempts == 0 {
            return Err(Error::configuration("llm.retry.max_attempts must be positive"));
        }
        if !self.llm.providers.contains_key(&self.llm.default_provider) {
            return Err(Error::configuration(format!(
                "llm.default_provider '{}' has no entry in llm.providers",
                self.llm.default_provider
            )));
        }
        if let Some(fallback) = &self.llm.fallback_provider {
            if !self.llm.providers.contains_key(fallback) {
                return Err(Error::configuration(format!(
                    "llm.fallback_provider '{}' has no entry in llm.providers",
                    fallback
                )));
            }
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.task_timeout_seconds)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.agent.cache_ttl_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();

        assert_eq!(settings.broker.channel_prefix, "agent-relay");
        assert_eq!(settings.agent.task_timeout_seconds, 300);
        assert_eq!(settings.llm.retry.max_attempts, 3);
        assert_eq!(settings.llm.default_provider, "openai");
        assert_eq!(settings.llm.fallback_provider.as_deref(), Some("anthropic"));
        assert!(!settings.agent.cancel_on_timeout);
    }

    #[test]
    fn test_validate_rejects_unknown_provider() {
        let mut settings = Settings::default();
        settings.llm.fallback_provider = Some("missing".to_string());
        assert!(settings.validate().unwrap_err().to_string().contains("missing"));
    }

    #[test]
    fn test_validate_rejects_empty_prefix() {
        let mut settings = Settings::default();
        settings.broker.channel_prefix = " ".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_uses_defaults() {
        let settings = Settings::load().unwrap();
        assert_eq!(settings.broker.url, "memory");
        assert_eq!(settings.agent.cache_ttl_seconds, 3_600);
    }

    #[test]
    #[serial]
    fn test_environment_override() {
        env::set_var("AGENT_RELAY_BROKER__CHANNEL_PREFIX", "research");
        env::set_var("AGENT_RELAY_AGENT__TASK_TIMEOUT_SECONDS", "45");

        let settings = Settings::load();

        env::remove_var("AGENT_RELAY_BROKER__CHANNEL_PREFIX");
        env::remove_var("AGENT_RELAY_AGENT__TASK_TIMEOUT_SECONDS");

        let settings = settings.unwrap();
        assert_eq!(settings.broker.channel_prefix, "research");
        assert_eq!(settings.task_timeout(), Duration::from_secs(45));
    }

    #[test]
    #[serial]
    fn test_resolve_api_key_prefers_inline() {
        env::set_var("AGENT_RELAY_TEST_KEY", "from-env");
        let mut provider = ProviderSettings::new("openai", "gpt", None, "AGENT_RELAY_TEST_KEY");
        assert_eq!(provider.resolve_api_key().as_deref(), Some("from-env"));

        provider.api_key = Some("inline".to_string());
        assert_eq!(provider.resolve_api_key().as_deref(), Some("inline"));
        env::remove_var("AGENT_RELAY_TEST_KEY");
    }
}

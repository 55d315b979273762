//! Logging setup

use crate::{Error, Result};
use agent_relay_core::config::LoggingSettings;
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry,
};

/// Install the global subscriber
///
/// `RUST_LOG` wins over the configured level. `format` is `pretty` or `json`.
pub fn init(settings: &LoggingSettings) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(&settings.level)))
        .map_err(|e| Error::configuration(format!("invalid log level '{}': {}", settings.level, e)))?;

    let registry = Registry::default().with(env_filter);
    let installed = match settings.format.as_str() {
        "json" => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true),
            )
            .try_init(),
        "pretty" | "text" => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
        other => {
            return Err(Error::configuration(format!(
                "unknown log format '{}'; expected 'pretty' or 'json'",
                other
            )))
        }
    };
    installed.map_err(|e| Error::configuration(format!("logging already initialised: {}", e)))
}

/// The configured level for our crates; dependencies stay at `warn`
fn default_directives(level: &str) -> String {
    format!(
        "warn,agent_relay={level},agent_relay_core={level},agent_relay_llm={level},\
         agent_relay_prompts={level},agent_relay_storage={level},agent_relay_server={level}",
        level = level
    )
}

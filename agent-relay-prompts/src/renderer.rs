//! Prompt template rendering

use crate::error::{PromptError, Result};
use crate::template::PromptTemplate;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use tracing::warn;

/// Renders `{{name}}` placeholders from a JSON object of variables
#[derive(Debug, Default, Clone, Copy)]
pub struct PromptRenderer;

impl PromptRenderer {
    pub fn new() -> Self {
        Self
    }

    /// Render a template, applying declared defaults for missing variables
    pub fn render(&self, prompt: &PromptTemplate, variables: &Map<String, Value>) -> Result<String> {
        let mut rendered = render_str(&prompt.template, variables);

        for variable in &prompt.variables {
            if variables.get(&variable.name).is_some_and(|v| !v.is_null()) {
                continue;
            }
            match &variable.default_value {
                Some(default) => {
                    rendered = rendered.replace(&placeholder(&variable.name), default);
                }
                None if variable.required => {
                    return Err(PromptError::MissingVariable {
                        name: variable.name.clone(),
                    });
                }
                None => {}
            }
        }

        let leftover = unreplaced(&rendered);
        if !leftover.is_empty() {
            warn!(prompt = %prompt.name, variables = ?leftover, "Template contains unreplaced variables");
        }
        Ok(rendered)
    }
}

/// Substitute every variable in `variables` into `template`
pub fn render_str(template: &str, variables: &Map<String, Value>) -> String {
    let mut rendered = template.to_string();
    for (name, value) in variables {
        let token = placeholder(name);
        if rendered.contains(&token) {
            rendered = rendered.replace(&token, &value_to_text(value));
        }
    }
    rendered
}

/// Strings verbatim, objects and arrays as indented JSON
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(_) | Value::Array(_) => {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        }
        other => other.to_string(),
    }
}

fn placeholder(name: &str) -> String {
    format!("{{{{{}}}}}", name)
}

fn placeholder_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").ok())
        .as_ref()
}

/// Names of placeholders still present in `text`
pub fn unreplaced(text: &str) -> Vec<String> {
    placeholder_pattern()
        .map(|pattern| {
            pattern
                .captures_iter(text)
                .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
                .collect()
        })
        .unwrap_or_default()
}

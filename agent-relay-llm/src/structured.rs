//! Structured (JSON) output handling

use crate::error::LlmError;
use crate::provider::Generation;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::OnceLock;

/// Reply to a structured request: a parsed JSON document, or the raw text
/// when the model did not produce one
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutput {
    Parsed(Value),
    Unparsed(String),
}

impl GenerationOutput {
    pub fn from_text(text: &str) -> Self {
        match serde_json::from_str::<Value>(extract_json(text)) {
            Ok(document) => GenerationOutput::Parsed(document),
            Err(_) => GenerationOutput::Unparsed(text.to_string()),
        }
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, GenerationOutput::Parsed(_))
    }

    /// The document, or a typed error carrying the raw text
    pub fn into_document(self) -> Result<Value, LlmError> {
        match self {
            GenerationOutput::Parsed(document) => Ok(document),
            GenerationOutput::Unparsed(raw) => Err(LlmError::StructuredOutput {
                message: "reply is not a JSON document".to_string(),
                raw,
            }),
        }
    }

    /// Deserialize the document into `T`
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T, LlmError> {
        let document = self.into_document()?;
        let raw = document.to_string();
        serde_json::from_value(document).map_err(|e| LlmError::StructuredOutput {
            message: e.to_string(),
            raw,
        })
    }

    /// The document, or the raw text wrapped as an analysis
    pub fn into_value_lossy(self) -> Value {
        match self {
            GenerationOutput::Parsed(document) => document,
            GenerationOutput::Unparsed(raw) => json!({ "analysis": raw, "raw_response": true }),
        }
    }
}

/// Structured reply together with usage details
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredGeneration {
    pub output: GenerationOutput,
    pub tokens_used: u64,
    pub model: String,
    pub provider: String,
}

impl StructuredGeneration {
    pub fn from_generation(generation: Generation) -> Self {
        Self {
            output: GenerationOutput::from_text(&generation.text),
            tokens_used: generation.tokens_used,
            model: generation.model,
            provider: generation.provider,
        }
    }
}

/// Append the schema instruction to a prompt
pub fn with_schema_instruction(prompt: &str, schema: &Value) -> String {
    let schema = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    format!(
        "{}\n\nPlease respond with a valid JSON object that matches this schema:\n```json\n{}\n```\n\nRespond ONLY with the JSON object, no additional text.",
        prompt, schema
    )
}

fn fence_pattern() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\r?\n?(.*?)```").ok())
        .as_ref()
}

/// Body of the first fenced block, preferring a ```json fence; the whole
/// text when there is none
pub fn extract_json(text: &str) -> &str {
    if let Some(start) = text.find("```json") {
        let body = &text[start + "```json".len()..];
        let end = body.find("```").unwrap_or(body.len());
        return body[..end].trim();
    }
    match fence_pattern()
        .and_then(|fence| fence.captures(text))
        .and_then(|c| c.get(1))
    {
        Some(body) => body.as_str().trim(),
        None => text.trim(),
    }
}

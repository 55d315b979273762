//! In-process prompt library

use crate::error::{PromptError, Result};
use crate::renderer::{render_str, PromptRenderer};
use crate::template::PromptTemplate;
use crate::templates;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Operation templates keyed by name, plus per-category system prompts
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    prompts: HashMap<String, PromptTemplate>,
    system_prompts: HashMap<String, String>,
    renderer: PromptRenderer,
}

impl PromptLibrary {
    /// A library with the built-in system prompts and no operation templates
    pub fn new() -> Self {
        let system_prompts = templates::CATEGORIES
            .iter()
            .filter_map(|category| {
                templates::system_prompt(category).map(|text| (category.to_string(), text.to_string()))
            })
            .collect();
        Self {
            prompts: HashMap::new(),
            system_prompts,
            renderer: PromptRenderer::new(),
        }
    }

    /// Add or replace an operation template
    pub fn register(&mut self, prompt: PromptTemplate) -> Result<()> {
        prompt.validate()?;
        debug!(prompt = %prompt.name, category = %prompt.category, "Registered prompt template");
        self.prompts.insert(prompt.name.clone(), prompt);
        Ok(())
    }

    /// Override the system prompt of a category
    pub fn set_system_prompt<C: Into<String>, S: Into<String>>(&mut self, category: C, prompt: S) {
        self.system_prompts.insert(category.into(), prompt.into());
    }

    /// Load a JSON array of templates; returns how many were registered
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let prompts: Vec<PromptTemplate> = serde_json::from_str(&content)?;
        let count = prompts.len();
        for prompt in prompts {
            self.register(prompt)?;
        }
        info!(path = %path.as_ref().display(), count, "Loaded prompt templates");
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Option<&PromptTemplate> {
        self.prompts.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.prompts.contains_key(name)
    }

    /// Template names in a category, sorted
    pub fn names_in_category(&self, category: &str) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .prompts
            .values()
            .filter(|p| p.category == category)
            .map(|p| p.name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    /// System prompt for `category`, falling back to the idea generation
    /// prompt
    pub fn system_prompt(&self, category: &str) -> &str {
        self.system_prompts
            .get(category)
            .or_else(|| self.system_prompts.get(templates::DEFAULT_CATEGORY))
            .map(String::as_str)
            .unwrap_or(templates::IDEA_GENERATION_SYSTEM)
    }

    /// Render a registered template by name
    pub fn render(&self, name: &str, variables: &Map<String, Value>) -> Result<String> {
        let prompt = self.get(name).ok_or_else(|| PromptError::PromptNotFound {
            name: name.to_string(),
        })?;
        self.renderer.render(prompt, variables)
    }

    /// The prompt for an operation: its registered template when there is
    /// one, otherwise the generic analysis template
    pub fn prompt_for(&self, operation_name: &str, input: &Map<String, Value>) -> Result<String> {
        if self.contains(operation_name) {
            self.render(operation_name, input)
        } else {
            Ok(generic_prompt(operation_name, input))
        }
    }
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self::new()
    }
}

/// Render the generic analysis template for an operation
pub fn generic_prompt(operation_name: &str, input: &Map<String, Value>) -> String {
    let input_json = serde_json::to_string_pretty(input).unwrap_or_else(|_| "{}".to_string());
    let mut variables = Map::new();
    variables.insert(
        "analysis_name".to_string(),
        Value::String(operation_name.replace('_', " ")),
    );
    variables.insert("input_json".to_string(), Value::String(input_json));
    render_str(templates::GENERIC_ANALYSIS_TEMPLATE, &variables)
}

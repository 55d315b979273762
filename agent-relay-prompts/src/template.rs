//! Prompt template definitions

use crate::error::{PromptError, Result};
use serde::{Deserialize, Serialize};

/// A declared template variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptVariable {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default_value: Option<String>,
}

impl PromptVariable {
    pub fn required<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            required: true,
            default_value: None,
        }
    }

    pub fn optional<S: Into<String>>(name: S) -> Self {
        Self {
            required: false,
            ..Self::required(name)
        }
    }

    pub fn with_default<S: Into<String>>(mut self, value: S) -> Self {
        self.default_value = Some(value.into());
        self
    }
}

/// A named `{{variable}}` template belonging to an agent category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub description: String,
    pub template: String,
    #[serde(default)]
    pub variables: Vec<PromptVariable>,
}

impl PromptTemplate {
    pub fn new<N, C, T>(name: N, category: C, template: T) -> Result<Self>
    where
        N: Into<String>,
        C: Into<String>,
        T: Into<String>,
    {
        let prompt = Self {
            name: name.into(),
            category: category.into(),
            description: String::new(),
            template: template.into(),
            variables: Vec::new(),
        };
        prompt.validate()?;
        Ok(prompt)
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_variable(mut self, variable: PromptVariable) -> Self {
        self.variables.retain(|v| v.name != variable.name);
        self.variables.push(variable);
        self
    }

    pub fn variable(&self, name: &str) -> Option<&PromptVariable> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PromptError::InvalidTemplate("name cannot be empty".to_string()));
        }
        if self.template.trim().is_empty() {
            return Err(PromptError::InvalidTemplate(format!(
                "template '{}' has no content",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(PromptTemplate::new("", "due_diligence", "x").is_err());
        assert!(PromptTemplate::new("overview", "due_diligence", "  ").is_err());
        let prompt = PromptTemplate::new("overview", "due_diligence", "Describe {{ticker}}")
            .unwrap()
            .with_variable(PromptVariable::required("ticker"))
            .with_variable(PromptVariable::optional("ticker").with_default("AAPL"));
        assert_eq!(prompt.variables.len(), 1);
        assert!(!prompt.variable("ticker").unwrap().required);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let prompt: PromptTemplate = serde_json::from_str(
            r#"{"name": "scan", "category": "idea_generation", "template": "Scan {{universe}}"}"#,
        )
        .unwrap();
        assert!(prompt.variables.is_empty());
        assert!(prompt.description.is_empty());
    }
}

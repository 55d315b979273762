//! Generation-backed operation handlers
//!
//! Every analysis operation follows the same shape: render the operation's
//! prompt from the task input, send it with the category's system prompt,
//! and return the reply as the task's data. Free-form replies that are not
//! JSON are kept as text under `analysis`; operations with an output schema
//! fail when the reply does not parse.

use agent_relay_core::worker::{HandlerOutput, OperationHandler, TaskContext};
use agent_relay_core::{Error, Result};
use agent_relay_llm::{GenerationOutput, GenerationService};
use agent_relay_prompts::PromptLibrary;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Analysis operation answered by the generation service
pub struct PromptOperationHandler {
    category: String,
    library: Arc<PromptLibrary>,
    generation: Arc<GenerationService>,
    required: Vec<&'static str>,
    schema: Option<Value>,
}

impl PromptOperationHandler {
    pub fn new<S: Into<String>>(
        category: S,
        library: Arc<PromptLibrary>,
        generation: Arc<GenerationService>,
    ) -> Self {
        Self {
            category: category.into(),
            library,
            generation,
            required: Vec::new(),
            schema: None,
        }
    }

    pub fn require(mut self, fields: &[&'static str]) -> Self {
        self.required = fields.to_vec();
        self
    }

    /// Ask for a JSON document matching `schema`
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    async fn generate(&self, ctx: &TaskContext) -> Result<HandlerOutput> {
        let prompt = self
            .library
            .prompt_for(ctx.operation_name(), ctx.input())
            .map_err(|e| Error::validation(e.to_string()))?;
        let request = self
            .generation
            .request(prompt)
            .system_prompt(self.library.system_prompt(&self.category));

        debug!(
            task_id = %ctx.task_id(),
            operation = %ctx.operation_name(),
            structured = self.schema.is_some(),
            "Requesting generation"
        );

        let (data, tokens_used, model) = match &self.schema {
            Some(schema) => {
                let generation = self.generation.generate_structured(&request, schema).await?;
                (
                    generation.output.into_document()?,
                    generation.tokens_used,
                    generation.model,
                )
            }
            None => {
                let generation = self.generation.generate(&request).await?;
                (
                    GenerationOutput::from_text(&generation.text).into_value_lossy(),
                    generation.tokens_used,
                    generation.model,
                )
            }
        };

        info!(
            task_id = %ctx.task_id(),
            operation = %ctx.operation_name(),
            tokens_used,
            model = %model,
            "Generation finished"
        );
        Ok(HandlerOutput::new(data).with_usage(tokens_used, model))
    }
}

#[async_trait]
impl OperationHandler for PromptOperationHandler {
    fn required_fields(&self) -> &[&str] {
        &self.required
    }

    async fn handle(&self, ctx: &TaskContext) -> Result<HandlerOutput> {
        ctx.check_cancelled()?;
        tokio::select! {
            _ = ctx.cancellation_token().cancelled() => {
                Err(Error::cancelled("Task cancelled during generation"))
            }
            output = self.generate(ctx) => output,
        }
    }
}

impl std::fmt::Debug for PromptOperationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptOperationHandler")
            .field("category", &self.category)
            .field("required", &self.required)
            .field("structured", &self.schema.is_some())
            .finish()
    }
}

//! Prompt templates for Agent Relay
//!
//! Provides `{{variable}}` rendering, a library of operation templates,
//! default system prompts per agent category and the generic analysis
//! template used for operations without a dedicated template.

pub mod error;
pub mod library;
pub mod renderer;
pub mod template;
pub mod templates;

pub use error::{PromptError, Result};
pub use library::{generic_prompt, PromptLibrary};
pub use renderer::PromptRenderer;
pub use template::{PromptTemplate, PromptVariable};

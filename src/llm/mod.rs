//! LLM integration.
//!
//! The repair loop only sees the [`Fixer`](crate::repair::Fixer) trait.
//! This module supplies the LLM-backed implementation: a provider trait for
//! chat completions, an OpenRouter provider, and [`LlmFixer`], which turns a
//! repair request into a prompt and the model's JSON answer into a proposal.
//!
//! ```ignore
//! use patchforge::llm::{LlmFixer, OpenRouterProvider};
//! use std::sync::Arc;
//!
//! let provider = Arc::new(OpenRouterProvider::new(api_key)?);
//! let primary = LlmFixer::new("primary", provider.clone(), "moonshotai/kimi-k2.5");
//! let secondary = LlmFixer::new("secondary", provider, "anthropic/claude-opus-4.5");
//! ```

pub mod fixer;
pub mod provider;
pub mod providers;

pub use fixer::{fixer_error, parse_proposal, LlmFixer, SYSTEM_PROMPT};
pub use provider::{Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, Usage};
pub use providers::OpenRouterProvider;

//! A [`Fixer`] backed by a chat-completion model.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::provider::{GenerationRequest, LlmProvider, Message};
use crate::error::LlmError;
use crate::repair::{FileOperation, FixProposal, FixUsage, Fixer, FixerError, RepairRequest};
use crate::utils::extract_json_object;

/// Instructions sent with every repair request.
pub const SYSTEM_PROMPT: &str = r#"You repair failing builds. You receive the tail of a failing verification run, a hint for the error category, fixes that worked for similar failures, and notes about earlier attempts on this job.

Respond with a single JSON object and nothing else:

{
  "summary": "one line describing the strategy, e.g. add left-pad to package.json dependencies",
  "operations": [
    {"path": "relative/path/to/file", "action": "create" | "modify" | "delete", "content": "full new file content"}
  ]
}

Rules:
- Paths are relative to the project root and must not contain "..".
- "content" is the complete file after your change, required for create and modify, omitted for delete.
- Change as little as possible. Do not delete or weaken tests to make them pass.
- Do not repeat a strategy listed as already failed."#;

/// Default sampling temperature for repair requests.
const DEFAULT_TEMPERATURE: f64 = 0.2;

/// Default completion budget; proposals carry whole files.
const DEFAULT_MAX_TOKENS: u32 = 16_384;

/// Fixer that asks an LLM for a JSON proposal.
pub struct LlmFixer {
    name: String,
    provider: Arc<dyn LlmProvider>,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl LlmFixer {
    pub fn new(name: impl Into<String>, provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider,
            model: model.into(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Fixer for LlmFixer {
    fn name(&self) -> &str {
        &self.name
    }

    /// Fixers sharing a provider share its rate limit.
    fn rate_limit_key(&self) -> &str {
        self.provider.name()
    }

    async fn submit(&self, request: &RepairRequest) -> Result<FixProposal, FixerError> {
        let generation = GenerationRequest::new(
            self.model.clone(),
            vec![Message::system(SYSTEM_PROMPT), Message::user(request.render())],
        )
        .with_temperature(self.temperature)
        .with_max_tokens(self.max_tokens);

        let response = self
            .provider
            .generate(generation)
            .await
            .map_err(fixer_error)?;

        let content = response
            .first_content()
            .ok_or_else(|| FixerError::Malformed("response has no choices".to_string()))?;

        let mut proposal = parse_proposal(content)?;
        proposal.usage = FixUsage {
            input_tokens: u64::from(response.usage.prompt_tokens),
            output_tokens: u64::from(response.usage.completion_tokens),
            cost_usd: response.usage.cost,
            model: Some(response.model.clone()),
        };

        tracing::debug!(
            fixer = %self.name,
            model = %response.model,
            operations = proposal.operations.len(),
            input_tokens = proposal.usage.input_tokens,
            output_tokens = proposal.usage.output_tokens,
            "LLM proposal parsed"
        );
        Ok(proposal)
    }
}

#[derive(Debug, Deserialize)]
struct ProposalBody {
    summary: String,
    #[serde(default)]
    operations: Vec<FileOperation>,
}

/// Parses a model response into a proposal.
///
/// Any response that does not yield a non-empty summary and at least one
/// operation is malformed.
pub fn parse_proposal(content: &str) -> Result<FixProposal, FixerError> {
    let json = extract_json_object(content).map_err(|e| FixerError::Malformed(e.to_string()))?;
    let body: ProposalBody = serde_json::from_str(&json)
        .map_err(|e| FixerError::Malformed(format!("proposal does not match schema: {}", e)))?;

    let summary = body.summary.trim();
    if summary.is_empty() {
        return Err(FixerError::Malformed("proposal has an empty summary".to_string()));
    }
    if body.operations.is_empty() {
        return Err(FixerError::Malformed("proposal has no operations".to_string()));
    }

    Ok(FixProposal {
        summary: summary.to_string(),
        operations: body.operations,
        usage: FixUsage::default(),
    })
}

/// Maps provider errors onto the fixer's retry classes.
pub fn fixer_error(err: LlmError) -> FixerError {
    match err {
        LlmError::RateLimited { retry_after, .. } => FixerError::RateLimited { retry_after },
        LlmError::ParseError(msg) => FixerError::Malformed(msg),
        LlmError::EmptyResponse => FixerError::Malformed("LLM returned no choices".to_string()),
        e if e.is_transient() => FixerError::Transient(e.to_string()),
        e => FixerError::Fatal(e.to_string()),
    }
}

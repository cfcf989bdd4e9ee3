//! Error types shared across subsystems.
//!
//! Subsystem-specific errors live next to their code (`QueueError`,
//! `PatternError`, `RepairError`, ...). This module holds the errors of the
//! LLM client layer, which several modules consume.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during LLM API interactions.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: PATCHFORGE_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        /// Value of the `Retry-After` header, when present.
        retry_after: Option<Duration>,
    },

    #[error("Context length exceeded: {0}")]
    ContextLengthExceeded(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("LLM returned no choices")]
    EmptyResponse,
}

impl LlmError {
    /// Returns true for failures that may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RequestFailed(_) | LlmError::Timeout(_) | LlmError::RateLimited { .. } => {
                true
            }
            LlmError::ApiError { code, .. } => *code >= 500 || *code == 429,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LlmError::Timeout("30s".into()).is_transient());
        assert!(LlmError::RequestFailed("connection reset".into()).is_transient());
        assert!(LlmError::RateLimited {
            message: "slow down".into(),
            retry_after: None
        }
        .is_transient());
        assert!(LlmError::ApiError {
            code: 503,
            message: "unavailable".into()
        }
        .is_transient());

        assert!(!LlmError::ApiError {
            code: 401,
            message: "bad key".into()
        }
        .is_transient());
        assert!(!LlmError::ParseError("not json".into()).is_transient());
        assert!(!LlmError::MissingApiKey.is_transient());
    }
}

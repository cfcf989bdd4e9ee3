//! Fixer capability: turns a repair request into file operations.
//!
//! Two tiers sit behind the same trait so either can be swapped
//! independently (a cheaper primary model, a stronger secondary one).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::request::RepairRequest;
use crate::metrics::TokenUsage;

/// Which fixer is active in the escalation sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixerTier {
    Primary,
    Secondary,
}

impl FixerTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixerTier::Primary => "primary",
            FixerTier::Secondary => "secondary",
        }
    }
}

impl fmt::Display for FixerTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FixerTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(FixerTier::Primary),
            "secondary" => Ok(FixerTier::Secondary),
            other => Err(format!("unknown fixer tier '{}'", other)),
        }
    }
}

/// What to do with a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Create,
    Modify,
    Delete,
}

/// One file change proposed by a fixer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileOperation {
    /// Path relative to the job's working directory.
    pub path: String,
    pub action: FileAction,
    /// Full new file content. Required for create and modify.
    #[serde(default)]
    pub content: Option<String>,
}

impl FileOperation {
    pub fn create(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: FileAction::Create,
            content: Some(content.into()),
        }
    }

    pub fn modify(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: FileAction::Modify,
            content: Some(content.into()),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: FileAction::Delete,
            content: None,
        }
    }
}

/// Usage and cost reported alongside a proposal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Cost in USD, when the fixer knows it.
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub model: Option<String>,
}

impl FixUsage {
    pub fn tokens(&self) -> TokenUsage {
        TokenUsage::new(self.input_tokens, self.output_tokens)
    }
}

/// A fixer's answer to a repair request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixProposal {
    /// One-line description of the strategy; stored as the fix in the pattern store.
    pub summary: String,
    pub operations: Vec<FileOperation>,
    #[serde(default)]
    pub usage: FixUsage,
}

/// Errors returned by [`Fixer::submit`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FixerError {
    /// Network failure, timeout or server-side error. Safe to retry.
    #[error("Transient fixer failure: {0}")]
    Transient(String),

    /// The provider asked us to slow down.
    #[error("Fixer rate limited{}", .retry_after.map(|d| format!(" (retry after {:?})", d)).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    /// The response could not be turned into a proposal.
    #[error("Malformed fixer response: {0}")]
    Malformed(String),

    /// The request can never succeed (bad credentials, context too long, ...).
    #[error("Fixer failed: {0}")]
    Fatal(String),
}

impl FixerError {
    /// Transient errors are retried inside a single attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, FixerError::Transient(_) | FixerError::RateLimited { .. })
    }

    /// Short label used in metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            FixerError::Transient(_) => "transient",
            FixerError::RateLimited { .. } => "rate_limited",
            FixerError::Malformed(_) => "malformed",
            FixerError::Fatal(_) => "fatal",
        }
    }
}

/// Something that proposes file changes for a failing verification.
#[async_trait]
pub trait Fixer: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    /// Rate-limiter bucket this fixer draws from.
    fn rate_limit_key(&self) -> &str {
        self.name()
    }

    /// Proposes a fix for `request`.
    async fn submit(&self, request: &RepairRequest) -> Result<FixProposal, FixerError>;
}

/// The primary and secondary fixers.
#[derive(Clone)]
pub struct FixerSet {
    primary: Arc<dyn Fixer>,
    secondary: Arc<dyn Fixer>,
}

impl FixerSet {
    pub fn new(primary: Arc<dyn Fixer>, secondary: Arc<dyn Fixer>) -> Self {
        Self { primary, secondary }
    }

    /// Uses the same fixer for both tiers.
    pub fn single(fixer: Arc<dyn Fixer>) -> Self {
        Self {
            primary: Arc::clone(&fixer),
            secondary: fixer,
        }
    }

    pub fn get(&self, tier: FixerTier) -> &Arc<dyn Fixer> {
        match tier {
            FixerTier::Primary => &self.primary,
            FixerTier::Secondary => &self.secondary,
        }
    }
}

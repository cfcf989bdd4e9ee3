//! Terminal-outcome reporting to the ticket system.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::scheduler::{AttemptRecord, JobOutcome};

/// What the ticket system is told when a job finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalReport {
    pub job_id: i64,
    pub job_key: String,
    pub outcome: JobOutcome,
    pub attempts: u32,
    /// Tier of the last attempt, if any attempt ran.
    pub tier: Option<String>,
    pub summary: Option<String>,
    pub last_error: Option<String>,
    pub history: Vec<AttemptRecord>,
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Report delivery failed: {0}")]
    Delivery(String),
}

/// Receives terminal outcomes. Delivery failures never change the job's state.
#[async_trait]
pub trait OutcomeReporter: Send + Sync {
    async fn report(&self, report: &TerminalReport) -> Result<(), ReportError>;
}

/// Logs terminal outcomes.
#[derive(Debug, Clone, Default)]
pub struct TracingReporter;

#[async_trait]
impl OutcomeReporter for TracingReporter {
    async fn report(&self, report: &TerminalReport) -> Result<(), ReportError> {
        match report.outcome {
            JobOutcome::Done => info!(
                job_id = report.job_id,
                job_key = %report.job_key,
                attempts = report.attempts,
                tier = report.tier.as_deref().unwrap_or("none"),
                summary = report.summary.as_deref().unwrap_or(""),
                "Job done"
            ),
            JobOutcome::Failed => warn!(
                job_id = report.job_id,
                job_key = %report.job_key,
                attempts = report.attempts,
                tier = report.tier.as_deref().unwrap_or("none"),
                last_error = report.last_error.as_deref().unwrap_or(""),
                "Job failed"
            ),
        }
        Ok(())
    }
}

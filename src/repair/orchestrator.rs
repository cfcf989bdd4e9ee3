//! Bounded, escalating repair loop.
//!
//! For a claimed job the orchestrator runs verification and, while it fails,
//! classifies the failure, consults the pattern store, asks the current-tier
//! fixer for file changes, applies them and verifies again. The primary tier
//! is used for the first `primary_attempts` attempts and the secondary tier
//! after that. The job is declared failed once `max_attempts` attempts have
//! been consumed, counting attempts made under earlier claims.
//!
//! Each consumed attempt produces exactly one `attempt` event and each
//! finished job exactly one `terminal` event, so a job's history can be
//! rebuilt from its event log alone.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::fixer::{FixProposal, FixerError, FixerSet, FixerTier};
use super::report::{OutcomeReporter, TerminalReport, TracingReporter};
use super::request::{truncate_tail, Reflection, RepairRequest};
use super::verifier::{VerificationError, VerificationOutcome, Verifier};
use super::workspace::apply_operations;
use crate::categories::ErrorCategory;
use crate::metrics::{MetricsCollector, TokenUsage};
use crate::patterns::{error_signature, fingerprint, PatternStore};
use crate::ratelimit::{RateLimitError, RateLimiterRegistry};
use crate::scheduler::{
    event_kinds, AttemptRecord, AttemptResult, ClaimedJob, EventLevel, JobCompletion, JobOutcome,
    JobQueue, QueueError,
};

/// Repair loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Absolute attempt ceiling per job, regardless of tier.
    pub max_attempts: u32,
    /// Attempts made with the primary fixer before escalating.
    pub primary_attempts: u32,
    /// Retries of a transient fixer failure within one attempt.
    pub fixer_retries: u32,
    pub backoff_base_ms: u64,
    pub max_backoff_ms: u64,
    /// Characters of verification output kept in a repair request.
    pub output_tail_chars: usize,
    /// Pattern-store candidates attached to a repair request.
    pub lookup_limit: usize,
    /// Error lines kept when fingerprinting verification output.
    pub signature_lines: usize,
    /// How long a fixer call may wait for a rate-limiter token.
    pub rate_limit_timeout_secs: u64,
    pub tokens_per_request: u32,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            primary_attempts: 2,
            fixer_retries: 3,
            backoff_base_ms: 1000,
            max_backoff_ms: 30_000,
            output_tail_chars: 4000,
            lookup_limit: 3,
            signature_lines: 8,
            rate_limit_timeout_secs: 120,
            tokens_per_request: 1,
        }
    }
}

impl RepairConfig {
    /// Tier used for the 1-based `attempt`.
    pub fn tier_for_attempt(&self, attempt: u32) -> FixerTier {
        if attempt <= self.primary_attempts {
            FixerTier::Primary
        } else {
            FixerTier::Secondary
        }
    }

    /// Exponential backoff for the 0-based `retry`, capped at `max_backoff_ms`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.min(20);
        Duration::from_millis(
            self.backoff_base_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// What a repair job's payload must contain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairPayload {
    /// Working directory the verification command runs in.
    pub workdir: PathBuf,
    /// Description of the unit of work, passed to the fixer.
    #[serde(default)]
    pub task: Option<String>,
    /// Files already changed by whoever produced the working directory.
    #[serde(default)]
    pub changed_files: Vec<String>,
}

impl RepairPayload {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            task: None,
            changed_files: Vec::new(),
        }
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "workdir": self.workdir,
            "task": self.task,
            "changed_files": self.changed_files,
        })
    }
}

/// The terminal result of processing a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairReport {
    pub outcome: JobOutcome,
    pub attempts: u32,
    pub tier: Option<FixerTier>,
    pub summary: Option<String>,
    pub last_error: Option<String>,
    pub history: Vec<AttemptRecord>,
}

/// Infrastructure errors. The job is left claimed and should be released by
/// its owner, never failed. After [`RepairError::LockLost`] another worker
/// owns the job and nothing may be released.
#[derive(Debug, Error)]
pub enum RepairError {
    #[error("Verification could not run: {0}")]
    Verification(#[from] VerificationError),

    #[error("{tier} fixer unavailable after retries: {source}")]
    FixerUnavailable {
        tier: FixerTier,
        #[source]
        source: FixerError,
    },

    #[error("Rate limiter refused fixer call: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Lock on job {0} is no longer held by this worker")]
    LockLost(i64),
}

/// Result of submitting a request, after transient retries.
enum Submission {
    Proposal(FixProposal),
    Rejected(FixerError),
}

/// Drives claimed jobs to DONE or FAILED.
pub struct RepairOrchestrator {
    queue: JobQueue,
    patterns: PatternStore,
    fixers: FixerSet,
    verifier: Arc<dyn Verifier>,
    rate_limiter: Option<Arc<RateLimiterRegistry>>,
    reporter: Arc<dyn OutcomeReporter>,
    config: RepairConfig,
    metrics: MetricsCollector,
}

impl RepairOrchestrator {
    pub fn new(
        queue: JobQueue,
        patterns: PatternStore,
        fixers: FixerSet,
        verifier: Arc<dyn Verifier>,
        config: RepairConfig,
    ) -> Self {
        Self {
            queue,
            patterns,
            fixers,
            verifier,
            rate_limiter: None,
            reporter: Arc::new(TracingReporter),
            config,
            metrics: MetricsCollector::new(),
        }
    }

    /// Gates fixer calls through `registry`, keyed by each fixer's rate-limit key.
    pub fn with_rate_limiter(mut self, registry: Arc<RateLimiterRegistry>) -> Self {
        self.rate_limiter = Some(registry);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn OutcomeReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &RepairConfig {
        &self.config
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Runs the repair loop for a claimed job and finalizes it.
    ///
    /// On `Err` the job has not been finalized and is still claimed.
    pub async fn process(&self, job: &ClaimedJob) -> Result<RepairReport, RepairError> {
        let started = Instant::now();

        let payload: RepairPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(job_id = job.id, error = %e, "Invalid job payload");
                return self
                    .finalize(
                        job,
                        JobOutcome::Failed,
                        job.attempts,
                        None,
                        Some(format!("Invalid payload: {}", e)),
                        Vec::new(),
                        started,
                    )
                    .await;
            }
        };

        let mut history = self.queue.attempt_history(job.id).await?;
        let recorded = history.last().map(|r| r.attempt).unwrap_or(0);
        let mut attempts = job.attempts.max(recorded);

        let mut changed_files = payload.changed_files.clone();
        for file in history.iter().flat_map(|r| r.touched_files.iter()) {
            if !changed_files.contains(file) {
                changed_files.push(file.clone());
            }
        }

        info!(
            job_id = job.id,
            key = %job.key,
            attempts = attempts,
            workdir = %payload.workdir.display(),
            "Processing job"
        );

        let mut verification = self
            .verifier
            .verify(&payload.workdir, &changed_files)
            .await?;

        loop {
            if verification.passed {
                let summary = history
                    .last()
                    .filter(|r| r.result.is_success())
                    .and_then(|r| r.strategy.clone())
                    .unwrap_or_else(|| "Verification passed".to_string());
                return self
                    .finalize(
                        job,
                        JobOutcome::Done,
                        attempts,
                        Some(summary),
                        None,
                        history,
                        started,
                    )
                    .await;
            }

            if attempts >= self.config.max_attempts {
                let last_error = self.signature(&verification);
                info!(
                    job_id = job.id,
                    attempts = attempts,
                    "Attempt ceiling reached"
                );
                return self
                    .finalize(
                        job,
                        JobOutcome::Failed,
                        attempts,
                        None,
                        Some(last_error),
                        history,
                        started,
                    )
                    .await;
            }

            attempts += 1;
            let (record, next) = self
                .attempt(job, &payload, attempts, &verification, &history, &mut changed_files)
                .await?;

            let last_error = (!record.result.is_success()).then(|| record.error_excerpt.clone());
            if !self
                .queue
                .touch(
                    job.id,
                    &job.worker_id,
                    attempts,
                    last_error.as_deref(),
                    Some(&record.tier),
                )
                .await?
            {
                warn!(job_id = job.id, worker_id = %job.worker_id, "Lost job lock during repair");
                return Err(RepairError::LockLost(job.id));
            }
            self.record_attempt_event(job.id, &record).await?;

            history.push(record);
            if let Some(next) = next {
                verification = next;
            }
        }
    }

    /// Runs one attempt against the failing `verification`.
    ///
    /// Returns the attempt record and, when the fix was applied, the new
    /// verification outcome.
    async fn attempt(
        &self,
        job: &ClaimedJob,
        payload: &RepairPayload,
        attempt: u32,
        verification: &VerificationOutcome,
        history: &[AttemptRecord],
        changed_files: &mut Vec<String>,
    ) -> Result<(AttemptRecord, Option<VerificationOutcome>), RepairError> {
        let tier = self.config.tier_for_attempt(attempt);
        let signature = self.signature(verification);
        let category = ErrorCategory::classify(&signature);
        let fp = fingerprint(&signature);

        info!(
            job_id = job.id,
            attempt = attempt,
            tier = %tier,
            category = %category,
            "Starting repair attempt"
        );

        let candidates = match self.patterns.lookup(&signature, self.config.lookup_limit).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(job_id = job.id, error = %e, "Pattern lookup failed");
                Vec::new()
            }
        };
        self.metrics.record_pattern_lookup(
            candidates
                .first()
                .map(|c| c.match_kind.as_str())
                .unwrap_or("miss"),
        );

        let rejected = match self.patterns.get(&signature).await {
            Ok(pattern) => pattern.map(|p| p.rejected_fixes).unwrap_or_default(),
            Err(e) => {
                warn!(job_id = job.id, error = %e, "Pattern fetch failed");
                Vec::new()
            }
        };

        let request = RepairRequest {
            job_key: job.key.clone(),
            task: payload.task.clone(),
            attempt,
            max_attempts: self.config.max_attempts,
            tier,
            category,
            fingerprint: fp.clone(),
            failure_excerpt: truncate_tail(&verification.output, self.config.output_tail_chars),
            hint: category.hint().to_string(),
            candidates,
            reflection: Reflection::from_history(history, category, &rejected),
            changed_files: changed_files.clone(),
        };

        let mut record = AttemptRecord {
            attempt,
            tier: tier.as_str().to_string(),
            category: category.as_str().to_string(),
            fingerprint: fp,
            error_excerpt: signature.clone(),
            strategy: None,
            touched_files: Vec::new(),
            result: AttemptResult::FixerFailed,
            detail: None,
        };

        let proposal = match self.submit(tier, &request).await? {
            Submission::Proposal(proposal) => proposal,
            Submission::Rejected(err) => {
                record.result = match err {
                    FixerError::Malformed(_) => AttemptResult::Malformed,
                    _ => AttemptResult::FixerFailed,
                };
                record.detail = Some(err.to_string());
                self.finish_attempt(&record, &signature).await;
                return Ok((record, None));
            }
        };

        record.strategy = Some(proposal.summary.clone());

        let touched = match apply_operations(&payload.workdir, &proposal.operations).await {
            Ok(touched) => touched,
            Err(e) => {
                warn!(job_id = job.id, attempt = attempt, error = %e, "Could not apply proposal");
                record.result = AttemptResult::ApplyFailed;
                record.detail = Some(e.to_string());
                self.finish_attempt(&record, &signature).await;
                return Ok((record, None));
            }
        };
        for file in &touched {
            if !changed_files.contains(file) {
                changed_files.push(file.clone());
            }
        }
        record.touched_files = touched;

        let next = self
            .verifier
            .verify(&payload.workdir, changed_files.as_slice())
            .await?;
        record.result = if next.passed {
            AttemptResult::Passed
        } else {
            AttemptResult::VerificationFailed
        };
        if !next.passed {
            record.detail = Some(self.signature(&next));
        }

        self.finish_attempt(&record, &signature).await;
        Ok((record, Some(next)))
    }

    /// Submits `request` to the fixer for `tier`, retrying transient failures.
    async fn submit(
        &self,
        tier: FixerTier,
        request: &RepairRequest,
    ) -> Result<Submission, RepairError> {
        let fixer = self.fixers.get(tier);
        let mut retry = 0;

        loop {
            if let Some(limiter) = &self.rate_limiter {
                limiter
                    .acquire(
                        fixer.rate_limit_key(),
                        self.config.tokens_per_request,
                        true,
                        Duration::from_secs(self.config.rate_limit_timeout_secs),
                    )
                    .await?;
            }

            let start = Instant::now();
            let result = fixer.submit(request).await;
            let latency = start.elapsed().as_secs_f64();

            let err = match result {
                Ok(proposal) => {
                    self.metrics.record_fixer_request(
                        tier.as_str(),
                        "success",
                        latency,
                        proposal.usage.tokens(),
                    );
                    debug!(
                        fixer = fixer.name(),
                        tier = %tier,
                        operations = proposal.operations.len(),
                        "Fixer returned proposal"
                    );
                    return Ok(Submission::Proposal(proposal));
                }
                Err(err) => err,
            };

            self.metrics
                .record_fixer_request(tier.as_str(), err.kind(), latency, TokenUsage::default());

            if !err.is_transient() {
                warn!(fixer = fixer.name(), tier = %tier, error = %err, "Fixer rejected request");
                return Ok(Submission::Rejected(err));
            }
            if retry >= self.config.fixer_retries {
                return Err(RepairError::FixerUnavailable { tier, source: err });
            }

            let max = Duration::from_millis(self.config.max_backoff_ms);
            let delay = match &err {
                FixerError::RateLimited {
                    retry_after: Some(after),
                } => (*after).min(max),
                _ => self.config.backoff(retry),
            };
            warn!(
                fixer = fixer.name(),
                tier = %tier,
                retry = retry + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient fixer failure, backing off"
            );
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }

    /// Feeds an attempt's outcome to the pattern store and metrics.
    ///
    /// Pattern-store write failures are logged and swallowed.
    async fn finish_attempt(&self, record: &AttemptRecord, signature: &str) {
        self.metrics
            .record_attempt(&record.tier, record.result.as_str());

        let result = if record.result.is_success() {
            let fix = record.strategy.as_deref().unwrap_or_default();
            self.patterns
                .record_success(signature, fix, &record.touched_files)
                .await
        } else {
            self.patterns
                .record_failure(signature, record.strategy.as_deref())
                .await
        };

        if let Err(e) = result {
            warn!(
                fingerprint = %record.fingerprint,
                error = %e,
                "Pattern store write failed"
            );
        }
    }

    async fn record_attempt_event(&self, job_id: i64, record: &AttemptRecord) -> Result<(), RepairError> {
        let level = if record.result.is_success() {
            EventLevel::Info
        } else {
            EventLevel::Warn
        };
        let message = format!(
            "Attempt {} ({} tier, {}): {}",
            record.attempt, record.tier, record.category, record.result
        );
        self.queue
            .append_event(
                job_id,
                level,
                &message,
                &serde_json::json!({
                    "kind": event_kinds::ATTEMPT,
                    "record": record,
                }),
            )
            .await?;
        Ok(())
    }

    fn signature(&self, verification: &VerificationOutcome) -> String {
        let signature = error_signature(&verification.output, self.config.signature_lines);
        if signature.is_empty() {
            match verification.exit_code {
                Some(code) => format!("verification failed with exit code {} and no output", code),
                None => "verification failed with no output".to_string(),
            }
        } else {
            signature
        }
    }

    /// Writes the terminal state and event, then reports the outcome.
    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        job: &ClaimedJob,
        outcome: JobOutcome,
        attempts: u32,
        summary: Option<String>,
        last_error: Option<String>,
        history: Vec<AttemptRecord>,
        started: Instant,
    ) -> Result<RepairReport, RepairError> {
        let tier = history
            .last()
            .and_then(|r| r.tier.parse::<FixerTier>().ok());

        // complete() is not owner-gated; confirm the lock is still ours first.
        if !self
            .queue
            .touch(job.id, &job.worker_id, attempts, None, None)
            .await?
        {
            return Err(RepairError::LockLost(job.id));
        }

        let completion = JobCompletion {
            outcome,
            attempts,
            tier: tier.map(|t| t.as_str().to_string()),
            last_error: last_error.clone(),
            summary: summary.clone(),
            details: serde_json::json!({ "history": history }),
        };
        self.queue.complete(job.id, &completion).await?;

        self.metrics
            .record_job_finished(outcome.state().as_str(), started.elapsed().as_secs_f64());

        let report = TerminalReport {
            job_id: job.id,
            job_key: job.key.clone(),
            outcome,
            attempts,
            tier: completion.tier.clone(),
            summary: summary.clone(),
            last_error: last_error.clone(),
            history: history.clone(),
        };
        if let Err(e) = self.reporter.report(&report).await {
            warn!(job_id = job.id, error = %e, "Outcome report failed");
        }

        Ok(RepairReport {
            outcome,
            attempts,
            tier,
            summary,
            last_error,
            history,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_escalation() {
        let config = RepairConfig::default();
        assert_eq!(config.tier_for_attempt(1), FixerTier::Primary);
        assert_eq!(config.tier_for_attempt(2), FixerTier::Primary);
        assert_eq!(config.tier_for_attempt(3), FixerTier::Secondary);
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RepairConfig {
            backoff_base_ms: 100,
            max_backoff_ms: 1000,
            ..Default::default()
        };
        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(400));
        assert_eq!(config.backoff(10), Duration::from_millis(1000));
        assert_eq!(config.backoff(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_payload_defaults() {
        let payload: RepairPayload =
            serde_json::from_value(serde_json::json!({"workdir": "/tmp/x"})).unwrap();
        assert_eq!(payload, RepairPayload::new("/tmp/x"));

        let value = RepairPayload::new("/tmp/y").with_task("fix it").to_value();
        let back: RepairPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back.task.as_deref(), Some("fix it"));
    }

    #[test]
    fn test_config_partial_yaml() {
        let config: RepairConfig = serde_yaml::from_str("max_attempts: 5\n").unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.primary_attempts, 2);
    }
}

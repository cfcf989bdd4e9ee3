//! Metric collectors for patchforge operations.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics and keeps labeling
//! consistent. Every method is a no-op until `init_metrics()` has run.

use super::prometheus::{
    ACTIVE_WORKERS, FIXER_LATENCY, FIXER_REQUESTS_TOTAL, FIXER_TOKENS_TOTAL, JOBS_FINISHED_TOTAL,
    JOBS_IN_PROGRESS, JOB_DURATION, LOCKS_RECLAIMED_TOTAL, PATTERN_LOOKUPS_TOTAL, QUEUE_DEPTH,
    RATE_LIMIT_WAIT, REPAIR_ATTEMPTS_TOTAL,
};

/// Token usage reported by a fixer call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    /// Number of input/prompt tokens.
    pub input_tokens: u64,
    /// Number of output/completion tokens.
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Get the total number of tokens (input + output).
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Metrics collector for recording patchforge operational metrics.
///
/// # Example
///
/// ```ignore
/// use patchforge::metrics::{init_metrics, MetricsCollector, TokenUsage};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_attempt("primary", "verification_failed");
/// collector.record_fixer_request("primary", "success", 2.5, TokenUsage::new(1000, 500));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a job reaching a terminal state.
    ///
    /// * `outcome` - `done` or `failed`
    /// * `duration_secs` - time since the job was claimed
    pub fn record_job_finished(&self, outcome: &str, duration_secs: f64) {
        if let Some(total) = JOBS_FINISHED_TOTAL.get() {
            total.with_label_values(&[outcome]).inc();
        }

        if let Some(duration) = JOB_DURATION.get() {
            duration.with_label_values(&[outcome]).observe(duration_secs);
        }

        tracing::trace!(
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded job metric"
        );
    }

    /// Record one repair attempt.
    pub fn record_attempt(&self, tier: &str, result: &str) {
        if let Some(attempts) = REPAIR_ATTEMPTS_TOTAL.get() {
            attempts.with_label_values(&[tier, result]).inc();
        }
    }

    /// Record a fixer call.
    ///
    /// * `status` - `success`, `transient`, `malformed` or `fatal`
    /// * `latency_secs` - wall time of the call
    /// * `tokens` - usage reported by the fixer, zero if unknown
    pub fn record_fixer_request(&self, tier: &str, status: &str, latency_secs: f64, tokens: TokenUsage) {
        if let Some(requests) = FIXER_REQUESTS_TOTAL.get() {
            requests.with_label_values(&[tier, status]).inc();
        }

        if let Some(latency) = FIXER_LATENCY.get() {
            latency.with_label_values(&[tier]).observe(latency_secs);
        }

        if let Some(fixer_tokens) = FIXER_TOKENS_TOTAL.get() {
            fixer_tokens
                .with_label_values(&[tier, "input"])
                .inc_by(tokens.input_tokens as f64);
            fixer_tokens
                .with_label_values(&[tier, "output"])
                .inc_by(tokens.output_tokens as f64);
        }

        tracing::trace!(
            tier = tier,
            status = status,
            latency_secs = latency_secs,
            input_tokens = tokens.input_tokens,
            output_tokens = tokens.output_tokens,
            "Recorded fixer metric"
        );
    }

    /// Record time spent waiting for rate-limiter tokens.
    pub fn record_rate_limit_wait(&self, service: &str, wait_secs: f64) {
        if let Some(wait) = RATE_LIMIT_WAIT.get() {
            wait.with_label_values(&[service]).observe(wait_secs);
        }
    }

    /// Record a pattern lookup by its best match kind (`exact`, `category` or `miss`).
    pub fn record_pattern_lookup(&self, best_match: &str) {
        if let Some(lookups) = PATTERN_LOOKUPS_TOTAL.get() {
            lookups.with_label_values(&[best_match]).inc();
        }
    }

    /// Record stale locks returned to the queue.
    pub fn record_locks_reclaimed(&self, count: usize) {
        if let Some(reclaimed) = LOCKS_RECLAIMED_TOTAL.get() {
            reclaimed.inc_by(count as f64);
        }
    }

    /// Update the number of jobs in one queue state.
    pub fn update_queue_depth(&self, state: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[state]).set(depth as f64);
        }

        tracing::trace!(state = state, depth = depth, "Updated queue depth metric");
    }

    /// Update the count of active workers.
    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }

        tracing::trace!(count = count, "Updated active workers metric");
    }

    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}

//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by patchforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all patchforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs that reached a terminal state, labeled by outcome.
pub static JOBS_FINISHED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Time from claim to terminal state in seconds, labeled by outcome.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Jobs per queue state.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of jobs currently being processed.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Stale locks returned to the queue.
pub static LOCKS_RECLAIMED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Repair attempts, labeled by tier and result.
pub static REPAIR_ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Fixer calls, labeled by tier and status.
pub static FIXER_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Fixer call latency in seconds, labeled by tier.
pub static FIXER_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Tokens consumed by fixers, labeled by tier and type (input/output).
pub static FIXER_TOKENS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Time spent waiting on rate limiters in seconds, labeled by service.
pub static RATE_LIMIT_WAIT: OnceLock<HistogramVec> = OnceLock::new();

/// Pattern store lookups, labeled by best match kind (exact/category/miss).
pub static PATTERN_LOOKUPS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of active workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls are harmless: the statics keep the
/// metrics from the first successful call.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric creation or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Job metrics
    let jobs_finished_total = CounterVec::new(
        Opts::new("patchforge_jobs_finished_total", "Jobs that reached a terminal state"),
        &["outcome"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new(
            "patchforge_job_duration_seconds",
            "Time from claim to terminal state in seconds",
        )
        .buckets(vec![10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0]),
        &["outcome"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("patchforge_queue_depth", "Jobs per queue state"),
        &["state"],
    )?;

    let jobs_in_progress = Gauge::new(
        "patchforge_jobs_in_progress",
        "Number of jobs currently being processed",
    )?;

    let locks_reclaimed_total = Counter::new(
        "patchforge_locks_reclaimed_total",
        "Stale job locks returned to the queue",
    )?;

    // Repair metrics
    let repair_attempts_total = CounterVec::new(
        Opts::new("patchforge_repair_attempts_total", "Repair attempts"),
        &["tier", "result"],
    )?;

    let fixer_requests_total = CounterVec::new(
        Opts::new("patchforge_fixer_requests_total", "Fixer calls"),
        &["tier", "status"],
    )?;

    let fixer_latency = HistogramVec::new(
        HistogramOpts::new("patchforge_fixer_latency_seconds", "Fixer call latency in seconds")
            .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["tier"],
    )?;

    let fixer_tokens_total = CounterVec::new(
        Opts::new("patchforge_fixer_tokens_total", "Tokens consumed by fixers"),
        &["tier", "type"],
    )?;

    let rate_limit_wait = HistogramVec::new(
        HistogramOpts::new(
            "patchforge_rate_limit_wait_seconds",
            "Time spent waiting on rate limiters in seconds",
        )
        .buckets(vec![0.0, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        &["service"],
    )?;

    let pattern_lookups_total = CounterVec::new(
        Opts::new("patchforge_pattern_lookups_total", "Pattern store lookups"),
        &["match"],
    )?;

    // Worker metrics
    let active_workers = Gauge::new("patchforge_active_workers", "Number of active workers")?;

    registry.register(Box::new(jobs_finished_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(locks_reclaimed_total.clone()))?;
    registry.register(Box::new(repair_attempts_total.clone()))?;
    registry.register(Box::new(fixer_requests_total.clone()))?;
    registry.register(Box::new(fixer_latency.clone()))?;
    registry.register(Box::new(fixer_tokens_total.clone()))?;
    registry.register(Box::new(rate_limit_wait.clone()))?;
    registry.register(Box::new(pattern_lookups_total.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // Already-set statics mean a previous call won; keep those.
    let _ = REGISTRY.set(registry);
    let _ = JOBS_FINISHED_TOTAL.set(jobs_finished_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = LOCKS_RECLAIMED_TOTAL.set(locks_reclaimed_total);
    let _ = REPAIR_ATTEMPTS_TOTAL.set(repair_attempts_total);
    let _ = FIXER_REQUESTS_TOTAL.set(fixer_requests_total);
    let _ = FIXER_LATENCY.set(fixer_latency);
    let _ = FIXER_TOKENS_TOTAL.set(fixer_tokens_total);
    let _ = RATE_LIMIT_WAIT.set(rate_limit_wait);
    let _ = PATTERN_LOOKUPS_TOTAL.set(pattern_lookups_total);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

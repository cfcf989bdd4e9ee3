//! Worker pool that drives jobs from the SQLite queue through the repair loop.
//!
//! Each worker is an independent async task that claims a job, hands it to
//! the [`RepairOrchestrator`], and polls again. There is no central
//! dispatcher: workers coordinate only through `JobQueue::claim`.
//!
//! # Features
//!
//! - Configurable number of workers, named `worker-<prefix>-<i>`
//! - Graceful shutdown with broadcast channel
//! - Infrastructure failures release the job back to the queue
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics::MetricsCollector;
use crate::repair::{RepairError, RepairOrchestrator};

use super::job::{event_kinds, ClaimedJob, EventLevel, JobOutcome};
use super::queue::{JobQueue, QueueError};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Middle part of worker ids. A random one is generated when empty.
    pub worker_prefix: String,
    /// How long an idle worker sleeps before claiming again.
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// Lock age after which a claimed job is presumed abandoned.
    #[serde(with = "duration_millis")]
    pub stale_timeout: Duration,
    /// Maximum claimed jobs per resource key.
    pub resource_limit: u32,
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
    /// Stop each worker the first time it finds nothing to claim.
    pub exit_when_idle: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            worker_prefix: String::new(),
            poll_interval: Duration::from_secs(1),
            stale_timeout: Duration::from_secs(3600),
            resource_limit: 1,
            shutdown_timeout: Duration::from_secs(60),
            exit_when_idle: false,
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_worker_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_prefix = prefix.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = timeout;
        self
    }

    pub fn with_resource_limit(mut self, limit: u32) -> Self {
        self.resource_limit = limit;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_exit_when_idle(mut self, exit_when_idle: bool) -> Self {
        self.exit_when_idle = exit_when_idle;
        self
    }
}

/// Durations in config files are written as milliseconds.
mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub num_workers: usize,
    /// Workers currently processing a job.
    pub active_workers: usize,
    pub jobs_done: u64,
    pub jobs_failed: u64,
    /// Jobs handed back to the queue after an infrastructure error.
    pub jobs_released: u64,
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Jobs that reached a terminal state.
    pub fn total_finished(&self) -> u64 {
        self.jobs_done + self.jobs_failed
    }

    /// Share of finished jobs that ended DONE, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_finished();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_done as f64 / total as f64) * 100.0
    }
}

struct SharedPoolStats {
    jobs_done: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_released: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_done: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_released: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_outcome(&self, outcome: JobOutcome, duration: Duration) {
        match outcome {
            JobOutcome::Done => self.jobs_done.fetch_add(1, Ordering::SeqCst),
            JobOutcome::Failed => self.jobs_failed.fetch_add(1, Ordering::SeqCst),
        };
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_release(&self) {
        self.jobs_released.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let done = self.jobs_done.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let finished = done + failed;
        let average_job_duration = if finished > 0 {
            Duration::from_millis(total_duration_ms / finished)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            jobs_done: done,
            jobs_failed: failed,
            jobs_released: self.jobs_released.load(Ordering::SeqCst),
            average_job_duration,
        }
    }
}

/// Pool of workers sharing one queue and one orchestrator.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    orchestrator: Arc<RepairOrchestrator>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, orchestrator: Arc<RepairOrchestrator>) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            orchestrator,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Spawns all workers. They begin claiming immediately.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        let prefix = if self.config.worker_prefix.is_empty() {
            Uuid::new_v4().simple().to_string()[..8].to_string()
        } else {
            self.config.worker_prefix.clone()
        };

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}-{}", prefix, i),
                orchestrator: Arc::clone(&self.orchestrator),
                shutdown_rx: self.shutdown_tx.subscribe(),
                config: self.config.clone(),
                stats: Arc::clone(&self.stats),
            };
            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        self.is_running.store(true, Ordering::SeqCst);
        MetricsCollector::new().update_workers(self.config.num_workers);
        info!(
            num_workers = self.config.num_workers,
            prefix = %prefix,
            "Worker pool started"
        );
        Ok(())
    }

    /// Waits for every worker to exit on its own.
    ///
    /// Only returns early when workers run with `exit_when_idle` or are
    /// shut down from another task.
    pub async fn join(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }
        for handle in self.worker_handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        self.is_running.store(false, Ordering::SeqCst);
        MetricsCollector::new().update_workers(0);
        Ok(())
    }

    /// Signals all workers to stop and waits for in-flight jobs to finish.
    ///
    /// Workers never abandon a job mid-attempt; a job still running when the
    /// timeout expires keeps its lock until it goes stale.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        MetricsCollector::new().update_workers(0);

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// A single worker loop.
struct Worker {
    id: String,
    orchestrator: Arc<RepairOrchestrator>,
    shutdown_rx: broadcast::Receiver<()>,
    config: WorkerPoolConfig,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let claimed = self
                .queue()
                .claim(&self.id, self.config.resource_limit, self.config.stale_timeout)
                .await;

            match claimed {
                Ok(Some(job)) => {
                    self.process_job(job).await;
                    continue;
                }
                Ok(None) => {
                    debug!(worker_id = %self.id, "No jobs available");
                    if self.config.exit_when_idle {
                        break;
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to claim job");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.shutdown_rx.recv() => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    fn queue(&self) -> &JobQueue {
        self.orchestrator.queue()
    }

    async fn process_job(&self, job: ClaimedJob) {
        let start_time = Instant::now();
        let metrics = MetricsCollector::new();

        self.stats.increment_active();
        metrics.inc_jobs_in_progress();
        let result = self.orchestrator.process(&job).await;
        metrics.dec_jobs_in_progress();
        self.stats.decrement_active();

        let duration = start_time.elapsed();

        match result {
            Ok(report) => {
                self.stats.record_outcome(report.outcome, duration);
                info!(
                    worker_id = %self.id,
                    job_id = job.id,
                    outcome = %report.outcome,
                    attempts = report.attempts,
                    duration_ms = duration.as_millis() as u64,
                    "Job finished"
                );
            }
            Err(RepairError::LockLost(_)) => {
                // The lock belongs to whoever reclaimed the job; leave it alone.
                warn!(
                    worker_id = %self.id,
                    job_id = job.id,
                    duration_ms = duration.as_millis() as u64,
                    "Lost job lock, abandoning job"
                );
            }
            Err(e) => {
                self.stats.record_release();
                warn!(
                    worker_id = %self.id,
                    job_id = job.id,
                    error = %e,
                    "Repair interrupted, releasing job"
                );
                self.release(&job, &e.to_string()).await;
            }
        }
    }

    /// Hands `job` back to the queue and records why.
    async fn release(&self, job: &ClaimedJob, reason: &str) {
        match self.queue().release(job.id, &self.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(worker_id = %self.id, job_id = job.id, "Job no longer claimed by this worker");
                return;
            }
            Err(e) => {
                error!(worker_id = %self.id, job_id = job.id, error = %e, "Failed to release job");
                return;
            }
        }

        let metadata = serde_json::json!({
            "kind": event_kinds::RELEASED,
            "worker_id": self.id,
            "reason": reason,
        });
        if let Err(e) = self
            .queue()
            .append_event(job.id, EventLevel::Warn, "Job released after infrastructure error", &metadata)
            .await
        {
            warn!(worker_id = %self.id, job_id = job.id, error = %e, "Failed to record release");
        }
    }
}

//! SQLite-backed job queue with atomic claims.
//!
//! This module provides a durable job queue that supports:
//!
//! - Priority ordering (lower number first, then creation time, then id)
//! - Per-resource concurrency limits
//! - Crash recovery by reclaiming locks older than a timeout
//! - An append-only event log per job
//!
//! # Claim protocol
//!
//! `claim` runs inside one write transaction. Its first statement is the
//! stale-lock reclamation `UPDATE`, so the transaction holds SQLite's write
//! lock before it reads anything; concurrent claimers queue on the busy
//! timeout instead of racing. The claim itself is a conditional `UPDATE`
//! gated on `state = 'queued'`, and a returned row is the success signal.

use std::collections::BTreeMap;
use std::time::Duration;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use thiserror::Error;

use super::job::{
    event_kinds, AttemptRecord, ClaimedJob, EventLevel, Job, JobCompletion, JobEvent, JobOutcome,
    JobState, NewJob, Priority,
};
use crate::metrics::MetricsCollector;
use crate::storage::{from_millis, now_millis, Database};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Database operation failed.
    #[error("Database operation failed: {0}")]
    Database(#[from] sqlx::Error),

    /// Failed to serialize or deserialize job data.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Job not found in the queue.
    #[error("Job {0} not found")]
    JobNotFound(i64),

    /// The job is not currently claimed, so the transition is not allowed.
    #[error("Job {id} is not claimed (state: {state})")]
    NotClaimed { id: i64, state: JobState },

    /// A stored row could not be decoded.
    #[error("Invalid row: {0}")]
    InvalidRow(String),
}

/// Durable job queue.
#[derive(Clone)]
pub struct JobQueue {
    db: Database,
}

impl JobQueue {
    /// Creates a queue over an opened database.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the underlying database handle.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Enqueues a new job and returns its id.
    pub async fn enqueue(&self, job: NewJob) -> Result<i64, QueueError> {
        let payload = serde_json::to_string(&job.payload)?;
        let now = now_millis();

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (external_key, state, priority, resource_key, payload, created_at, updated_at)
            VALUES (?1, 'queued', ?2, ?3, ?4, ?5, ?5)
            "#,
        )
        .bind(&job.key)
        .bind(job.priority.as_i64())
        .bind(&job.resource_key)
        .bind(&payload)
        .bind(now)
        .execute(self.db.pool())
        .await?;

        let id = result.last_insert_rowid();
        tracing::debug!(
            job_id = id,
            key = %job.key,
            resource_key = %job.resource_key,
            priority = %job.priority,
            "Job enqueued"
        );
        Ok(id)
    }

    /// Claims the next eligible job for `worker_id`.
    ///
    /// Locks older than `stale_timeout` are first returned to `queued`. Among
    /// queued jobs whose resource key has fewer than `resource_limit` claimed
    /// jobs, the lowest priority number wins, then the earliest creation
    /// time, then the lowest id. A `resource_limit` of 0 is treated as 1.
    ///
    /// Returns `Ok(None)` when nothing is eligible.
    pub async fn claim(
        &self,
        worker_id: &str,
        resource_limit: u32,
        stale_timeout: Duration,
    ) -> Result<Option<ClaimedJob>, QueueError> {
        let now = now_millis();
        let cutoff = now.saturating_sub(stale_timeout.as_millis() as i64);
        let limit = i64::from(resource_limit.max(1));

        let mut tx = self.db.pool().begin().await?;

        let reclaimed = Self::reclaim_stale_locks(&mut tx, now, cutoff).await?;
        for job_id in &reclaimed {
            Self::insert_event(
                &mut tx,
                *job_id,
                EventLevel::Warn,
                "Stale lock reclaimed; job returned to queue",
                &serde_json::json!({
                    "kind": event_kinds::LOCK_RECLAIMED,
                    "stale_timeout_ms": stale_timeout.as_millis() as u64,
                }),
            )
            .await?;
        }

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'claimed', lock_owner = ?1, locked_at = ?2, updated_at = ?2
            WHERE state = 'queued' AND id = (
                SELECT j.id FROM jobs j
                WHERE j.state = 'queued'
                  AND (
                      SELECT COUNT(*) FROM jobs c
                      WHERE c.resource_key = j.resource_key AND c.state = 'claimed'
                  ) < ?3
                ORDER BY j.priority ASC, j.created_at ASC, j.id ASC
                LIMIT 1
            )
            RETURNING id, external_key, resource_key, payload, priority, attempts
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(limit)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        if !reclaimed.is_empty() {
            MetricsCollector::new().record_locks_reclaimed(reclaimed.len());
            tracing::warn!(
                worker_id = worker_id,
                reclaimed = ?reclaimed,
                "Reclaimed stale job locks"
            );
        }

        let Some(row) = row else {
            return Ok(None);
        };

        let payload: String = row.get("payload");
        let claimed = ClaimedJob {
            id: row.get("id"),
            key: row.get("external_key"),
            resource_key: row.get("resource_key"),
            payload: serde_json::from_str(&payload)?,
            priority: Priority::from_i64(row.get("priority")),
            attempts: row.get::<i64, _>("attempts").max(0) as u32,
            worker_id: worker_id.to_string(),
        };

        tracing::info!(
            worker_id = worker_id,
            job_id = claimed.id,
            key = %claimed.key,
            resource_key = %claimed.resource_key,
            "Job claimed"
        );
        Ok(Some(claimed))
    }

    /// Returns a claimed job to `queued` and clears its lock.
    ///
    /// Returns `false` if the job was not claimed by `worker_id`. A worker
    /// whose lock was reclaimed can never free the new owner's claim.
    pub async fn release(&self, job_id: i64, worker_id: &str) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'queued', lock_owner = NULL, locked_at = NULL, updated_at = ?1
            WHERE id = ?2 AND state = 'claimed' AND lock_owner = ?3
            "#,
        )
        .bind(now_millis())
        .bind(job_id)
        .bind(worker_id)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Moves a claimed job to its terminal state and writes final attributes.
    ///
    /// The state change and the job's single `terminal` event are written in
    /// one transaction.
    pub async fn complete(&self, job_id: i64, completion: &JobCompletion) -> Result<(), QueueError> {
        let now = now_millis();
        let mut tx = self.db.pool().begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?1, lock_owner = NULL, locked_at = NULL,
                finished_at = ?2, updated_at = ?2,
                attempts = ?3,
                tier = COALESCE(?4, tier),
                last_error = COALESCE(?5, last_error),
                summary = ?6
            WHERE id = ?7 AND state = 'claimed'
            "#,
        )
        .bind(completion.outcome.state().as_str())
        .bind(now)
        .bind(i64::from(completion.attempts))
        .bind(&completion.tier)
        .bind(&completion.last_error)
        .bind(&completion.summary)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.transition_error(job_id).await);
        }

        let (level, message) = match completion.outcome {
            JobOutcome::Done => (EventLevel::Info, "Job finished: done"),
            JobOutcome::Failed => (EventLevel::Error, "Job finished: failed"),
        };
        Self::insert_event(
            &mut tx,
            job_id,
            level,
            message,
            &serde_json::json!({
                "kind": event_kinds::TERMINAL,
                "outcome": completion.outcome,
                "attempts": completion.attempts,
                "tier": completion.tier,
                "summary": completion.summary,
                "last_error": completion.last_error,
                "details": completion.details,
            }),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(job_id = job_id, outcome = %completion.outcome, "Job completed");
        Ok(())
    }

    /// Records progress on a claimed job and refreshes its lock timestamp.
    ///
    /// Returns `false` if `worker_id` no longer owns the lock (for example
    /// because it went stale and was reclaimed).
    pub async fn touch(
        &self,
        job_id: i64,
        worker_id: &str,
        attempts: u32,
        last_error: Option<&str>,
        tier: Option<&str>,
    ) -> Result<bool, QueueError> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET locked_at = ?1, updated_at = ?1, attempts = ?2,
                last_error = COALESCE(?3, last_error),
                tier = COALESCE(?4, tier)
            WHERE id = ?5 AND state = 'claimed' AND lock_owner = ?6
            "#,
        )
        .bind(now)
        .bind(i64::from(attempts))
        .bind(last_error)
        .bind(tier)
        .bind(job_id)
        .bind(worker_id)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Appends an event to a job's audit trail and returns the event id.
    pub async fn append_event(
        &self,
        job_id: i64,
        level: EventLevel,
        message: &str,
        metadata: &serde_json::Value,
    ) -> Result<i64, QueueError> {
        let mut conn = self.db.pool().acquire().await?;
        Self::insert_event(&mut conn, job_id, level, message, metadata).await
    }

    /// Fetches a job by id.
    pub async fn get_job(&self, job_id: i64) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(job_id)
            .fetch_optional(self.db.pool())
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// Lists jobs, optionally filtered by state, newest first.
    pub async fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: u32,
    ) -> Result<Vec<Job>, QueueError> {
        let rows = match state {
            Some(state) => {
                sqlx::query("SELECT * FROM jobs WHERE state = ?1 ORDER BY id DESC LIMIT ?2")
                    .bind(state.as_str())
                    .bind(i64::from(limit))
                    .fetch_all(self.db.pool())
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY id DESC LIMIT ?1")
                    .bind(i64::from(limit))
                    .fetch_all(self.db.pool())
                    .await?
            }
        };

        rows.iter().map(job_from_row).collect()
    }

    /// Returns a job's events in insertion order.
    pub async fn events(&self, job_id: i64) -> Result<Vec<JobEvent>, QueueError> {
        let rows = sqlx::query("SELECT * FROM job_events WHERE job_id = ?1 ORDER BY id")
            .bind(job_id)
            .fetch_all(self.db.pool())
            .await?;

        rows.iter().map(event_from_row).collect()
    }

    /// Returns a job's events whose metadata `kind` equals `kind`.
    pub async fn events_of_kind(&self, job_id: i64, kind: &str) -> Result<Vec<JobEvent>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM job_events
            WHERE job_id = ?1 AND json_extract(metadata, '$.kind') = ?2
            ORDER BY id
            "#,
        )
        .bind(job_id)
        .bind(kind)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    /// Rebuilds a job's attempt history from its `attempt` events.
    pub async fn attempt_history(&self, job_id: i64) -> Result<Vec<AttemptRecord>, QueueError> {
        self.events_of_kind(job_id, event_kinds::ATTEMPT)
            .await?
            .into_iter()
            .map(|event| {
                let record = event.metadata.get("record").cloned().ok_or_else(|| {
                    QueueError::InvalidRow(format!("attempt event {} has no record", event.id))
                })?;
                Ok(serde_json::from_value(record)?)
            })
            .collect()
    }

    /// Returns job counts by state and the queued backlog by priority.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut stats = QueueStats::default();

        let by_state: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(self.db.pool())
                .await?;
        for (state, count) in by_state {
            let count = count.max(0) as usize;
            match state.parse::<JobState>() {
                Ok(JobState::Queued) => stats.queued = count,
                Ok(JobState::Claimed) => stats.claimed = count,
                Ok(JobState::Done) => stats.done = count,
                Ok(JobState::Failed) => stats.failed = count,
                Err(e) => return Err(QueueError::InvalidRow(e)),
            }
        }

        let by_priority: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT priority, COUNT(*) FROM jobs WHERE state = 'queued' GROUP BY priority",
        )
        .fetch_all(self.db.pool())
        .await?;
        for (priority, count) in by_priority {
            *stats
                .queued_by_priority
                .entry(Priority::from_i64(priority))
                .or_default() += count.max(0) as usize;
        }

        let claimed_by_resource: Vec<(String, i64)> = sqlx::query_as(
            "SELECT resource_key, COUNT(*) FROM jobs WHERE state = 'claimed' GROUP BY resource_key",
        )
        .fetch_all(self.db.pool())
        .await?;
        stats.claimed_by_resource = claimed_by_resource
            .into_iter()
            .map(|(key, count)| (key, count.max(0) as usize))
            .collect();

        Ok(stats)
    }

    /// Returns the number of queued jobs.
    pub async fn depth(&self) -> Result<usize, QueueError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE state = 'queued'")
            .fetch_one(self.db.pool())
            .await?;
        Ok(count.max(0) as usize)
    }

    async fn reclaim_stale_locks(
        conn: &mut SqliteConnection,
        now: i64,
        cutoff: i64,
    ) -> Result<Vec<i64>, QueueError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            UPDATE jobs
            SET state = 'queued', lock_owner = NULL, locked_at = NULL, updated_at = ?1
            WHERE state = 'claimed' AND locked_at < ?2
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .fetch_all(&mut *conn)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn insert_event(
        conn: &mut SqliteConnection,
        job_id: i64,
        level: EventLevel,
        message: &str,
        metadata: &serde_json::Value,
    ) -> Result<i64, QueueError> {
        let metadata = serde_json::to_string(metadata)?;
        let result = sqlx::query(
            r#"
            INSERT INTO job_events (job_id, created_at, level, message, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(job_id)
        .bind(now_millis())
        .bind(level.as_str())
        .bind(message)
        .bind(&metadata)
        .execute(&mut *conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Explains why a guarded transition on `job_id` matched no row.
    async fn transition_error(&self, job_id: i64) -> QueueError {
        match self.get_job(job_id).await {
            Ok(Some(job)) => QueueError::NotClaimed {
                id: job_id,
                state: job.state,
            },
            Ok(None) => QueueError::JobNotFound(job_id),
            Err(e) => e,
        }
    }
}

/// Statistics about queue state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub queued: usize,
    pub claimed: usize,
    pub done: usize,
    pub failed: usize,
    /// Queued jobs per priority.
    pub queued_by_priority: BTreeMap<Priority, usize>,
    /// Claimed jobs per resource key.
    pub claimed_by_resource: BTreeMap<String, usize>,
}

impl QueueStats {
    /// Returns the total number of jobs in all states.
    pub fn total_jobs(&self) -> usize {
        self.queued + self.claimed + self.done + self.failed
    }
}

fn job_from_row(row: &SqliteRow) -> Result<Job, QueueError> {
    let state: String = row.get("state");
    let payload: String = row.get("payload");

    Ok(Job {
        id: row.get("id"),
        key: row.get("external_key"),
        state: state.parse().map_err(QueueError::InvalidRow)?,
        priority: Priority::from_i64(row.get("priority")),
        resource_key: row.get("resource_key"),
        payload: serde_json::from_str(&payload)?,
        lock_owner: row.get("lock_owner"),
        locked_at: row.get::<Option<i64>, _>("locked_at").map(from_millis),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
        finished_at: row.get::<Option<i64>, _>("finished_at").map(from_millis),
        last_error: row.get("last_error"),
        attempts: row.get::<i64, _>("attempts").max(0) as u32,
        tier: row.get("tier"),
        summary: row.get("summary"),
    })
}

fn event_from_row(row: &SqliteRow) -> Result<JobEvent, QueueError> {
    let level: String = row.get("level");
    let metadata: String = row.get("metadata");

    Ok(JobEvent {
        id: row.get("id"),
        job_id: row.get("job_id"),
        created_at: from_millis(row.get("created_at")),
        level: level.parse().map_err(QueueError::InvalidRow)?,
        message: row.get("message"),
        metadata: serde_json::from_str(&metadata)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const NO_STALE: Duration = Duration::from_secs(3600);

    async fn create_test_queue() -> (JobQueue, TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("queue.db"))
            .await
            .expect("open database");
        (JobQueue::new(db), dir)
    }

    fn create_test_job(key: &str, resource: &str, priority: Priority) -> NewJob {
        NewJob::new(key, serde_json::json!({ "key": key }))
            .with_resource_key(resource)
            .with_priority(priority)
    }

    #[tokio::test]
    async fn test_enqueue_and_get() {
        let (queue, _dir) = create_test_queue().await;
        let id = queue
            .enqueue(create_test_job("ISSUE-1", "repoA", Priority::High))
            .await
            .expect("enqueue");

        let job = queue.get_job(id).await.expect("get").expect("job exists");
        assert_eq!(job.key, "ISSUE-1");
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.priority, Priority::High);
        assert_eq!(job.resource_key, "repoA");
        assert_eq!(job.payload, serde_json::json!({ "key": "ISSUE-1" }));
        assert!(job.lock_owner.is_none());
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn test_claim_empty_queue_returns_none() {
        let (queue, _dir) = create_test_queue().await;
        let claimed = queue.claim("w1", 1, NO_STALE).await.expect("claim");
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_age() {
        let (queue, _dir) = create_test_queue().await;
        let low = queue
            .enqueue(create_test_job("low", "r1", Priority::Low))
            .await
            .unwrap();
        let normal_first = queue
            .enqueue(create_test_job("n1", "r2", Priority::Normal))
            .await
            .unwrap();
        let normal_second = queue
            .enqueue(create_test_job("n2", "r3", Priority::Normal))
            .await
            .unwrap();
        let critical = queue
            .enqueue(create_test_job("crit", "r4", Priority::Critical))
            .await
            .unwrap();

        let mut order = Vec::new();
        while let Some(job) = queue.claim("w1", 1, NO_STALE).await.unwrap() {
            order.push(job.id);
        }

        assert_eq!(order, vec![critical, normal_first, normal_second, low]);
    }

    #[tokio::test]
    async fn test_claim_sets_lock() {
        let (queue, _dir) = create_test_queue().await;
        let id = queue
            .enqueue(create_test_job("k", "repoA", Priority::Normal))
            .await
            .unwrap();

        let claimed = queue.claim("worker-7", 1, NO_STALE).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.worker_id, "worker-7");

        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Claimed);
        assert_eq!(job.lock_owner.as_deref(), Some("worker-7"));
        assert!(job.locked_at.is_some());
    }

    #[tokio::test]
    async fn test_resource_limit_blocks_same_key() {
        let (queue, _dir) = create_test_queue().await;
        let a1 = queue
            .enqueue(create_test_job("a1", "repoA", Priority::Normal))
            .await
            .unwrap();
        let a2 = queue
            .enqueue(create_test_job("a2", "repoA", Priority::Normal))
            .await
            .unwrap();
        let b1 = queue
            .enqueue(create_test_job("b1", "repoB", Priority::Low))
            .await
            .unwrap();

        let first = queue.claim("w1", 1, NO_STALE).await.unwrap().unwrap();
        assert_eq!(first.id, a1);

        // a2 shares repoA, so the lower-priority repoB job is next.
        let second = queue.claim("w2", 1, NO_STALE).await.unwrap().unwrap();
        assert_eq!(second.id, b1);

        assert!(queue.claim("w3", 1, NO_STALE).await.unwrap().is_none());

        queue
            .complete(a1, &JobCompletion::done(1, "ok"))
            .await
            .unwrap();
        let third = queue.claim("w3", 1, NO_STALE).await.unwrap().unwrap();
        assert_eq!(third.id, a2);
    }

    #[tokio::test]
    async fn test_resource_limit_above_one() {
        let (queue, _dir) = create_test_queue().await;
        for i in 0..3 {
            queue
                .enqueue(create_test_job(&format!("a{}", i), "repoA", Priority::Normal))
                .await
                .unwrap();
        }

        assert!(queue.claim("w1", 2, NO_STALE).await.unwrap().is_some());
        assert!(queue.claim("w2", 2, NO_STALE).await.unwrap().is_some());
        assert!(queue.claim("w3", 2, NO_STALE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_returns_job_to_queue() {
        let (queue, _dir) = create_test_queue().await;
        let id = queue
            .enqueue(create_test_job("k", "repoA", Priority::Normal))
            .await
            .unwrap();
        queue.claim("w1", 1, NO_STALE).await.unwrap().unwrap();

        // Only the owner can release.
        assert!(!queue.release(id, "w2").await.unwrap());
        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Claimed);
        assert_eq!(job.lock_owner.as_deref(), Some("w1"));

        assert!(queue.release(id, "w1").await.unwrap());
        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert!(job.lock_owner.is_none());
        assert!(job.locked_at.is_none());

        // Releasing an unclaimed job is a no-op.
        assert!(!queue.release(id, "w1").await.unwrap());

        let again = queue.claim("w2", 1, NO_STALE).await.unwrap().unwrap();
        assert_eq!(again.id, id);
    }

    #[tokio::test]
    async fn test_complete_writes_terminal_state() {
        let (queue, _dir) = create_test_queue().await;
        let id = queue
            .enqueue(create_test_job("k", "repoA", Priority::Normal))
            .await
            .unwrap();
        queue.claim("w1", 1, NO_STALE).await.unwrap().unwrap();

        let completion = JobCompletion::failed(3, "type error persists").with_tier("secondary");
        queue.complete(id, &completion).await.unwrap();

        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.lock_owner.is_none());
        assert!(job.locked_at.is_none());
        assert!(job.finished_at.is_some());
        assert_eq!(job.attempts, 3);
        assert_eq!(job.tier.as_deref(), Some("secondary"));
        assert_eq!(job.last_error.as_deref(), Some("type error persists"));

        let terminal = queue.events_of_kind(id, event_kinds::TERMINAL).await.unwrap();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].level, EventLevel::Error);
        assert_eq!(terminal[0].metadata["attempts"], 3);
        assert_eq!(terminal[0].metadata["outcome"], "failed");
    }

    #[tokio::test]
    async fn test_complete_requires_claim() {
        let (queue, _dir) = create_test_queue().await;
        let id = queue
            .enqueue(create_test_job("k", "repoA", Priority::Normal))
            .await
            .unwrap();

        let err = queue
            .complete(id, &JobCompletion::done(0, "nope"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::NotClaimed {
                state: JobState::Queued,
                ..
            }
        ));

        let err = queue
            .complete(9999, &JobCompletion::done(0, "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::JobNotFound(9999)));

        assert!(queue
            .events_of_kind(id, event_kinds::TERMINAL)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_terminal_job_is_never_reclaimed() {
        let (queue, _dir) = create_test_queue().await;
        let id = queue
            .enqueue(create_test_job("k", "repoA", Priority::Normal))
            .await
            .unwrap();
        queue.claim("w1", 1, NO_STALE).await.unwrap().unwrap();
        queue
            .complete(id, &JobCompletion::done(1, "fixed"))
            .await
            .unwrap();

        assert!(queue
            .claim("w2", 1, Duration::ZERO)
            .await
            .unwrap()
            .is_none());
        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Done);
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let (queue, _dir) = create_test_queue().await;
        let stale_timeout = Duration::from_millis(200);
        let id = queue
            .enqueue(create_test_job("J", "repoA", Priority::Normal))
            .await
            .unwrap();

        let first = queue.claim("W1", 1, stale_timeout).await.unwrap().unwrap();
        assert_eq!(first.id, id);
        assert!(queue.claim("W2", 1, stale_timeout).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(300)).await;

        let second = queue.claim("W2", 1, stale_timeout).await.unwrap().unwrap();
        assert_eq!(second.id, id);
        assert_eq!(second.worker_id, "W2");

        let reclaimed = queue
            .events_of_kind(id, event_kinds::LOCK_RECLAIMED)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].level, EventLevel::Warn);
    }

    #[tokio::test]
    async fn test_touch_refreshes_lock_for_owner_only() {
        let (queue, _dir) = create_test_queue().await;
        let id = queue
            .enqueue(create_test_job("k", "repoA", Priority::Normal))
            .await
            .unwrap();
        queue.claim("owner", 1, NO_STALE).await.unwrap().unwrap();

        assert!(queue
            .touch(id, "owner", 2, Some("still failing"), Some("primary"))
            .await
            .unwrap());
        assert!(!queue.touch(id, "intruder", 5, None, None).await.unwrap());

        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.as_deref(), Some("still failing"));
        assert_eq!(job.tier.as_deref(), Some("primary"));
    }

    #[tokio::test]
    async fn test_claim_reports_persisted_attempts() {
        let (queue, _dir) = create_test_queue().await;
        let id = queue
            .enqueue(create_test_job("k", "repoA", Priority::Normal))
            .await
            .unwrap();
        queue.claim("w1", 1, NO_STALE).await.unwrap().unwrap();
        queue.touch(id, "w1", 2, None, None).await.unwrap();
        queue.release(id, "w1").await.unwrap();

        let claimed = queue.claim("w2", 1, NO_STALE).await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 2);
    }

    #[tokio::test]
    async fn test_events_are_append_only_and_ordered() {
        let (queue, _dir) = create_test_queue().await;
        let id = queue
            .enqueue(create_test_job("k", "repoA", Priority::Normal))
            .await
            .unwrap();

        queue
            .append_event(id, EventLevel::Info, "first", &serde_json::json!({"kind": "attempt"}))
            .await
            .unwrap();
        queue
            .append_event(id, EventLevel::Error, "second", &serde_json::json!({"kind": "terminal"}))
            .await
            .unwrap();

        let events = queue.events(id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "first");
        assert_eq!(events[1].level, EventLevel::Error);

        let attempts = queue.events_of_kind(id, "attempt").await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].message, "first");
    }

    #[tokio::test]
    async fn test_attempt_history_decodes_records() {
        use crate::scheduler::job::AttemptResult;

        let (queue, _dir) = create_test_queue().await;
        let id = queue
            .enqueue(create_test_job("k", "repoA", Priority::Normal))
            .await
            .unwrap();

        for attempt in 1..=2u32 {
            let record = AttemptRecord {
                attempt,
                tier: "primary".to_string(),
                category: "type_error".to_string(),
                fingerprint: "f".repeat(64),
                error_excerpt: "TypeError".to_string(),
                strategy: Some(format!("strategy {}", attempt)),
                touched_files: vec!["src/a.ts".to_string()],
                result: AttemptResult::VerificationFailed,
                detail: None,
            };
            queue
                .append_event(
                    id,
                    EventLevel::Warn,
                    "attempt failed",
                    &serde_json::json!({ "kind": "attempt", "record": record }),
                )
                .await
                .unwrap();
        }
        queue
            .append_event(id, EventLevel::Info, "note", &serde_json::json!({}))
            .await
            .unwrap();

        let history = queue.attempt_history(id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].attempt, 1);
        assert_eq!(history[1].strategy.as_deref(), Some("strategy 2"));
    }

    #[tokio::test]
    async fn test_stats_breakdown() {
        let (queue, _dir) = create_test_queue().await;
        queue
            .enqueue(create_test_job("a", "r1", Priority::High))
            .await
            .unwrap();
        queue
            .enqueue(create_test_job("b", "r2", Priority::Normal))
            .await
            .unwrap();
        queue
            .enqueue(create_test_job("c", "r3", Priority::Normal))
            .await
            .unwrap();
        let claimed = queue.claim("w1", 1, NO_STALE).await.unwrap().unwrap();
        queue
            .complete(
                claimed.id,
                &JobCompletion {
                    outcome: JobOutcome::Done,
                    attempts: 0,
                    tier: None,
                    last_error: None,
                    summary: None,
                    details: serde_json::Value::Null,
                },
            )
            .await
            .unwrap();
        queue.claim("w2", 1, NO_STALE).await.unwrap().unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.done, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.total_jobs(), 3);
        assert_eq!(stats.queued_by_priority.get(&Priority::Normal), Some(&1));
        assert_eq!(stats.claimed_by_resource.get("r2"), Some(&1));
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::JobNotFound(42);
        assert!(err.to_string().contains("not found"));

        let err = QueueError::NotClaimed {
            id: 7,
            state: JobState::Done,
        };
        assert!(err.to_string().contains("done"));
    }
}

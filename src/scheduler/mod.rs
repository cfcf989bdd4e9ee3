//! Durable job queue and the worker pool that drains it.
//!
//! - **JobQueue**: SQLite-backed queue with atomic claim, stale-lock recovery
//!   and per-resource concurrency limits
//! - **WorkerPool**: pool of workers that claim jobs and run the repair loop
//! - **Job**: job, event and attempt-record definitions
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │    (CLI)     │
//!                      └──────┬───────┘
//!                             │ enqueue
//!                      ┌──────▼───────┐
//!                      │   SQLite     │
//!                      │  jobs table  │
//!                      └──────┬───────┘
//!                             │ claim (one transaction)
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 0│         │ Worker 1│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use patchforge::scheduler::{JobQueue, NewJob, Priority};
//! use patchforge::storage::Database;
//! use std::time::Duration;
//!
//! let queue = JobQueue::new(Database::open("patchforge.db").await?);
//! let id = queue
//!     .enqueue(NewJob::new("ISSUE-42", payload).with_resource_key("repoA").with_priority(Priority::High))
//!     .await?;
//!
//! if let Some(job) = queue.claim("worker-a-0", 1, Duration::from_secs(1800)).await? {
//!     // ...
//! }
//! ```
//!
//! # Reliability
//!
//! - **Atomic claim**: select-and-lock is a single conditional UPDATE inside a write transaction
//! - **Crash recovery**: locks older than the stale timeout are reclaimed by the next claim
//! - **Audit trail**: every attempt and terminal outcome is an event row
//! - **Graceful shutdown**: workers finish their current job before stopping

pub mod job;
pub mod queue;
pub mod worker_pool;

pub use job::{
    event_kinds, AttemptRecord, AttemptResult, ClaimedJob, EventLevel, Job, JobCompletion,
    JobEvent, JobOutcome, JobState, NewJob, Priority, DEFAULT_RESOURCE_KEY,
};
pub use queue::{JobQueue, QueueError, QueueStats};
pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};

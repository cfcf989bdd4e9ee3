//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `NewJob`: A job description handed to `JobQueue::enqueue`
//! - `Job`: A stored job row
//! - `ClaimedJob`: The view of a job a worker receives from `JobQueue::claim`
//! - `JobState` / `Priority` / `JobOutcome`: state machine vocabulary
//! - `JobEvent` / `EventLevel`: the append-only audit trail
//! - `AttemptRecord`: a repair attempt as stored in the audit trail

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resource key used when a job does not name one.
pub const DEFAULT_RESOURCE_KEY: &str = "default";

/// Scheduling priority. Lower numeric values are more urgent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
}

impl Priority {
    /// Returns all priorities, most urgent first.
    pub fn all() -> [Priority; 4] {
        [
            Priority::Critical,
            Priority::High,
            Priority::Normal,
            Priority::Low,
        ]
    }

    /// Numeric value stored in the database.
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    /// Maps a stored value back to a priority. Unknown values sort as `Low`.
    pub fn from_i64(value: i64) -> Self {
        match value {
            i64::MIN..=0 => Priority::Critical,
            1 => Priority::High,
            2 => Priority::Normal,
            _ => Priority::Low,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" | "0" => Ok(Priority::Critical),
            "high" | "1" => Ok(Priority::High),
            "normal" | "2" => Ok(Priority::Normal),
            "low" | "3" => Ok(Priority::Low),
            other => Err(format!(
                "unknown priority '{}': expected critical, high, normal or low",
                other
            )),
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting to be claimed.
    Queued,
    /// Locked by a worker.
    Claimed,
    /// Terminal: verification passed.
    Done,
    /// Terminal: repair attempts exhausted or payload unusable.
    Failed,
}

impl JobState {
    /// Returns all states in lifecycle order.
    pub fn all() -> [JobState; 4] {
        [
            JobState::Queued,
            JobState::Claimed,
            JobState::Done,
            JobState::Failed,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Claimed => "claimed",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }

    /// Returns whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "claimed" => Ok(JobState::Claimed),
            "done" => Ok(JobState::Done),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

/// Terminal outcome written by `JobQueue::complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Done,
    Failed,
}

impl JobOutcome {
    /// The state a job enters with this outcome.
    pub fn state(self) -> JobState {
        match self {
            JobOutcome::Done => JobState::Done,
            JobOutcome::Failed => JobState::Failed,
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.state().fmt(f)
    }
}

/// A job to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    /// External correlation key (e.g. an issue identifier).
    pub key: String,
    /// Concurrency grouping key (e.g. a repository).
    pub resource_key: String,
    /// Opaque payload handed back to the claiming worker.
    pub payload: serde_json::Value,
    /// Scheduling priority.
    pub priority: Priority,
}

impl NewJob {
    /// Creates a new job with normal priority and the default resource key.
    pub fn new(key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            resource_key: DEFAULT_RESOURCE_KEY.to_string(),
            payload,
            priority: Priority::Normal,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the resource key.
    pub fn with_resource_key(mut self, resource_key: impl Into<String>) -> Self {
        self.resource_key = resource_key.into();
        self
    }
}

/// A stored job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub key: String,
    pub state: JobState,
    pub priority: Priority,
    pub resource_key: String,
    pub payload: serde_json::Value,
    /// Worker currently holding the lock. Only set while `state == Claimed`.
    pub lock_owner: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Repair attempts consumed so far.
    pub attempts: u32,
    /// Fixer tier in use when the job last progressed.
    pub tier: Option<String>,
    /// Terminal summary.
    pub summary: Option<String>,
}

impl Job {
    /// Returns how long the current lock has been held.
    pub fn lock_age(&self) -> Option<chrono::Duration> {
        self.locked_at.map(|at| Utc::now() - at)
    }
}

/// A job handed to a worker by a successful claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedJob {
    pub id: i64,
    pub key: String,
    pub resource_key: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    /// Attempts consumed before this claim.
    pub attempts: u32,
    /// Worker that now owns the lock.
    pub worker_id: String,
}

/// Final attributes written on completion.
#[derive(Debug, Clone, PartialEq)]
pub struct JobCompletion {
    pub outcome: JobOutcome,
    pub attempts: u32,
    pub tier: Option<String>,
    pub last_error: Option<String>,
    pub summary: Option<String>,
    /// Extra context stored on the terminal event (e.g. attempt history).
    pub details: serde_json::Value,
}

impl JobCompletion {
    /// A successful completion.
    pub fn done(attempts: u32, summary: impl Into<String>) -> Self {
        Self {
            outcome: JobOutcome::Done,
            attempts,
            tier: None,
            last_error: None,
            summary: Some(summary.into()),
            details: serde_json::Value::Null,
        }
    }

    /// A permanent failure.
    pub fn failed(attempts: u32, error: impl Into<String>) -> Self {
        Self {
            outcome: JobOutcome::Failed,
            attempts,
            tier: None,
            last_error: Some(error.into()),
            summary: None,
            details: serde_json::Value::Null,
        }
    }

    /// Records the fixer tier that was active at the end.
    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    /// Sets the summary.
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Attaches extra context for the terminal event.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Severity of a job event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            EventLevel::Debug => "debug",
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        }
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(EventLevel::Debug),
            "info" => Ok(EventLevel::Info),
            "warn" => Ok(EventLevel::Warn),
            "error" => Ok(EventLevel::Error),
            other => Err(format!("unknown event level '{}'", other)),
        }
    }
}

/// Well-known values of the `kind` field in event metadata.
pub mod event_kinds {
    /// One per repair attempt.
    pub const ATTEMPT: &str = "attempt";
    /// Exactly one per job, written when it reaches DONE or FAILED.
    pub const TERMINAL: &str = "terminal";
    /// Written when a stale lock is reclaimed.
    pub const LOCK_RECLAIMED: &str = "lock_reclaimed";
    /// Written when a worker hands a job back to the queue.
    pub const RELEASED: &str = "released";
}

/// How a single repair attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    /// Verification passed after the fix was applied.
    Passed,
    /// The fix was applied but verification still failed.
    VerificationFailed,
    /// The fixer response could not be interpreted.
    Malformed,
    /// The proposed file operations could not be applied.
    ApplyFailed,
    /// The fixer refused or failed permanently.
    FixerFailed,
}

impl AttemptResult {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptResult::Passed => "passed",
            AttemptResult::VerificationFailed => "verification_failed",
            AttemptResult::Malformed => "malformed",
            AttemptResult::ApplyFailed => "apply_failed",
            AttemptResult::FixerFailed => "fixer_failed",
        }
    }

    pub fn is_success(self) -> bool {
        self == AttemptResult::Passed
    }
}

impl fmt::Display for AttemptResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One repair attempt as recorded in the event log.
///
/// Stored under the `record` key of an `attempt` event's metadata, so the
/// full history of a job can be rebuilt from its events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Fixer tier used for this attempt.
    pub tier: String,
    /// Error category of the failure being repaired.
    pub category: String,
    /// Fingerprint of the failure being repaired.
    pub fingerprint: String,
    /// Truncated failure text the attempt started from.
    pub error_excerpt: String,
    /// Strategy the fixer proposed, if it proposed one.
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub touched_files: Vec<String>,
    pub result: AttemptResult,
    /// Failure detail (verification output tail, parse error, ...).
    #[serde(default)]
    pub detail: Option<String>,
}

/// An entry in a job's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: i64,
    pub job_id: i64,
    pub created_at: DateTime<Utc>,
    pub level: EventLevel,
    pub message: String,
    pub metadata: serde_json::Value,
}

impl JobEvent {
    /// Returns the `kind` recorded in the metadata, if any.
    pub fn kind(&self) -> Option<&str> {
        self.metadata.get("kind").and_then(|k| k.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_priority_storage_mapping() {
        for priority in Priority::all() {
            assert_eq!(Priority::from_i64(priority.as_i64()), priority);
        }
        assert_eq!(Priority::from_i64(-5), Priority::Critical);
        assert_eq!(Priority::from_i64(42), Priority::Low);
    }

    #[test]
    fn test_priority_from_str() {
        assert_eq!("HIGH".parse::<Priority>(), Ok(Priority::High));
        assert_eq!("0".parse::<Priority>(), Ok(Priority::Critical));
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_job_state_terminal() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Claimed.is_terminal());
        assert!(JobState::Done.is_terminal());
        assert!(JobState::Failed.is_terminal());
    }

    #[test]
    fn test_job_state_parse_display() {
        for state in JobState::all() {
            assert_eq!(state.to_string().parse::<JobState>(), Ok(state));
        }
    }

    #[test]
    fn test_new_job_builder() {
        let job = NewJob::new("ISSUE-7", serde_json::json!({"workdir": "/tmp/x"}))
            .with_priority(Priority::High)
            .with_resource_key("repoA");

        assert_eq!(job.key, "ISSUE-7");
        assert_eq!(job.resource_key, "repoA");
        assert_eq!(job.priority, Priority::High);
    }

    #[test]
    fn test_new_job_defaults() {
        let job = NewJob::new("k", serde_json::Value::Null);
        assert_eq!(job.resource_key, DEFAULT_RESOURCE_KEY);
        assert_eq!(job.priority, Priority::Normal);
    }

    #[test]
    fn test_completion_builders() {
        let done = JobCompletion::done(2, "fixed import").with_tier("primary");
        assert_eq!(done.outcome, JobOutcome::Done);
        assert_eq!(done.tier.as_deref(), Some("primary"));
        assert!(done.last_error.is_none());

        let failed = JobCompletion::failed(3, "still broken");
        assert_eq!(failed.outcome.state(), JobState::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("still broken"));
    }

    #[test]
    fn test_attempt_record_serde_defaults() {
        let record: AttemptRecord = serde_json::from_value(serde_json::json!({
            "attempt": 1,
            "tier": "primary",
            "category": "syntax_error",
            "fingerprint": "abc",
            "error_excerpt": "SyntaxError",
            "result": "malformed"
        }))
        .expect("decode");

        assert_eq!(record.result, AttemptResult::Malformed);
        assert!(record.strategy.is_none());
        assert!(record.touched_files.is_empty());
        assert!(!record.result.is_success());
    }

    #[test]
    fn test_event_kind() {
        let event = JobEvent {
            id: 1,
            job_id: 1,
            created_at: Utc::now(),
            level: EventLevel::Info,
            message: "attempt 1".to_string(),
            metadata: serde_json::json!({"kind": event_kinds::ATTEMPT}),
        };
        assert_eq!(event.kind(), Some("attempt"));
    }
}

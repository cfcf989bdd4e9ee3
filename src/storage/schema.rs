//! Database schema constants.
//!
//! This module contains all SQL schema definitions for the SQLite storage
//! backend. Timestamps are stored as Unix milliseconds; JSON columns are TEXT.

/// SQL schema for creating the jobs table.
pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    external_key  TEXT    NOT NULL,
    state         TEXT    NOT NULL DEFAULT 'queued',
    priority      INTEGER NOT NULL DEFAULT 2,
    resource_key  TEXT    NOT NULL,
    payload       TEXT    NOT NULL,
    lock_owner    TEXT,
    locked_at     INTEGER,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL,
    finished_at   INTEGER,
    last_error    TEXT,
    attempts      INTEGER NOT NULL DEFAULT 0,
    tier          TEXT,
    summary       TEXT,
    CHECK (state IN ('queued', 'claimed', 'done', 'failed')),
    CHECK (state = 'claimed' OR lock_owner IS NULL)
)
"#;

/// SQL schema for creating the job_events table.
pub const CREATE_JOB_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id      INTEGER NOT NULL REFERENCES jobs(id),
    created_at  INTEGER NOT NULL,
    level       TEXT    NOT NULL,
    message     TEXT    NOT NULL,
    metadata    TEXT    NOT NULL DEFAULT '{}'
)
"#;

/// SQL schema for creating the error_patterns table.
pub const CREATE_ERROR_PATTERNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS error_patterns (
    fingerprint      TEXT    PRIMARY KEY,
    category         TEXT    NOT NULL,
    normalized       TEXT    NOT NULL,
    best_fix         TEXT,
    touched_files    TEXT    NOT NULL DEFAULT '[]',
    rejected_fixes   TEXT    NOT NULL DEFAULT '[]',
    success_count    INTEGER NOT NULL DEFAULT 0,
    failure_count    INTEGER NOT NULL DEFAULT 0,
    last_success_at  INTEGER,
    last_failure_at  INTEGER,
    created_at       INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL
)
"#;

/// Index for the claim query: queued jobs in priority order.
pub const CREATE_JOBS_CLAIM_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(state, priority, created_at, id)
"#;

/// Index for per-resource concurrency counting.
pub const CREATE_JOBS_RESOURCE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_jobs_resource ON jobs(resource_key, state)
"#;

/// Index for stale-lock reclamation.
pub const CREATE_JOBS_LOCKED_AT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_jobs_locked_at ON jobs(locked_at) WHERE state = 'claimed'
"#;

/// Index for event lookups by job.
pub const CREATE_JOB_EVENTS_JOB_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_job_events_job_id ON job_events(job_id, id)
"#;

/// Index for same-category pattern lookups.
pub const CREATE_ERROR_PATTERNS_CATEGORY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_error_patterns_category ON error_patterns(category, success_count DESC)
"#;

/// Returns all schema statements in the order they should be applied.
///
/// Each statement is applied as its own tracked migration, so new statements
/// must only ever be appended.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_JOBS_TABLE,
        CREATE_JOB_EVENTS_TABLE,
        CREATE_ERROR_PATTERNS_TABLE,
        CREATE_JOBS_CLAIM_INDEX,
        CREATE_JOBS_RESOURCE_INDEX,
        CREATE_JOBS_LOCKED_AT_INDEX,
        CREATE_JOB_EVENTS_JOB_INDEX,
        CREATE_ERROR_PATTERNS_CATEGORY_INDEX,
    ]
}

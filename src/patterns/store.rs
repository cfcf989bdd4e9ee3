//! Persistent error-pattern cache.
//!
//! Maps an error fingerprint to the most recent fix that made verification
//! pass, together with success/failure counters and a rolling list of
//! strategies that did not work. Lookups are advisory: the repair loop
//! always re-verifies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use thiserror::Error;

use super::fingerprint::Fingerprint;
use crate::categories::ErrorCategory;
use crate::storage::{from_millis, now_millis, Database};

/// Errors that can occur during pattern store operations.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("Database operation failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid row: {0}")]
    InvalidRow(String),
}

/// Ranking constants for lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Upper bound on the confidence of an exact fingerprint match.
    pub exact_confidence_cap: f64,
    /// Multiplier applied to the confidence of a same-category match.
    pub category_multiplier: f64,
    /// Number of rejected strategies kept per pattern.
    pub rejected_window: usize,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            exact_confidence_cap: 0.95,
            category_multiplier: 0.7,
            rejected_window: 10,
        }
    }
}

/// A stored error pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub fingerprint: String,
    pub category: ErrorCategory,
    pub normalized: String,
    /// Most recent fix that made verification pass.
    pub best_fix: Option<String>,
    pub touched_files: Vec<String>,
    /// Most recent strategies that failed, oldest first.
    pub rejected_fixes: Vec<String>,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ErrorPattern {
    /// `success / (success + failure)`, or 0 when the pattern has no outcomes.
    pub fn confidence(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.success_count as f64 / total as f64
        }
    }
}

/// How a candidate matched the queried error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Category,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::Exact => "exact",
            MatchKind::Category => "category",
        }
    }
}

/// A ranked fix suggestion returned by [`PatternStore::lookup`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixCandidate {
    pub fingerprint: String,
    pub category: ErrorCategory,
    pub fix: String,
    pub touched_files: Vec<String>,
    pub confidence: f64,
    pub success_count: u64,
    pub match_kind: MatchKind,
}

/// Per-category aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub category: ErrorCategory,
    pub patterns: u64,
    pub successes: u64,
    pub failures: u64,
}

/// SQLite-backed pattern store.
#[derive(Clone)]
pub struct PatternStore {
    db: Database,
    config: PatternConfig,
}

impl PatternStore {
    /// Creates a store with default ranking constants.
    pub fn new(db: Database) -> Self {
        Self::with_config(db, PatternConfig::default())
    }

    pub fn with_config(db: Database, config: PatternConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &PatternConfig {
        &self.config
    }

    /// Records that `fix` made verification pass for `error`.
    ///
    /// Increments the success count and replaces the stored fix and touched
    /// files with the most recent working ones.
    pub async fn record_success(
        &self,
        error: &str,
        fix: &str,
        touched_files: &[String],
    ) -> Result<(), PatternError> {
        let fp = Fingerprint::of(error);
        let category = fp.category;
        let touched = serde_json::to_string(touched_files)?;
        let now = now_millis();

        sqlx::query(
            r#"
            INSERT INTO error_patterns (
                fingerprint, category, normalized, best_fix, touched_files,
                success_count, last_success_at, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6, ?6)
            ON CONFLICT(fingerprint) DO UPDATE SET
                success_count = success_count + 1,
                best_fix = excluded.best_fix,
                touched_files = excluded.touched_files,
                last_success_at = excluded.last_success_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&fp.hash)
        .bind(category.as_str())
        .bind(&fp.normalized)
        .bind(fix)
        .bind(&touched)
        .bind(now)
        .execute(self.db.pool())
        .await?;

        tracing::debug!(
            fingerprint = %&fp.hash[..12],
            category = %category,
            "Recorded pattern success"
        );
        Ok(())
    }

    /// Records that a strategy failed for `error`.
    ///
    /// Increments the failure count and, when a strategy is given, appends it
    /// to the rolling rejected list (moving it to the end if already present).
    pub async fn record_failure(
        &self,
        error: &str,
        attempted_fix: Option<&str>,
    ) -> Result<(), PatternError> {
        let fp = Fingerprint::of(error);
        let category = fp.category;
        let now = now_millis();

        let mut tx = self.db.pool().begin().await?;

        let (rejected,): (String,) = sqlx::query_as(
            r#"
            INSERT INTO error_patterns (
                fingerprint, category, normalized, failure_count,
                last_failure_at, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, 1, ?4, ?4, ?4)
            ON CONFLICT(fingerprint) DO UPDATE SET
                failure_count = failure_count + 1,
                last_failure_at = excluded.last_failure_at,
                updated_at = excluded.updated_at
            RETURNING rejected_fixes
            "#,
        )
        .bind(&fp.hash)
        .bind(category.as_str())
        .bind(&fp.normalized)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        if let Some(fix) = attempted_fix.map(str::trim).filter(|f| !f.is_empty()) {
            let mut list: Vec<String> = serde_json::from_str(&rejected)?;
            list.retain(|existing| existing != fix);
            list.push(fix.to_string());
            let overflow = list.len().saturating_sub(self.config.rejected_window.max(1));
            list.drain(..overflow);

            sqlx::query("UPDATE error_patterns SET rejected_fixes = ?1 WHERE fingerprint = ?2")
                .bind(serde_json::to_string(&list)?)
                .bind(&fp.hash)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        tracing::debug!(
            fingerprint = %&fp.hash[..12],
            category = %category,
            "Recorded pattern failure"
        );
        Ok(())
    }

    /// Returns up to `limit` ranked fix candidates for `error`.
    ///
    /// An exact fingerprint match comes first with its confidence capped;
    /// same-category patterns follow by success count with a reduced
    /// confidence. Errors classified as `unknown` only match exactly.
    pub async fn lookup(&self, error: &str, limit: usize) -> Result<Vec<FixCandidate>, PatternError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let fp = Fingerprint::of(error);
        let category = fp.category;
        let mut candidates = Vec::with_capacity(limit);

        let exact = sqlx::query(
            "SELECT * FROM error_patterns WHERE fingerprint = ?1 AND best_fix IS NOT NULL",
        )
        .bind(&fp.hash)
        .fetch_optional(self.db.pool())
        .await?;

        if let Some(row) = exact {
            let pattern = pattern_from_row(&row)?;
            let confidence = pattern.confidence().min(self.config.exact_confidence_cap);
            candidates.extend(candidate(pattern, confidence, MatchKind::Exact));
        }

        if category != ErrorCategory::Unknown && candidates.len() < limit {
            let remaining = (limit - candidates.len()) as i64;
            let rows = sqlx::query(
                r#"
                SELECT * FROM error_patterns
                WHERE category = ?1 AND fingerprint != ?2 AND best_fix IS NOT NULL
                ORDER BY success_count DESC, updated_at DESC
                LIMIT ?3
                "#,
            )
            .bind(category.as_str())
            .bind(&fp.hash)
            .bind(remaining)
            .fetch_all(self.db.pool())
            .await?;

            for row in &rows {
                let pattern = pattern_from_row(row)?;
                let confidence = pattern.confidence() * self.config.category_multiplier;
                candidates.extend(candidate(pattern, confidence, MatchKind::Category));
            }
        }

        Ok(candidates)
    }

    /// Returns the stored pattern for `error`, if any.
    pub async fn get(&self, error: &str) -> Result<Option<ErrorPattern>, PatternError> {
        let fp = Fingerprint::of(error);
        let row = sqlx::query("SELECT * FROM error_patterns WHERE fingerprint = ?1")
            .bind(&fp.hash)
            .fetch_optional(self.db.pool())
            .await?;

        row.as_ref().map(pattern_from_row).transpose()
    }

    /// Returns pattern counts and outcome totals per category.
    pub async fn stats_by_category(&self) -> Result<Vec<CategoryStats>, PatternError> {
        let rows: Vec<(String, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT category, COUNT(*), COALESCE(SUM(success_count), 0), COALESCE(SUM(failure_count), 0)
            FROM error_patterns
            GROUP BY category
            ORDER BY category
            "#,
        )
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter()
            .map(|(category, patterns, successes, failures)| {
                Ok(CategoryStats {
                    category: category.parse().map_err(PatternError::InvalidRow)?,
                    patterns: patterns.max(0) as u64,
                    successes: successes.max(0) as u64,
                    failures: failures.max(0) as u64,
                })
            })
            .collect()
    }
}

fn candidate(pattern: ErrorPattern, confidence: f64, match_kind: MatchKind) -> Option<FixCandidate> {
    let fix = pattern.best_fix?;
    Some(FixCandidate {
        fingerprint: pattern.fingerprint,
        category: pattern.category,
        fix,
        touched_files: pattern.touched_files,
        confidence,
        success_count: pattern.success_count,
        match_kind,
    })
}

fn pattern_from_row(row: &SqliteRow) -> Result<ErrorPattern, PatternError> {
    let category: String = row.get("category");
    let touched: String = row.get("touched_files");
    let rejected: String = row.get("rejected_fixes");

    Ok(ErrorPattern {
        fingerprint: row.get("fingerprint"),
        category: category.parse().map_err(PatternError::InvalidRow)?,
        normalized: row.get("normalized"),
        best_fix: row.get("best_fix"),
        touched_files: serde_json::from_str(&touched)?,
        rejected_fixes: serde_json::from_str(&rejected)?,
        success_count: row.get::<i64, _>("success_count").max(0) as u64,
        failure_count: row.get::<i64, _>("failure_count").max(0) as u64,
        last_success_at: row.get::<Option<i64>, _>("last_success_at").map(from_millis),
        last_failure_at: row.get::<Option<i64>, _>("last_failure_at").map(from_millis),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    })
}

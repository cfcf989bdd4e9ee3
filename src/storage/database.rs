//! SQLite database handle shared by the job queue and the pattern store.
//!
//! The database is the only synchronization point between workers, so the
//! pool is configured for concurrent writers: WAL journaling, a generous busy
//! timeout, and enforced foreign keys.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use thiserror::Error;

use super::migrations::{MigrationError, MigrationRunner};

/// Default number of pooled connections.
const DEFAULT_MAX_CONNECTIONS: u32 = 8;

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
}

/// SQLite database client.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if missing) the database at `path` and runs migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        Self::open_with_connections(path, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Opens the database with an explicit pool size.
    pub async fn open_with_connections(
        path: impl AsRef<Path>,
        max_connections: u32,
    ) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(opts)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        let db = Self { pool };
        db.run_migrations().await?;

        tracing::info!(path = %path.display(), "Database opened");
        Ok(db)
    }

    /// Creates a new database client from an existing pool.
    ///
    /// Migrations are not run; call [`Database::run_migrations`] if needed.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let runner = MigrationRunner::new(self.pool.clone());
        runner.run_migrations().await?;
        Ok(())
    }

    /// Closes the pool, waiting for checked-out connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Current time as Unix milliseconds, the storage representation of timestamps.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Converts a stored millisecond timestamp back into a `DateTime`.
pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_creates_schema() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("forge.db"))
            .await
            .expect("open database");

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(db.pool())
                .await
                .expect("list tables");
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();

        assert!(names.contains(&"jobs"));
        assert!(names.contains(&"job_events"));
        assert!(names.contains(&"error_patterns"));
        assert!(names.contains(&"_migrations"));
    }

    #[tokio::test]
    async fn test_reopen_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("forge.db");

        let first = Database::open(&path).await.expect("first open");
        first.close().await;
        let second = Database::open(&path).await.expect("second open");

        let runner = MigrationRunner::new(second.pool().clone());
        let applied = runner.list_applied_migrations().await.expect("list");
        assert_eq!(applied.len(), super::super::schema::all_schema_statements().len());
    }

    #[test]
    fn test_millis_roundtrip() {
        let now = now_millis();
        assert_eq!(from_millis(now).timestamp_millis(), now);
    }

    #[test]
    fn test_database_error_display() {
        let err = DatabaseError::ConnectionFailed("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }
}

//! SQLite persistent storage.
//!
//! The store holds the three durable collections: jobs, the append-only job
//! event log, and learned error patterns. Both the job queue and the pattern
//! store share one [`Database`] handle.
//!
//! # Usage
//!
//! ```rust,ignore
//! use patchforge::storage::Database;
//!
//! // Opens (or creates) the file and applies pending migrations.
//! let db = Database::open("patchforge.db").await?;
//! ```

pub mod database;
pub mod migrations;
pub mod schema;

pub use database::{Database, DatabaseError};
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};

pub(crate) use database::{from_millis, now_millis};

//! patchforge: a durable repair queue for failing builds.
//!
//! Work units whose verification fails are queued in SQLite, claimed by
//! workers, and repaired by a bounded loop that escalates from a primary to a
//! secondary fixer. Fixes that make verification pass are remembered by error
//! fingerprint and offered as hints for similar failures.
//!
//! - [`scheduler`]: job queue, event log and worker pool
//! - [`repair`]: the repair orchestrator and its collaborators
//! - [`patterns`]: error fingerprints and the pattern store
//! - [`ratelimit`]: token buckets for outbound fixer calls
//! - [`llm`]: the LLM-backed fixer

pub mod categories;
pub mod cli;
pub mod config;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod patterns;
pub mod ratelimit;
pub mod repair;
pub mod scheduler;
pub mod storage;
pub mod utils;

pub use config::{ConfigError, ForgeConfig};
pub use error::LlmError;

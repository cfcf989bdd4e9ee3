//! Metrics module for Prometheus-based monitoring.
//!
//! Covers job outcomes, repair attempts, fixer usage, rate-limiter waits,
//! pattern-store hit rates, queue depth and worker activity.
//!
//! # Example
//!
//! ```ignore
//! use patchforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! let collector = MetricsCollector::new();
//! collector.record_job_finished("done", 120.5);
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MetricsCollector, TokenUsage};
pub use prometheus::{export_metrics, init_metrics};

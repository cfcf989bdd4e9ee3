//! Command-line interface for patchforge.
//!
//! Provides commands to enqueue work, run workers, and inspect jobs, events,
//! queue statistics, learned patterns and metrics.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};

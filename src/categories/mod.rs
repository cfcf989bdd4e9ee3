//! Category system for verification failures.
//!
//! This module provides the taxonomy used to classify failure output before
//! a repair attempt.

mod taxonomy;

pub use taxonomy::ErrorCategory;

//! Error-pattern fingerprint cache.
//!
//! - [`fingerprint`]: error normalization and hashing
//! - [`store`]: the persistent fingerprint → fix cache
//!
//! # Example
//!
//! ```rust,ignore
//! use patchforge::patterns::PatternStore;
//!
//! let store = PatternStore::new(db);
//! store.record_success("Cannot find module 'left-pad'", "install left-pad", &[]).await?;
//! let candidates = store.lookup("Cannot find module 'left-pad'", 3).await?;
//! ```

pub mod fingerprint;
pub mod store;

pub use fingerprint::{error_signature, fingerprint, normalize, Fingerprint};
pub use store::{
    CategoryStats, ErrorPattern, FixCandidate, MatchKind, PatternConfig, PatternError,
    PatternStore,
};

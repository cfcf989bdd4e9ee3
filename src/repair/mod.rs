//! The repair loop and the collaborators it drives.
//!
//! - [`RepairOrchestrator`]: verify, classify, consult patterns, request a
//!   fix, apply, re-verify, bounded by an attempt ceiling
//! - [`Fixer`]: the two-tier "propose a fix" capability
//! - [`Verifier`]: runs the job's check ([`CommandVerifier`])
//! - [`OutcomeReporter`]: receives terminal outcomes ([`TracingReporter`])

pub mod fixer;
pub mod orchestrator;
pub mod report;
pub mod request;
pub mod verifier;
pub mod workspace;

pub use fixer::{
    FileAction, FileOperation, FixProposal, FixUsage, Fixer, FixerError, FixerSet, FixerTier,
};
pub use orchestrator::{RepairConfig, RepairError, RepairOrchestrator, RepairPayload, RepairReport};
pub use report::{OutcomeReporter, ReportError, TerminalReport, TracingReporter};
pub use request::{truncate_tail, CategoryTrend, Reflection, RepairRequest};
pub use verifier::{
    CommandVerifier, VerificationError, VerificationOutcome, Verifier, CHANGED_FILES_ENV,
};
pub use workspace::{apply_operations, ApplyError};

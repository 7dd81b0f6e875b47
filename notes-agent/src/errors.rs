//! Caller-facing failures of workflow operations.
//!
//! Halts (pause, recoverable or blocking failure) are outcomes of a run, not
//! errors; see [`crate::workflow::Halt`]. These variants reject an operation,
//! and only `Integrity` may have touched state (the run is marked blocked).

use thiserror::Error;

use crate::core::plan::RangeError;
use crate::io::executor::ContractViolation;

#[derive(Debug, Error)]
pub enum WorkflowError {
    /// `from_stage` is after `to_stage`. Rejected before any side effect.
    #[error(transparent)]
    InvalidRange(#[from] RangeError),

    /// The project is `failed_blocking` and needs `clear-block` first.
    #[error("project is blocked: {reason}")]
    Blocked { reason: String },

    /// Snapshot verification found mismatches.
    #[error("snapshot integrity failure: {details}")]
    Integrity { details: String },

    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),

    #[error("no run to resume")]
    NoActiveRun,

    #[error("run {run_id} is already running")]
    RunActive { run_id: String },

    /// Another live process is driving this project.
    #[error("project is locked by pid {pid}")]
    Locked { pid: u32 },

    #[error("run {run_id} already exists")]
    RunExists { run_id: String },

    #[error("no source snapshot captured; run `snapshot` first")]
    NoSnapshot,

    #[error("source unreadable: {path}: {message}")]
    SourceUnreadable { path: String, message: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkflowError {
    /// Whether the error reports a blocked project or a broken snapshot.
    pub fn is_blocking(&self) -> bool {
        matches!(self, WorkflowError::Blocked { .. } | WorkflowError::Integrity { .. })
    }
}

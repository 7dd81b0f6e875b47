//! Stable exit codes for `notes-agent` commands.

use crate::core::types::RunStatus;

/// Command succeeded, or the run succeeded.
pub const OK: i32 = 0;
/// Invalid input, configuration or any other error.
pub const INVALID: i32 = 1;
/// The run paused and waits for `resume`.
pub const PAUSED: i32 = 2;
/// The run failed recoverably; `resume` retries.
pub const FAILED_RECOVERABLE: i32 = 3;
/// The run is blocked or the snapshot failed verification.
pub const FAILED_BLOCKING: i32 = 4;

/// Exit code reporting a run status.
pub fn for_status(status: RunStatus) -> i32 {
    match status {
        RunStatus::Paused => PAUSED,
        RunStatus::FailedRecoverable => FAILED_RECOVERABLE,
        RunStatus::FailedBlocking => FAILED_BLOCKING,
        RunStatus::Pending | RunStatus::Running | RunStatus::Succeeded => OK,
    }
}

//! Pure decision policy applied after every stage invocation.
//!
//! The orchestrator persists a [`StageResult`](crate::io::state::StageResult)
//! first and only then asks [`decide`] what to do next.

use crate::core::classifier::FailureKind;
use crate::core::stage::Stage;
use crate::core::types::{CheckReport, InvocationKind, PausePolicy, StageOutcome};

/// How the tool invocation ended, after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolVerdict {
    Completed,
    Failed {
        kind: FailureKind,
        message: String,
        attempts: u32,
    },
}

/// How validation ended. `None` in [`Observation::check`] means it never ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckVerdict {
    Report(CheckReport),
    /// The check runner itself could not complete (I/O trouble).
    RunnerError(String),
}

/// Everything [`decide`] looks at for one invocation.
#[derive(Debug, Clone)]
pub struct Observation<'a> {
    pub stage: Stage,
    pub invocation: InvocationKind,
    pub tool: &'a ToolVerdict,
    pub check: Option<&'a CheckVerdict>,
    /// Exceeded change threshold for the stage so far, if any.
    pub threshold_breach: Option<&'a str>,
}

/// Per-run knobs for [`decide`].
#[derive(Debug, Clone, Copy)]
pub struct DecisionPolicy {
    pub pause: PausePolicy,
    pub auto_remediate: bool,
    /// Last stage of the run's range.
    pub to_stage: Stage,
}

/// Next action for the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Advance,
    Remediate,
    Pause { reason: String },
    FailRecoverable { reason: String },
    FailBlocking { reason: String },
}

/// Outcome tag for the persisted stage result.
pub fn stage_outcome(tool: &ToolVerdict, check: Option<&CheckVerdict>) -> StageOutcome {
    match (tool, check) {
        (ToolVerdict::Failed { kind, .. }, _) if kind.is_blocking() => StageOutcome::Blocked,
        (ToolVerdict::Failed { .. }, _) => StageOutcome::ToolError,
        (ToolVerdict::Completed, Some(CheckVerdict::Report(report)))
            if report.integrity_failed() =>
        {
            StageOutcome::Blocked
        }
        (ToolVerdict::Completed, Some(CheckVerdict::Report(report))) if !report.passed => {
            StageOutcome::CheckFailed
        }
        (ToolVerdict::Completed, Some(CheckVerdict::RunnerError(_))) => StageOutcome::ToolError,
        (ToolVerdict::Completed, _) => StageOutcome::Success,
    }
}

pub fn decide(observation: &Observation<'_>, policy: &DecisionPolicy) -> Decision {
    if let ToolVerdict::Failed {
        kind,
        message,
        attempts,
    } = observation.tool
    {
        let stage = observation.stage;
        return match kind {
            FailureKind::AuthRequired => Decision::FailBlocking {
                reason: format!("authentication required: {message}"),
            },
            FailureKind::Permission => Decision::FailBlocking {
                reason: format!("permission failure in {stage}: {message}"),
            },
            FailureKind::Transient => Decision::FailRecoverable {
                reason: format!(
                    "transient tool error in {stage} after {attempts} attempts: {message}"
                ),
            },
            FailureKind::Unclassified => Decision::FailRecoverable {
                reason: format!("tool error in {stage}: {message}"),
            },
        };
    }

    match observation.check {
        Some(CheckVerdict::RunnerError(message)) => {
            return Decision::FailRecoverable {
                reason: format!("check runner error in {}: {message}", observation.stage),
            };
        }
        Some(CheckVerdict::Report(report)) if report.integrity_failed() => {
            return Decision::FailBlocking {
                reason: format!("snapshot integrity failure: {}", report.error_summary()),
            };
        }
        Some(CheckVerdict::Report(report)) if !report.passed => {
            return match observation.invocation {
                InvocationKind::Primary if policy.auto_remediate => Decision::Remediate,
                InvocationKind::Primary => Decision::FailRecoverable {
                    reason: format!(
                        "check failed; auto-remediation disabled: {}",
                        report.error_summary()
                    ),
                },
                InvocationKind::Remediation => Decision::FailRecoverable {
                    reason: format!(
                        "check failed after remediation: {}",
                        report.error_summary()
                    ),
                },
            };
        }
        _ => {}
    }

    if !observation.stage.is_scaffold()
        && policy.pause.on_change_threshold
        && let Some(breach) = observation.threshold_breach
    {
        return Decision::Pause {
            reason: format!("change threshold exceeded: {breach}"),
        };
    }

    if policy.pause.after_each_stage && observation.stage != policy.to_stage {
        return Decision::Pause {
            reason: format!("pause after each stage: {} completed", observation.stage),
        };
    }

    Decision::Advance
}

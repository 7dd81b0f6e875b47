//! Shared deterministic types for workflow core logic.
//!
//! These types are the stable contracts persisted under `project_root` and
//! exchanged between the orchestrator and its collaborators. They must not
//! depend on external state.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a run, mirrored into `state/round_status.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Paused,
    FailedRecoverable,
    FailedBlocking,
    Succeeded,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::FailedRecoverable => "failed_recoverable",
            RunStatus::FailedBlocking => "failed_blocking",
            RunStatus::Succeeded => "succeeded",
        }
    }

    /// Whether an explicit `resume` may continue a run in this status.
    ///
    /// `Running` is accepted so a run interrupted by a crash can be picked up again.
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            RunStatus::Paused | RunStatus::FailedRecoverable | RunStatus::Running
        )
    }
}

/// Outcome recorded on each [`StageResult`](crate::io::state::StageResult).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    CheckFailed,
    ToolError,
    Blocked,
}

/// Whether a stage invocation is the stage's own work or the single repair pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationKind {
    Primary,
    Remediation,
}

/// When the orchestrator hands control back to a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PausePolicy {
    pub after_each_stage: bool,
    pub on_change_threshold: bool,
}

impl Default for PausePolicy {
    fn default() -> Self {
        Self {
            after_each_stage: false,
            on_change_threshold: true,
        }
    }
}

/// Per-stage change limits. `None` disables a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeThresholds {
    pub max_changed_files: Option<usize>,
    pub max_changed_lines: Option<usize>,
}

impl Default for ChangeThresholds {
    fn default() -> Self {
        Self {
            max_changed_files: Some(20),
            max_changed_lines: Some(500),
        }
    }
}

/// Size of the change one invocation made to `notes_root`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMetrics {
    pub files_added: usize,
    pub files_modified: usize,
    pub files_deleted: usize,
    pub files_changed: usize,
    pub lines_added: usize,
    pub lines_removed: usize,
    pub lines_changed: usize,
    /// Set when a configured threshold was exceeded.
    pub exceeded: Option<String>,
}

impl ChangeThresholds {
    /// Describe the first exceeded limit, files before lines.
    pub fn breach(&self, files_changed: usize, lines_changed: usize) -> Option<String> {
        if let Some(max) = self.max_changed_files
            && files_changed > max
        {
            return Some(format!("changed_files {files_changed} > {max}"));
        }
        if let Some(max) = self.max_changed_lines
            && lines_changed > max
        {
            return Some(format!("changed_lines {lines_changed} > {max}"));
        }
        None
    }
}

/// Name of a validation rule in a check report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckRule {
    RequiredPaths,
    WellFormed,
    Attribution,
    LanguageRatio,
    FeedbackClosed,
    SnapshotIntegrity,
    CheckScript,
}

/// Result of one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule: CheckRule,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl RuleResult {
    pub fn from_errors(rule: CheckRule, errors: Vec<String>) -> Self {
        Self {
            rule,
            passed: errors.is_empty(),
            errors,
            warnings: Vec::new(),
        }
    }
}

/// Structured pass/fail report persisted as `check_result.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub passed: bool,
    pub rules: Vec<RuleResult>,
}

impl CheckReport {
    pub fn from_rules(rules: Vec<RuleResult>) -> Self {
        Self {
            passed: rules.iter().all(|rule| rule.passed),
            rules,
        }
    }

    pub fn integrity_failed(&self) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.rule == CheckRule::SnapshotIntegrity && !rule.passed)
    }

    pub fn errors(&self) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .flat_map(|rule| rule.errors.iter().map(String::as_str))
    }

    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .flat_map(|rule| rule.warnings.iter().map(String::as_str))
    }

    /// Short human-readable summary of the first few errors.
    pub fn error_summary(&self) -> String {
        let errors: Vec<&str> = self.errors().take(3).collect();
        if errors.is_empty() {
            "check failed".to_string()
        } else {
            errors.join("; ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breach_reports_files_before_lines() {
        let thresholds = ChangeThresholds {
            max_changed_files: Some(1),
            max_changed_lines: Some(10),
        };
        assert_eq!(
            thresholds.breach(3, 80).as_deref(),
            Some("changed_files 3 > 1")
        );
        assert_eq!(
            thresholds.breach(1, 80).as_deref(),
            Some("changed_lines 80 > 10")
        );
        assert_eq!(thresholds.breach(1, 10), None);
    }

    #[test]
    fn disabled_thresholds_never_breach() {
        let thresholds = ChangeThresholds {
            max_changed_files: None,
            max_changed_lines: None,
        };
        assert_eq!(thresholds.breach(10_000, 1_000_000), None);
    }

    #[test]
    fn report_passes_only_when_every_rule_passes() {
        let report = CheckReport::from_rules(vec![
            RuleResult::from_errors(CheckRule::RequiredPaths, Vec::new()),
            RuleResult::from_errors(CheckRule::SnapshotIntegrity, vec!["missing a.md".into()]),
        ]);
        assert!(!report.passed);
        assert!(report.integrity_failed());
        assert_eq!(report.error_summary(), "missing a.md");
    }

    #[test]
    fn run_status_round_trips_snake_case() {
        let json = serde_json::to_string(&RunStatus::FailedRecoverable).expect("serialize");
        assert_eq!(json, "\"failed_recoverable\"");
        assert!(RunStatus::Paused.is_resumable());
        assert!(!RunStatus::FailedBlocking.is_resumable());
        assert!(!RunStatus::Succeeded.is_resumable());
    }
}

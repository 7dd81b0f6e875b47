//! Deterministic classification of failed tool attempts.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Why a tool attempt failed. Drives retry and halt decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The tool needs an interactive login. Surfaced verbatim, never retried.
    AuthRequired,
    /// Stream, network or timeout trouble. Retried automatically.
    Transient,
    /// Sandbox or approval refusal. Never retried, halts the project.
    Permission,
    /// Anything else. Not retried, recoverable.
    Unclassified,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        self == FailureKind::Transient
    }

    pub fn is_blocking(self) -> bool {
        matches!(self, FailureKind::AuthRequired | FailureKind::Permission)
    }
}

const AUTH_MARKERS: &[&str] = &[
    "not logged in",
    "please log in",
    "login required",
    "authentication required",
    "codex login",
    "invalid api key",
    "401 unauthorized",
];

const PERMISSION_MARKERS: &[&str] = &[
    "permission denied",
    "operation not permitted",
    "sandbox denied",
    "blocked by sandbox",
    "sandbox violation",
    "approval required",
    "rejected by policy",
    "read-only file system",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "stream disconnected",
    "error sending request",
    "reconnecting",
    "connection reset",
    "connection refused",
    "temporarily unavailable",
    "stream error",
];

static GATEWAY_STATUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b50[234]\b").expect("valid regex"));

/// `error:`-style lines, optionally behind a `[timestamp]` prefix.
static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:\[[^\]]*\]\s*)?(?:error|fatal)\b").expect("valid regex")
});

/// Classify one attempt. Returns `None` when the attempt succeeded.
///
/// Only the tool's own diagnostics are inspected (see [`diagnostic_lines`]),
/// so command output echoed earlier in the transcript cannot change the
/// class. Markers match case-insensitively: auth first, then permission,
/// then transient. A timeout is always transient.
pub fn classify_attempt(
    exit_code: Option<i32>,
    timed_out: bool,
    output: &str,
) -> Option<FailureKind> {
    if timed_out {
        return Some(FailureKind::Transient);
    }
    if exit_code == Some(0) {
        return None;
    }
    let diagnostics = diagnostic_lines(output).join("\n").to_lowercase();
    let contains_any = |markers: &[&str]| {
        markers
            .iter()
            .any(|marker| diagnostics.contains(marker))
    };
    if contains_any(AUTH_MARKERS) {
        return Some(FailureKind::AuthRequired);
    }
    if contains_any(PERMISSION_MARKERS) {
        return Some(FailureKind::Permission);
    }
    if contains_any(TRANSIENT_MARKERS) || GATEWAY_STATUS.is_match(&diagnostics) {
        return Some(FailureKind::Transient);
    }
    Some(FailureKind::Unclassified)
}

/// The lines a failed attempt reported about itself: every error line, or the
/// last non-empty line when there is none.
pub fn diagnostic_lines(output: &str) -> Vec<&str> {
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let errors: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|line| ERROR_LINE.is_match(line))
        .collect();
    if errors.is_empty() {
        lines.last().copied().into_iter().collect()
    } else {
        errors
    }
}

/// Pick the most informative line of tool output for a halt reason.
///
/// Prefers the first error line, then the first non-empty line that is not a warning.
pub fn extract_error_line(output: &str) -> Option<String> {
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    lines
        .iter()
        .find(|line| ERROR_LINE.is_match(line))
        .or_else(|| {
            lines
                .iter()
                .find(|line| !line.to_lowercase().starts_with("warning"))
        })
        .map(|line| (*line).to_string())
}

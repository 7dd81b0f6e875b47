//! The fixed, totally ordered stage sequence of a generation workflow.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One stage of the pipeline. Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Round0,
    Round1,
    Round2,
    Round3,
    Final,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown stage `{0}` (expected round0, round1, round2, round3 or final)")]
pub struct UnknownStageError(pub String);

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Round0,
        Stage::Round1,
        Stage::Round2,
        Stage::Round3,
        Stage::Final,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Round0 => "round0",
            Stage::Round1 => "round1",
            Stage::Round2 => "round2",
            Stage::Round3 => "round3",
            Stage::Final => "final",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn next(self) -> Option<Stage> {
        Stage::ALL.get(self.index() + 1).copied()
    }

    /// Stages from `from` through `to`, inclusive. Empty when `from` is after `to`.
    pub fn range(from: Stage, to: Stage) -> Vec<Stage> {
        Stage::ALL
            .iter()
            .copied()
            .filter(|stage| *stage >= from && *stage <= to)
            .collect()
    }

    /// The stage that consumes queued review feedback.
    pub fn consumes_feedback(self) -> bool {
        self == Stage::Round3
    }

    /// Round0 scaffolds locally and is exempt from change thresholds.
    pub fn is_scaffold(self) -> bool {
        self == Stage::Round0
    }

    /// Task statement given to the generation tool for this stage.
    pub fn task(self) -> &'static str {
        match self {
            Stage::Round0 => "Repair the notes scaffold so that every required file exists and is well formed.",
            Stage::Round1 => "Draft a skeleton for each lecture from the snapshot material.",
            Stage::Round2 => "Expand the drafts with readable explanations, worked examples, exercises and common pitfalls.",
            Stage::Round3 => "Address the open review feedback items listed below and record a resolution for each.",
            Stage::Final => "Refresh the cheatsheet, clean up the glossary and make the notes consistent end to end.",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = UnknownStageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == needle)
            .ok_or_else(|| UnknownStageError(s.to_string()))
    }
}

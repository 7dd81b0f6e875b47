//! Read-only access to past runs and their per-invocation artifacts.

use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};

use crate::core::stage::Stage;
use crate::io::paths::{InvocationPaths, ProjectPaths};
use crate::io::state::{RunRecord, StageResult, list_stage_results, load_run_record};

/// A file recorded for one stage invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Patch,
    Log,
    Message,
    Manifest,
    Check,
}

impl Artifact {
    pub const ALL: [Artifact; 5] = [
        Artifact::Patch,
        Artifact::Log,
        Artifact::Message,
        Artifact::Manifest,
        Artifact::Check,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Artifact::Patch => "patch",
            Artifact::Log => "log",
            Artifact::Message => "message",
            Artifact::Manifest => "manifest",
            Artifact::Check => "check",
        }
    }

    fn path_in(self, invocation: &InvocationPaths) -> PathBuf {
        match self {
            Artifact::Patch => invocation.patch_path.clone(),
            Artifact::Log => invocation.stdout_log_path.clone(),
            Artifact::Message => invocation.last_message_path.clone(),
            Artifact::Manifest => invocation.manifest_path.clone(),
            Artifact::Check => invocation.check_result_path.clone(),
        }
    }
}

impl FromStr for Artifact {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Artifact::ALL
            .into_iter()
            .find(|artifact| artifact.as_str() == raw)
            .ok_or_else(|| {
                format!(
                    "unknown artifact `{raw}` (expected patch, log, message, manifest or check)"
                )
            })
    }
}

/// Every recorded run, newest first.
pub fn list_runs(paths: &ProjectPaths) -> Result<Vec<RunRecord>> {
    let mut runs = Vec::new();
    if !paths.runs_dir.is_dir() {
        return Ok(runs);
    }
    for entry in fs::read_dir(&paths.runs_dir)
        .with_context(|| format!("read {}", paths.runs_dir.display()))?
    {
        let entry = entry.with_context(|| format!("read entry in {}", paths.runs_dir.display()))?;
        let record_path = entry.path().join("run.json");
        if record_path.is_file() {
            runs.push(load_run_record(&record_path)?);
        }
    }
    runs.sort_by(|a, b| b.run_id.cmp(&a.run_id));
    Ok(runs)
}

/// Latest stage result of a run, optionally restricted to one stage.
pub fn latest_result(
    paths: &ProjectPaths,
    run_id: &str,
    stage: Option<Stage>,
) -> Result<StageResult> {
    let run_dir = paths.run_dir(run_id);
    if !run_dir.is_dir() {
        return Err(anyhow!("unknown run `{run_id}`"));
    }
    list_stage_results(&run_dir)?
        .into_iter()
        .rev()
        .find(|result| stage.is_none_or(|stage| result.stage == stage))
        .ok_or_else(|| match stage {
            Some(stage) => anyhow!("run `{run_id}` has no result for {stage}"),
            None => anyhow!("run `{run_id}` has no stage results"),
        })
}

/// Resolve an artifact of the latest matching invocation and read it.
pub fn read_artifact(
    paths: &ProjectPaths,
    run_id: &str,
    stage: Option<Stage>,
    artifact: Artifact,
) -> Result<(PathBuf, String)> {
    let result = latest_result(paths, run_id, stage)?;
    let invocation = paths.invocation_dir(run_id, result.seq, result.stage, result.invocation);
    let path = artifact.path_in(&invocation);
    let contents = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    Ok((path, contents))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ChangeMetrics, InvocationKind, RunStatus, StageOutcome};
    use crate::io::state::{ToolRecord, timestamp, write_run_record, write_stage_result};

    fn record(run_id: &str) -> RunRecord {
        RunRecord {
            run_id: run_id.to_string(),
            from_stage: Stage::Round1,
            to_stage: Stage::Final,
            status: RunStatus::Succeeded,
            last_completed_stage: Some(Stage::Final),
            halt_reason: None,
            snapshot_id: "20260101T000000Z".to_string(),
            target_lectures: Vec::new(),
            allow_external_refs: false,
            auto_remediate: true,
            created_at: timestamp(),
            updated_at: timestamp(),
        }
    }

    fn result(run_id: &str, seq: u32, stage: Stage, invocation: InvocationKind) -> StageResult {
        StageResult {
            run_id: run_id.to_string(),
            seq,
            stage,
            invocation,
            outcome: StageOutcome::Success,
            prompt: "prompt.md".to_string(),
            tool_log: None,
            tool_last_message: None,
            tool: ToolRecord {
                program: "codex".to_string(),
                attempts: 1,
                retry_count: 0,
                exit_code: Some(0),
                failure: None,
                message: None,
            },
            check: None,
            check_error: None,
            changes: ChangeMetrics::default(),
            stage_changes: ChangeMetrics::default(),
            created_at: timestamp(),
        }
    }

    #[test]
    fn list_runs_is_newest_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ProjectPaths::new(temp.path());
        for id in ["run-20260101T000000Z-aaaaaa", "run-20260301T000000Z-bbbbbb"] {
            write_run_record(&paths.run_record_path(id), &record(id)).expect("write run");
        }
        let ids: Vec<String> = list_runs(&paths)
            .expect("list")
            .into_iter()
            .map(|run| run.run_id)
            .collect();
        assert_eq!(
            ids,
            vec!["run-20260301T000000Z-bbbbbb", "run-20260101T000000Z-aaaaaa"]
        );
    }

    /// Verifies artifacts resolve to the latest invocation of the requested stage.
    #[test]
    fn read_artifact_prefers_latest_invocation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ProjectPaths::new(temp.path());
        let run_id = "run-1";
        let invocations = [
            (1, Stage::Round1, InvocationKind::Primary, "first"),
            (2, Stage::Round1, InvocationKind::Remediation, "fixed"),
            (3, Stage::Round2, InvocationKind::Primary, "second"),
        ];
        for (seq, stage, kind, patch) in invocations {
            let inv = paths.invocation_dir(run_id, seq, stage, kind);
            fs::create_dir_all(&inv.dir).expect("mkdir");
            fs::write(&inv.patch_path, patch).expect("patch");
            write_stage_result(&inv.stage_result_path, &result(run_id, seq, stage, kind))
                .expect("result");
        }

        let (_, round1) =
            read_artifact(&paths, run_id, Some(Stage::Round1), Artifact::Patch).expect("round1");
        assert_eq!(round1, "fixed");
        let (_, latest) = read_artifact(&paths, run_id, None, Artifact::Patch).expect("latest");
        assert_eq!(latest, "second");

        let err = read_artifact(&paths, run_id, Some(Stage::Final), Artifact::Patch)
            .expect_err("no final");
        assert!(err.to_string().contains("no result for final"));
        assert!(read_artifact(&paths, "run-missing", None, Artifact::Log).is_err());
    }

    #[test]
    fn artifact_parses_names() {
        assert_eq!("check".parse::<Artifact>(), Ok(Artifact::Check));
        assert!("diff".parse::<Artifact>().is_err());
    }
}

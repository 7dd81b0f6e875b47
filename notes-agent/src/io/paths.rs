//! Canonical file locations under a project root.

use std::path::{Path, PathBuf};

use crate::core::stage::Stage;
use crate::core::types::InvocationKind;

/// All canonical paths owned by a project (`project_root`).
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub project_config_path: PathBuf,
    pub settings_path: PathBuf,
    pub state_dir: PathBuf,
    pub round_status_path: PathBuf,
    pub pause_request_path: PathBuf,
    pub run_lock_path: PathBuf,
    pub feedback_path: PathBuf,
    pub round0_marker_path: PathBuf,
    pub runs_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub snapshot_history_dir: PathBuf,
    pub source_index_path: PathBuf,
    pub source_hashes_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join("state");
        let artifacts_dir = root.join("artifacts");
        Self {
            project_config_path: root.join("project.yaml"),
            settings_path: root.join("agent.toml"),
            round_status_path: state_dir.join("round_status.json"),
            pause_request_path: state_dir.join("pause_request.json"),
            run_lock_path: state_dir.join("run.lock"),
            feedback_path: state_dir.join("feedback.json"),
            round0_marker_path: state_dir.join("round0_initialized_at.txt"),
            runs_dir: root.join("runs"),
            snapshots_dir: artifacts_dir.join("snapshots"),
            snapshot_history_dir: artifacts_dir.join("snapshot_history"),
            source_index_path: artifacts_dir.join("source_index.json"),
            source_hashes_path: artifacts_dir.join("source_hashes.json"),
            state_dir,
            artifacts_dir,
            root,
        }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    pub fn run_record_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("run.json")
    }

    pub fn snapshot_dir(&self, snapshot_id: &str) -> PathBuf {
        self.snapshots_dir.join(snapshot_id)
    }

    /// Directory of one stage invocation, e.g. `runs/<id>/003-round2-remediation`.
    pub fn invocation_dir(
        &self,
        run_id: &str,
        seq: u32,
        stage: Stage,
        kind: InvocationKind,
    ) -> InvocationPaths {
        let name = match kind {
            InvocationKind::Primary => format!("{seq:03}-{stage}"),
            InvocationKind::Remediation => format!("{seq:03}-{stage}-remediation"),
        };
        InvocationPaths::new(self.run_dir(run_id).join(name))
    }
}

/// Files written for one stage invocation.
#[derive(Debug, Clone)]
pub struct InvocationPaths {
    pub dir: PathBuf,
    pub prompt_path: PathBuf,
    pub stdout_log_path: PathBuf,
    pub last_message_path: PathBuf,
    pub manifest_path: PathBuf,
    pub check_result_path: PathBuf,
    pub patch_path: PathBuf,
    pub diff_summary_path: PathBuf,
    /// Cumulative patch since the stage's first invocation began.
    pub stage_patch_path: PathBuf,
    pub notes_snapshot_dir: PathBuf,
    pub stage_result_path: PathBuf,
}

impl InvocationPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            prompt_path: dir.join("prompt.md"),
            stdout_log_path: dir.join("tool_stdout.log"),
            last_message_path: dir.join("tool_last_message.md"),
            manifest_path: dir.join("run_manifest.json"),
            check_result_path: dir.join("check_result.json"),
            patch_path: dir.join("changes.patch"),
            diff_summary_path: dir.join("diff_summary.json"),
            stage_patch_path: dir.join("stage_changes.patch"),
            notes_snapshot_dir: dir.join("notes_snapshot"),
            stage_result_path: dir.join("stage_result.json"),
            dir,
        }
    }
}

/// Whether `inner` equals `outer` or lies beneath it, by path components.
pub fn is_within(inner: &Path, outer: &Path) -> bool {
    inner.starts_with(outer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_dirs_are_sequenced_and_tagged() {
        let paths = ProjectPaths::new("/p");
        let primary = paths.invocation_dir("run-1", 2, Stage::Round2, InvocationKind::Primary);
        let repair = paths.invocation_dir("run-1", 3, Stage::Round2, InvocationKind::Remediation);
        assert_eq!(primary.dir, PathBuf::from("/p/runs/run-1/002-round2"));
        assert_eq!(
            repair.stage_result_path,
            PathBuf::from("/p/runs/run-1/003-round2-remediation/stage_result.json")
        );
    }

    #[test]
    fn is_within_compares_components() {
        assert!(is_within(Path::new("/a/b/c"), Path::new("/a/b")));
        assert!(!is_within(Path::new("/a/bc"), Path::new("/a/b")));
    }
}

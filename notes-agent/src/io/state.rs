//! Durable, crash-safe workflow state under `project_root`.
//!
//! Every write goes to a sibling temp file, is fsynced, then renamed over the
//! target, so readers observe either the old or the new document.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::classifier::FailureKind;
use crate::core::stage::Stage;
use crate::core::types::{
    ChangeMetrics, CheckReport, InvocationKind, RunStatus, StageOutcome,
};

/// RFC 3339 UTC timestamp used in every persisted record.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Durable projection of where the project is (`state/round_status.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStatus {
    pub status: RunStatus,
    pub last_completed_stage: Option<Stage>,
    pub active_run_id: Option<String>,
    /// Human-readable reason for the latest halt.
    pub pause_reason: Option<String>,
    pub target_stage: Option<Stage>,
    pub updated_at: Option<String>,
}

/// One run (`runs/<run_id>/run.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub from_stage: Stage,
    pub to_stage: Stage,
    pub status: RunStatus,
    pub last_completed_stage: Option<Stage>,
    pub halt_reason: Option<String>,
    pub snapshot_id: String,
    #[serde(default)]
    pub target_lectures: Vec<String>,
    #[serde(default)]
    pub allow_external_refs: bool,
    pub auto_remediate: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// How the tool side of one invocation went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRecord {
    /// `codex` or `scaffold` for the local Round0 initializer.
    pub program: String,
    pub attempts: u32,
    pub retry_count: u32,
    pub exit_code: Option<i32>,
    pub failure: Option<FailureKind>,
    pub message: Option<String>,
}

/// Immutable record of one stage invocation (`stage_result.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub run_id: String,
    pub seq: u32,
    pub stage: Stage,
    pub invocation: InvocationKind,
    pub outcome: StageOutcome,
    pub prompt: String,
    /// Paths relative to the invocation directory.
    pub tool_log: Option<String>,
    pub tool_last_message: Option<String>,
    pub tool: ToolRecord,
    pub check: Option<CheckReport>,
    pub check_error: Option<String>,
    /// What this invocation alone changed.
    pub changes: ChangeMetrics,
    /// Everything the stage has changed so far. The change gate judges this.
    #[serde(default)]
    pub stage_changes: ChangeMetrics,
    pub created_at: String,
}

/// Operator request to halt at the next stage boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseRequest {
    pub reason: String,
    pub requested_at: String,
}

pub fn load_round_status(path: &Path) -> Result<RoundStatus> {
    if !path.exists() {
        debug!(path = %path.display(), "no round status, defaulting to pending");
        return Ok(RoundStatus::default());
    }
    read_json(path)
}

pub fn write_round_status(path: &Path, status: &RoundStatus) -> Result<()> {
    debug!(status = status.status.as_str(), run_id = ?status.active_run_id, "writing round status");
    write_json_atomic(path, status)
}

pub fn load_run_record(path: &Path) -> Result<RunRecord> {
    read_json(path)
}

pub fn write_run_record(path: &Path, record: &RunRecord) -> Result<()> {
    debug!(run_id = %record.run_id, status = record.status.as_str(), "writing run record");
    write_json_atomic(path, record)
}

/// Persist a stage result. Results are append-only: an existing file is an error.
pub fn write_stage_result(path: &Path, result: &StageResult) -> Result<()> {
    if path.exists() {
        return Err(anyhow!(
            "stage result already recorded at {}",
            path.display()
        ));
    }
    debug!(
        seq = result.seq,
        stage = %result.stage,
        outcome = ?result.outcome,
        "writing stage result"
    );
    write_json_atomic(path, result)
}

/// Every stage result of a run, ordered by sequence number.
pub fn list_stage_results(run_dir: &Path) -> Result<Vec<StageResult>> {
    let mut results = Vec::new();
    if !run_dir.exists() {
        return Ok(results);
    }
    for entry in fs::read_dir(run_dir).with_context(|| format!("read {}", run_dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", run_dir.display()))?;
        let path = entry.path().join("stage_result.json");
        if path.is_file() {
            results.push(read_json::<StageResult>(&path)?);
        }
    }
    results.sort_by_key(|result| result.seq);
    Ok(results)
}

/// Sequence number for the next stage result of a run.
pub fn next_seq(run_dir: &Path) -> Result<u32> {
    Ok(list_stage_results(run_dir)?
        .last()
        .map_or(1, |result| result.seq + 1))
}

pub fn write_pause_request(path: &Path, request: &PauseRequest) -> Result<()> {
    write_json_atomic(path, request)
}

/// Consume a pending pause request, if any.
pub fn take_pause_request(path: &Path) -> Result<Option<PauseRequest>> {
    if !path.exists() {
        return Ok(None);
    }
    let request: PauseRequest = read_json(path)?;
    fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
    Ok(Some(request))
}

pub fn clear_pause_request(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
    }
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Serialize `value` as pretty JSON with a trailing newline and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

/// Write-temp, fsync, rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);

    let mut file = File::create(&tmp_path)
        .with_context(|| format!("create temp file {}", tmp_path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync temp file {}", tmp_path.display()))?;
    drop(file);
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

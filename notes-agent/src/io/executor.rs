//! External generation tool invocation.
//!
//! The [`Executor`] trait is one subprocess attempt. [`run_tool`] owns the
//! retry loop, failure classification and the durable run manifest, so tests
//! substitute a scripted executor without spawning processes.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::{FailureKind, classify_attempt, extract_error_line};
use crate::core::decision::ToolVerdict;
use crate::core::stage::Stage;
use crate::core::types::InvocationKind;
use crate::io::config::{SandboxMode, ToolSettings};
use crate::io::paths::{InvocationPaths, is_within};
use crate::io::process::run_captured;
use crate::io::project::ProjectConfig;
use crate::io::state::{timestamp, write_json_atomic};

/// Approval mode passed to every invocation. Never waits on a human.
pub const APPROVAL_MODE: &str = "never";

/// The tool invocation could not be set up within the allowed boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invocation contract violated: {0}")]
pub struct ContractViolation(pub String);

/// Boundaries every tool invocation for a project runs within.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationContract {
    pub working_dir: PathBuf,
    pub writable_dirs: Vec<PathBuf>,
    pub sandbox_mode: SandboxMode,
    pub approval_mode: String,
    pub network_access: bool,
    #[serde(skip)]
    pub snapshot_store: PathBuf,
}

impl InvocationContract {
    pub fn for_project(config: &ProjectConfig, settings: &ToolSettings) -> Self {
        Self {
            working_dir: config.project_root.clone(),
            writable_dirs: vec![config.notes_root.clone()],
            sandbox_mode: settings.sandbox_mode,
            approval_mode: APPROVAL_MODE.to_string(),
            network_access: config.network_allowed,
            snapshot_store: config.paths().artifacts_dir,
        }
    }

    pub fn notes_root(&self) -> Option<&Path> {
        self.writable_dirs.first().map(PathBuf::as_path)
    }

    pub fn validate(&self) -> Result<(), ContractViolation> {
        let violation = |msg: String| Err(ContractViolation(msg));
        if self.sandbox_mode == SandboxMode::DangerFullAccess {
            return violation("sandbox mode danger-full-access is not permitted".to_string());
        }
        if self.approval_mode != APPROVAL_MODE {
            return violation(format!("approval mode must be `{APPROVAL_MODE}`"));
        }
        let [notes_root] = self.writable_dirs.as_slice() else {
            return violation("writable dirs must be exactly notes_root".to_string());
        };
        if notes_root == &self.working_dir {
            return violation("notes_root must not be the working directory".to_string());
        }
        if is_within(notes_root, &self.snapshot_store)
            || is_within(&self.snapshot_store, notes_root)
        {
            return violation(format!(
                "notes_root {} overlaps the snapshot store",
                notes_root.display()
            ));
        }
        if !self.working_dir.is_dir() {
            return violation(format!(
                "working directory {} does not exist",
                self.working_dir.display()
            ));
        }
        if !notes_root.is_dir() {
            return violation(format!("notes_root {} does not exist", notes_root.display()));
        }
        Ok(())
    }
}

/// Parameters for one attempt.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub contract: InvocationContract,
    pub prompt: String,
    /// Where the tool writes its final message.
    pub last_message_path: PathBuf,
    /// stdout is tee'd here while the tool runs; stderr is appended at the end.
    pub stdout_log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// What one attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// stdout then stderr, bounded by `output_limit_bytes` per stream.
    pub output: String,
}

/// Abstraction over the generation tool backend.
pub trait Executor {
    /// Run one attempt. Expected tool failures are reported through [`ExecOutput`].
    fn exec(&self, request: &ExecRequest) -> Result<ExecOutput>;

    /// Exact command line for the manifest.
    fn command_line(&self, request: &ExecRequest) -> Vec<String>;

    /// Tool version, when obtainable.
    fn version(&self) -> Option<String> {
        None
    }
}

impl<E: Executor + ?Sized> Executor for &E {
    fn exec(&self, request: &ExecRequest) -> Result<ExecOutput> {
        (**self).exec(request)
    }

    fn command_line(&self, request: &ExecRequest) -> Vec<String> {
        (**self).command_line(request)
    }

    fn version(&self) -> Option<String> {
        (**self).version()
    }
}

/// Executor that spawns `codex exec`.
#[derive(Debug)]
pub struct CodexExecutor {
    program: String,
    model: Option<String>,
    extra_args: Vec<String>,
    version: OnceLock<Option<String>>,
}

impl CodexExecutor {
    pub fn new(settings: &ToolSettings) -> Self {
        Self {
            program: settings.program.clone(),
            model: settings.model.clone(),
            extra_args: settings.extra_args.clone(),
            version: OnceLock::new(),
        }
    }

    fn args(&self, request: &ExecRequest) -> Vec<String> {
        let contract = &request.contract;
        let mut args = vec![
            "--ask-for-approval".to_string(),
            contract.approval_mode.clone(),
            "exec".to_string(),
            "--cd".to_string(),
            contract.working_dir.display().to_string(),
            "--sandbox".to_string(),
            contract.sandbox_mode.as_str().to_string(),
        ];
        for dir in &contract.writable_dirs {
            args.push("--add-dir".to_string());
            args.push(dir.display().to_string());
        }
        args.push("--skip-git-repo-check".to_string());
        args.push("--output-last-message".to_string());
        args.push(request.last_message_path.display().to_string());
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if contract.network_access && contract.sandbox_mode == SandboxMode::WorkspaceWrite {
            args.push("-c".to_string());
            args.push("sandbox_workspace_write.network_access=true".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        // Prompt is read from stdin.
        args.push("-".to_string());
        args
    }
}

impl Executor for CodexExecutor {
    #[instrument(
        skip_all,
        fields(program = %self.program, timeout_secs = request.timeout.as_secs())
    )]
    fn exec(&self, request: &ExecRequest) -> Result<ExecOutput> {
        info!(workdir = %request.contract.working_dir.display(), "starting codex exec");
        if let Some(parent) = request.last_message_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(self.args(request))
            .current_dir(&request.contract.working_dir);

        let output = run_captured(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
            Some(&request.stdout_log_path),
        )
        .context("run codex exec")?;

        append_stderr(&request.stdout_log_path, &output.stderr_text(), output.timed_out)?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "codex exec timed out");
        } else if !output.status.success() {
            warn!(exit_code = ?output.exit_code(), "codex exec failed");
        } else {
            debug!("codex exec completed successfully");
        }

        Ok(ExecOutput {
            exit_code: output.exit_code(),
            timed_out: output.timed_out,
            output: output.combined_text(),
        })
    }

    fn command_line(&self, request: &ExecRequest) -> Vec<String> {
        let mut line = vec![self.program.clone()];
        line.extend(self.args(request));
        line
    }

    fn version(&self) -> Option<String> {
        self.version
            .get_or_init(|| {
                let mut cmd = Command::new(&self.program);
                cmd.arg("--version");
                match run_captured(cmd, None, Duration::from_secs(10), 4_096, None) {
                    Ok(output) if output.status.success() => {
                        Some(output.stdout_text().trim().to_string()).filter(|v| !v.is_empty())
                    }
                    Ok(_) => None,
                    Err(err) => {
                        debug!(err = %err, "tool version unavailable");
                        None
                    }
                }
            })
            .clone()
    }
}

fn append_stderr(log_path: &Path, stderr: &str, timed_out: bool) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("open {}", log_path.display()))?;
    let mut buf = String::from("\n=== stderr ===\n");
    buf.push_str(stderr);
    if timed_out {
        buf.push_str("\n[timed out]\n");
    }
    file.write_all(buf.as_bytes())
        .with_context(|| format!("append {}", log_path.display()))
}

/// Automatic retry behaviour for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &ToolSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            backoff: Duration::from_millis(settings.retry_backoff_ms),
        }
    }
}

/// One attempt as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: String,
    pub ended_at: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub failure: Option<FailureKind>,
    pub message: Option<String>,
}

/// `run_manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub stage: Stage,
    pub seq: u32,
    pub invocation: InvocationKind,
    pub command: Vec<String>,
    pub tool_version: Option<String>,
    pub working_dir: PathBuf,
    pub writable_dirs: Vec<PathBuf>,
    pub sandbox_mode: SandboxMode,
    pub approval_mode: String,
    pub network_access: bool,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_count: u32,
    pub attempts: Vec<AttemptRecord>,
    pub final_exit_code: Option<i32>,
    pub success: bool,
    pub failure: Option<FailureKind>,
    pub created_at: String,
}

/// Identity of the invocation being run.
#[derive(Debug, Clone, Copy)]
pub struct InvocationId<'a> {
    pub run_id: &'a str,
    pub stage: Stage,
    pub seq: u32,
    pub kind: InvocationKind,
}

/// Result of [`run_tool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRun {
    pub verdict: ToolVerdict,
    pub attempts: u32,
    pub retry_count: u32,
    pub exit_code: Option<i32>,
}

/// Run the tool with automatic retries for transient failures.
///
/// Auth and permission failures are never retried. The manifest is rewritten
/// after every attempt so a crash mid-retry still leaves a durable record.
#[instrument(skip_all, fields(run_id = id.run_id, stage = %id.stage, seq = id.seq))]
pub fn run_tool<E: Executor>(
    executor: &E,
    id: InvocationId<'_>,
    request: &ExecRequest,
    paths: &InvocationPaths,
    retry: RetryPolicy,
) -> Result<ToolRun> {
    let mut manifest = RunManifest {
        run_id: id.run_id.to_string(),
        stage: id.stage,
        seq: id.seq,
        invocation: id.kind,
        command: executor.command_line(request),
        tool_version: executor.version(),
        working_dir: request.contract.working_dir.clone(),
        writable_dirs: request.contract.writable_dirs.clone(),
        sandbox_mode: request.contract.sandbox_mode,
        approval_mode: request.contract.approval_mode.clone(),
        network_access: request.contract.network_access,
        timeout_secs: request.timeout.as_secs(),
        max_retries: retry.max_retries,
        retry_count: 0,
        attempts: Vec::new(),
        final_exit_code: None,
        success: false,
        failure: None,
        created_at: timestamp(),
    };

    let max_attempts = retry.max_retries + 1;
    let mut attempt = 0u32;
    let verdict = loop {
        attempt += 1;
        let started_at = timestamp();
        let (exit_code, timed_out, failure, message) = match executor.exec(request) {
            Ok(output) => {
                let failure = classify_attempt(output.exit_code, output.timed_out, &output.output);
                let message = failure.map(|_| failure_message(&output, request.timeout));
                (output.exit_code, output.timed_out, failure, message)
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), attempt, "tool attempt could not run");
                (None, false, Some(FailureKind::Unclassified), Some(format!("{err:#}")))
            }
        };
        manifest.attempts.push(AttemptRecord {
            attempt,
            started_at,
            ended_at: timestamp(),
            exit_code,
            timed_out,
            failure,
            message: message.clone(),
        });
        manifest.final_exit_code = exit_code;
        manifest.retry_count = attempt - 1;
        manifest.failure = failure;
        manifest.success = failure.is_none();
        write_json_atomic(&paths.manifest_path, &manifest)?;

        match failure {
            None => break ToolVerdict::Completed,
            Some(kind) if kind.is_retryable() && attempt < max_attempts => {
                let delay = retry.backoff * attempt;
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "transient tool failure, retrying"
                );
                thread::sleep(delay);
            }
            Some(kind) => {
                break ToolVerdict::Failed {
                    kind,
                    message: message.unwrap_or_else(|| "tool failed".to_string()),
                    attempts: attempt,
                };
            }
        }
    };

    info!(attempts = attempt, success = manifest.success, "tool invocation finished");
    Ok(ToolRun {
        verdict,
        attempts: attempt,
        retry_count: attempt - 1,
        exit_code: manifest.final_exit_code,
    })
}

fn failure_message(output: &ExecOutput, timeout: Duration) -> String {
    if output.timed_out {
        return format!("timed out after {}s", timeout.as_secs());
    }
    extract_error_line(&output.output)
        .unwrap_or_else(|| format!("exit code {:?}", output.exit_code))
}

//! Test-only doubles and fixtures for driving the workflow without a real tool.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::types::{CheckReport, CheckRule, RuleResult};
use crate::io::check::{CheckRequest, CheckRunner};
use crate::io::config::{AgentSettings, write_settings};
use crate::io::executor::{ExecOutput, ExecRequest, Executor};
use crate::io::project::{CreateProjectRequest, ProjectConfig, create_project, write_project};
use crate::io::snapshot::{SnapshotStore, SourceInput, SourceSnapshot};
use crate::workflow::WorkflowOrchestrator;

/// One scripted tool attempt.
#[derive(Debug, Clone)]
pub struct ScriptedExec {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub output: String,
    /// Files written into `notes_root` before the attempt returns.
    pub writes: Vec<(String, String)>,
}

impl ScriptedExec {
    /// A successful attempt that writes `writes` into `notes_root`.
    pub fn success(writes: Vec<(&str, String)>) -> Self {
        Self {
            exit_code: Some(0),
            timed_out: false,
            output: "done".to_string(),
            writes: writes
                .into_iter()
                .map(|(rel, body)| (rel.to_string(), body))
                .collect(),
        }
    }

    /// A failed attempt with the given exit code and output.
    pub fn failure(exit_code: i32, output: &str) -> Self {
        Self {
            exit_code: Some(exit_code),
            timed_out: false,
            output: output.to_string(),
            writes: Vec::new(),
        }
    }

    /// An attempt killed at the timeout, with no exit code.
    pub fn timeout() -> Self {
        Self {
            exit_code: None,
            timed_out: true,
            output: String::new(),
            writes: Vec::new(),
        }
    }
}

/// Executor that replays queued attempts in order.
///
/// Running out of scripted attempts is an executor error.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    queue: RefCell<VecDeque<ScriptedExec>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new(execs: Vec<ScriptedExec>) -> Self {
        Self {
            queue: RefCell::new(execs.into()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.borrow().len()
    }

    pub fn remaining(&self) -> usize {
        self.queue.borrow().len()
    }
}

impl Executor for ScriptedExecutor {
    fn exec(&self, request: &ExecRequest) -> Result<ExecOutput> {
        self.prompts.borrow_mut().push(request.prompt.clone());
        let exec = self
            .queue
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted executor response left"))?;
        let notes_root = request
            .contract
            .notes_root()
            .context("contract has no notes_root")?;
        for (rel, body) in &exec.writes {
            write_file(&notes_root.join(rel), body)?;
        }
        write_file(&request.stdout_log_path, &exec.output)?;
        if exec.exit_code == Some(0) {
            write_file(&request.last_message_path, "scripted run complete\n")?;
        }
        Ok(ExecOutput {
            exit_code: exec.exit_code,
            timed_out: exec.timed_out,
            output: exec.output,
        })
    }

    fn command_line(&self, _request: &ExecRequest) -> Vec<String> {
        vec!["scripted".to_string()]
    }
}

/// Check runner that replays queued results, then passes.
#[derive(Debug, Default)]
pub struct ScriptedCheckRunner {
    queue: RefCell<VecDeque<Result<CheckReport, String>>>,
    calls: RefCell<usize>,
}

impl ScriptedCheckRunner {
    pub fn new(results: Vec<Result<CheckReport, String>>) -> Self {
        Self {
            queue: RefCell::new(results.into()),
            calls: RefCell::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.borrow()
    }
}

impl CheckRunner for ScriptedCheckRunner {
    fn validate(&self, _request: &CheckRequest<'_>) -> Result<CheckReport> {
        *self.calls.borrow_mut() += 1;
        match self.queue.borrow_mut().pop_front() {
            Some(Ok(report)) => Ok(report),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(passing_report()),
        }
    }
}

pub fn passing_report() -> CheckReport {
    CheckReport::from_rules(vec![RuleResult::from_errors(
        CheckRule::RequiredPaths,
        Vec::new(),
    )])
}

pub fn failing_report(error: &str) -> CheckReport {
    CheckReport::from_rules(vec![RuleResult::from_errors(
        CheckRule::WellFormed,
        vec![error.to_string()],
    )])
}

/// `n` distinct markdown lines.
pub fn lines(prefix: &str, n: usize) -> String {
    (0..n).map(|i| format!("{prefix} line {i}\n")).collect()
}

/// Make a snapshot tree writable again so it can be modified or removed.
pub fn make_tree_writable(root: &Path) {
    for entry in walkdir::WalkDir::new(root).into_iter().flatten() {
        if let Ok(meta) = entry.metadata() {
            let mut perms = meta.permissions();
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                perms.set_mode(if meta.is_dir() { 0o755 } else { 0o644 });
            }
            #[cfg(not(unix))]
            perms.set_readonly(false);
            let _ = fs::set_permissions(entry.path(), perms);
        }
    }
}

/// A project in a temp workspace with one captured source snapshot.
pub struct TestProject {
    temp: TempDir,
    pub config: ProjectConfig,
    pub snapshot: SourceSnapshot,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let workspace = temp.path().join("ws");
        let config = create_project(
            &CreateProjectRequest {
                course_id: "Algorithms 101".to_string(),
                workspace_root: Some(workspace),
                ..CreateProjectRequest::default()
            },
            false,
        )?;

        let sources = temp.path().join("sources");
        write_file(&sources.join("lecture01.md"), "# Sorting\nquick sort\n")?;
        write_file(&sources.join("lecture02.md"), "# Graphs\nbfs and dfs\n")?;
        let snapshot = SnapshotStore::new(config.paths()).capture(
            &[SourceInput {
                path: sources,
                lecture: Some("01".to_string()),
            }],
            None,
        )?;

        let mut settings = AgentSettings::default();
        settings.tool.retry_backoff_ms = 0;
        write_settings(&config.paths().settings_path, &settings)?;

        Ok(Self {
            temp,
            config,
            snapshot,
        })
    }

    pub fn project_root(&self) -> &Path {
        &self.config.project_root
    }

    pub fn notes_root(&self) -> &Path {
        &self.config.notes_root
    }

    /// Apply `update` to the project config and persist it.
    pub fn configure(&mut self, update: impl FnOnce(&mut ProjectConfig)) -> Result<()> {
        update(&mut self.config);
        write_project(&self.config)
    }

    pub fn settings(&self) -> AgentSettings {
        let mut settings = AgentSettings::default();
        settings.tool.retry_backoff_ms = 0;
        settings
    }

    pub fn orchestrator<'a>(
        &self,
        executor: &'a ScriptedExecutor,
        check_runner: &'a ScriptedCheckRunner,
    ) -> Result<WorkflowOrchestrator<&'a ScriptedExecutor, &'a ScriptedCheckRunner>> {
        Ok(WorkflowOrchestrator::new(
            self.config.clone(),
            self.settings(),
            executor,
            check_runner,
        )?)
    }

    /// Overwrite one snapshot file behind the store's back.
    pub fn tamper_snapshot(&self) -> Result<()> {
        make_tree_writable(&self.snapshot.root);
        let file = self
            .snapshot
            .files
            .first()
            .context("snapshot has no files")?;
        write_file(&self.snapshot.root.join(&file.snapshot_path), "tampered\n")
    }
}

impl Drop for TestProject {
    fn drop(&mut self) {
        make_tree_writable(self.temp.path());
    }
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

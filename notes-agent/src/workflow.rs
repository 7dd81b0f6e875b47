//! Round-based workflow state machine for one project.
//!
//! A run executes its stages strictly in order on the calling thread. Between
//! stages the orchestrator honors pause requests, and a run always ends in a
//! durable status: `succeeded`, `paused`, `failed_recoverable` or
//! `failed_blocking`.

use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::decision::DecisionPolicy;
use crate::core::path::validate_component;
use crate::core::plan::{remaining_stages, validate_range};
use crate::core::stage::Stage;
use crate::core::types::RunStatus;
use crate::errors::WorkflowError;
use crate::io::check::{CheckRunner, NotesCheckRunner};
use crate::io::config::{AgentSettings, load_settings};
use crate::io::executor::{CodexExecutor, Executor, InvocationContract};
use crate::io::feedback::{FeedbackItem, load_feedback, mark_addressed, record_feedback};
use crate::io::lock::{LockHeld, RunLock, acquire_run_lock};
use crate::io::paths::ProjectPaths;
use crate::io::project::{ProjectConfig, load_project};
use crate::io::prompt::{DEFAULT_PROMPT_BUDGET, PromptBuilder};
use crate::io::snapshot::{
    Mismatch, SnapshotStore, SourceInput, SourceSnapshot, SourceUnreadableError,
};
use crate::io::state::{
    PauseRequest, RoundStatus, RunRecord, StageResult, clear_pause_request, load_round_status,
    load_run_record, take_pause_request, timestamp, write_pause_request, write_round_status,
    write_run_record,
};
use crate::stage::{StageContext, run_stage};

const RUN_ID_SUFFIX_LEN: usize = 6;

/// Why a run stopped before succeeding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Halt {
    /// Waiting for a human; `resume` continues.
    Paused { reason: String },
    /// `resume` retries the stage that failed.
    Recoverable { reason: String },
    /// Needs `clear_block` before anything else runs.
    Blocking { reason: String },
}

impl Halt {
    pub fn status(&self) -> RunStatus {
        match self {
            Halt::Paused { .. } => RunStatus::Paused,
            Halt::Recoverable { .. } => RunStatus::FailedRecoverable,
            Halt::Blocking { .. } => RunStatus::FailedBlocking,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Halt::Paused { reason } | Halt::Recoverable { reason } | Halt::Blocking { reason } => {
                reason
            }
        }
    }
}

/// Options for [`WorkflowOrchestrator::start`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub run_id: Option<String>,
    pub target_lectures: Vec<String>,
    /// The final stage may cite external material in a separate section.
    pub allow_external_refs: bool,
    /// Overrides the project's `auto_remediate`.
    pub auto_remediate: Option<bool>,
}

/// Options for [`WorkflowOrchestrator::resume`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ResumeOptions {
    /// Retarget the run's last stage.
    pub to_stage: Option<Stage>,
    /// Explicitly re-run from this stage, even if it already succeeded.
    pub restart_from: Option<Stage>,
}

/// What a start or resume call did.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub last_completed_stage: Option<Stage>,
    pub halt: Option<Halt>,
    /// Stage results produced by this call, in sequence order.
    pub stage_results: Vec<StageResult>,
}

/// Sequences stages for one project and owns its round status.
pub struct WorkflowOrchestrator<E, C> {
    config: ProjectConfig,
    settings: AgentSettings,
    paths: ProjectPaths,
    executor: E,
    check_runner: C,
    prompts: PromptBuilder,
}

impl WorkflowOrchestrator<CodexExecutor, NotesCheckRunner> {
    /// Load the project and operator settings and use the production backends.
    pub fn open(project_root: &Path) -> Result<Self, WorkflowError> {
        let config = load_project(project_root)?;
        let settings = load_settings(&config.paths().settings_path)?;
        let executor = CodexExecutor::new(&settings.tool);
        Self::new(config, settings, executor, NotesCheckRunner)
    }
}

impl<E: Executor, C: CheckRunner> WorkflowOrchestrator<E, C> {
    pub fn new(
        config: ProjectConfig,
        settings: AgentSettings,
        executor: E,
        check_runner: C,
    ) -> Result<Self, WorkflowError> {
        config.validate()?;
        settings.validate()?;
        Ok(Self {
            paths: config.paths(),
            config,
            settings,
            executor,
            check_runner,
            prompts: PromptBuilder::new(DEFAULT_PROMPT_BUDGET)?,
        })
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    pub fn status(&self) -> Result<RoundStatus, WorkflowError> {
        Ok(load_round_status(&self.paths.round_status_path)?)
    }

    /// Capture a new current snapshot of the given sources.
    pub fn snapshot(
        &self,
        inputs: &[SourceInput],
        snapshot_id: Option<&str>,
    ) -> Result<SourceSnapshot, WorkflowError> {
        SnapshotStore::new(self.paths.clone())
            .capture(inputs, snapshot_id)
            .map_err(|err| match err.downcast_ref::<SourceUnreadableError>() {
                Some(unreadable) => WorkflowError::SourceUnreadable {
                    path: unreadable.path.display().to_string(),
                    message: unreadable.message.clone(),
                },
                None => WorkflowError::Other(err),
            })
    }

    /// Start a new run over `from..=to`.
    #[instrument(skip_all, fields(course_id = %self.config.course_id, from = %from, to = %to))]
    pub fn start(
        &self,
        from: Stage,
        to: Stage,
        options: RunOptions,
    ) -> Result<RunOutcome, WorkflowError> {
        validate_range(from, to)?;
        let _lock = self.lock()?;
        let status = self.status()?;
        match status.status {
            RunStatus::FailedBlocking => {
                return Err(WorkflowError::Blocked {
                    reason: status.pause_reason.unwrap_or_default(),
                });
            }
            RunStatus::Running => {
                return Err(WorkflowError::RunActive {
                    run_id: status.active_run_id.unwrap_or_default(),
                });
            }
            _ => {}
        }

        let run_id = match options.run_id {
            Some(id) => {
                validate_component("run id", &id).map_err(WorkflowError::InvalidInput)?;
                id
            }
            None => generate_run_id(),
        };
        if self.paths.run_dir(&run_id).exists() {
            return Err(WorkflowError::RunExists { run_id });
        }
        let snapshot = self.current_snapshot()?;
        let contract = self.contract()?;

        if let Some(previous) = status.active_run_id.as_deref() {
            info!(previous, status = status.status.as_str(), "superseding previous run");
        }
        clear_pause_request(&self.paths.pause_request_path)?;

        let now = timestamp();
        let record = RunRecord {
            run_id,
            from_stage: from,
            to_stage: to,
            status: RunStatus::Running,
            last_completed_stage: None,
            halt_reason: None,
            snapshot_id: snapshot.snapshot_id.clone(),
            target_lectures: options.target_lectures,
            allow_external_refs: options.allow_external_refs,
            auto_remediate: options
                .auto_remediate
                .unwrap_or(self.config.auto_remediate),
            created_at: now.clone(),
            updated_at: now,
        };
        info!(run_id = %record.run_id, "run starting");
        self.execute(record, Stage::range(from, to), &snapshot, &contract)
    }

    /// Continue the active run after a pause, a recoverable failure or a crash.
    #[instrument(skip_all, fields(course_id = %self.config.course_id))]
    pub fn resume(&self, options: ResumeOptions) -> Result<RunOutcome, WorkflowError> {
        let _lock = self.lock()?;
        let status = self.status()?;
        if status.status == RunStatus::FailedBlocking {
            return Err(WorkflowError::Blocked {
                reason: status.pause_reason.unwrap_or_default(),
            });
        }
        let Some(run_id) = status.active_run_id.filter(|_| status.status.is_resumable()) else {
            return Err(WorkflowError::NoActiveRun);
        };
        let mut record = load_run_record(&self.paths.run_record_path(&run_id))?;

        let to = options.to_stage.unwrap_or(record.to_stage);
        if let Some(restart) = options.restart_from {
            validate_range(restart, to)?;
            record.from_stage = record.from_stage.min(restart);
            let rewound = stage_before(restart).filter(|prev| *prev >= record.from_stage);
            record.last_completed_stage = record.last_completed_stage.min(rewound);
        }
        let stages = remaining_stages(
            record.from_stage,
            to,
            record.last_completed_stage,
            options.restart_from,
        )?;
        record.to_stage = to;

        let snapshot = self.current_snapshot()?;
        if snapshot.snapshot_id != record.snapshot_id {
            warn!(
                recorded = %record.snapshot_id,
                current = %snapshot.snapshot_id,
                "resuming against a newer snapshot"
            );
            record.snapshot_id = snapshot.snapshot_id.clone();
        }
        let contract = self.contract()?;
        clear_pause_request(&self.paths.pause_request_path)?;

        record.status = RunStatus::Running;
        record.halt_reason = None;
        info!(run_id = %record.run_id, remaining = stages.len(), "run resuming");
        self.execute(record, stages, &snapshot, &contract)
    }

    /// Ask the running run to pause at its next stage boundary.
    ///
    /// Returns `false` when the project is already paused.
    pub fn pause(&self, reason: &str) -> Result<bool, WorkflowError> {
        let status = self.status()?;
        match status.status {
            RunStatus::Paused => Ok(false),
            RunStatus::Running => {
                let reason = match reason.trim() {
                    "" => "operator request".to_string(),
                    reason => reason.to_string(),
                };
                write_pause_request(
                    &self.paths.pause_request_path,
                    &PauseRequest {
                        reason,
                        requested_at: timestamp(),
                    },
                )?;
                info!(run_id = ?status.active_run_id, "pause requested");
                Ok(true)
            }
            other => Err(WorkflowError::InvalidInput(format!(
                "cannot pause: project is {}",
                other.as_str()
            ))),
        }
    }

    /// Operator acknowledgement of a blocking failure.
    ///
    /// The snapshot must verify again; the run becomes `failed_recoverable`.
    pub fn clear_block(&self, note: &str) -> Result<RoundStatus, WorkflowError> {
        let _lock = self.lock()?;
        let mut status = self.status()?;
        if status.status != RunStatus::FailedBlocking {
            return Err(WorkflowError::InvalidInput(format!(
                "project is not blocked (status {})",
                status.status.as_str()
            )));
        }
        if let Some(snapshot) = SnapshotStore::new(self.paths.clone()).current()? {
            let mismatches = SnapshotStore::new(self.paths.clone()).verify(&snapshot)?;
            if !mismatches.is_empty() {
                return Err(WorkflowError::Integrity {
                    details: describe_mismatches(&mismatches),
                });
            }
        }

        let previous = status.pause_reason.take().unwrap_or_default();
        let reason = format!("block cleared: {} (was: {previous})", note.trim());
        let now = timestamp();
        if let Some(run_id) = status.active_run_id.as_deref() {
            let path = self.paths.run_record_path(run_id);
            let mut record = load_run_record(&path)?;
            record.status = RunStatus::FailedRecoverable;
            record.halt_reason = Some(reason.clone());
            record.updated_at = now.clone();
            write_run_record(&path, &record)?;
        }
        status.status = RunStatus::FailedRecoverable;
        status.pause_reason = Some(reason);
        status.updated_at = Some(now);
        write_round_status(&self.paths.round_status_path, &status)?;
        info!("block cleared");
        Ok(status)
    }

    /// Queue review feedback for the feedback stage. Run status is untouched.
    pub fn record_feedback(
        &self,
        items: &[String],
        title: Option<&str>,
        author: Option<&str>,
    ) -> Result<Vec<FeedbackItem>, WorkflowError> {
        if items.iter().all(|item| item.trim().is_empty()) {
            return Err(WorkflowError::InvalidInput(
                "no feedback items given".to_string(),
            ));
        }
        Ok(record_feedback(
            &self.paths.feedback_path,
            items,
            title,
            author,
        )?)
    }

    /// Exclusive access to the project's run state until the guard drops.
    fn lock(&self) -> Result<RunLock, WorkflowError> {
        acquire_run_lock(&self.paths.run_lock_path)
            .map_err(|err| match err.downcast_ref::<LockHeld>() {
                Some(held) => WorkflowError::Locked { pid: held.pid },
                None => WorkflowError::Other(err),
            })
    }

    fn current_snapshot(&self) -> Result<SourceSnapshot, WorkflowError> {
        SnapshotStore::new(self.paths.clone())
            .current()?
            .ok_or(WorkflowError::NoSnapshot)
    }

    fn contract(&self) -> Result<InvocationContract, WorkflowError> {
        let contract = InvocationContract::for_project(&self.config, &self.settings.tool);
        contract.validate()?;
        Ok(contract)
    }

    fn verify(&self, snapshot: &SourceSnapshot) -> Result<Option<Halt>, WorkflowError> {
        let mismatches = SnapshotStore::new(self.paths.clone()).verify(snapshot)?;
        if mismatches.is_empty() {
            return Ok(None);
        }
        warn!(count = mismatches.len(), "snapshot verification failed");
        Ok(Some(Halt::Blocking {
            reason: format!(
                "snapshot integrity failure: {}",
                describe_mismatches(&mismatches)
            ),
        }))
    }

    fn execute(
        &self,
        mut record: RunRecord,
        stages: Vec<Stage>,
        snapshot: &SourceSnapshot,
        contract: &InvocationContract,
    ) -> Result<RunOutcome, WorkflowError> {
        self.persist(&mut record, RunStatus::Running, None)?;

        let pending_feedback = load_feedback(&self.paths.feedback_path)?.pending();
        let run_id = record.run_id.clone();
        let target_lectures = record.target_lectures.clone();
        let ctx = StageContext {
            run_id: &run_id,
            config: &self.config,
            settings: &self.settings,
            snapshot,
            contract,
            executor: &self.executor,
            check_runner: &self.check_runner,
            prompts: &self.prompts,
            policy: DecisionPolicy {
                pause: self.config.pause_policy,
                auto_remediate: record.auto_remediate,
                to_stage: record.to_stage,
            },
            target_lectures: &target_lectures,
            allow_external_refs: record.allow_external_refs,
            pending_feedback: &pending_feedback,
        };

        let mut stage_results = Vec::new();
        let mut last_completed = record.last_completed_stage;
        let mut halt = self.verify(snapshot)?;
        for stage in stages {
            if halt.is_some() {
                break;
            }
            if let Some(request) = take_pause_request(&self.paths.pause_request_path)? {
                halt = Some(Halt::Paused {
                    reason: format!("pause requested: {}", request.reason),
                });
                break;
            }

            let run = run_stage(&ctx, stage)?;
            stage_results.extend(run.results);
            if run.completed {
                last_completed = Some(stage);
                if stage.consumes_feedback() && !pending_feedback.is_empty() {
                    let ids: Vec<String> =
                        pending_feedback.iter().map(|item| item.id.clone()).collect();
                    let addressed = mark_addressed(&self.paths.feedback_path, &ids, &run_id)?;
                    info!(addressed, "feedback addressed");
                }
            }
            halt = run.halt;
            record.last_completed_stage = last_completed;
            if halt.is_none() {
                self.persist(&mut record, RunStatus::Running, None)?;
            }
        }
        if halt.is_none() {
            halt = self.verify(snapshot)?;
        }

        let status = halt.as_ref().map_or(RunStatus::Succeeded, Halt::status);
        record.last_completed_stage = last_completed;
        self.persist(&mut record, status, halt.as_ref().map(Halt::reason))?;
        info!(
            run_id = %record.run_id,
            status = status.as_str(),
            last_completed = ?last_completed,
            "run finished"
        );
        Ok(RunOutcome {
            run_id: record.run_id,
            status,
            last_completed_stage: last_completed,
            halt,
            stage_results,
        })
    }

    /// Write the run record and the round status projection together.
    fn persist(
        &self,
        record: &mut RunRecord,
        status: RunStatus,
        reason: Option<&str>,
    ) -> Result<(), WorkflowError> {
        let now = timestamp();
        record.status = status;
        record.halt_reason = reason.map(str::to_string);
        record.updated_at = now.clone();
        write_run_record(&self.paths.run_record_path(&record.run_id), record)
            .with_context(|| format!("persist run {}", record.run_id))?;
        write_round_status(
            &self.paths.round_status_path,
            &RoundStatus {
                status,
                last_completed_stage: record.last_completed_stage,
                active_run_id: Some(record.run_id.clone()),
                pause_reason: record.halt_reason.clone(),
                target_stage: Some(record.to_stage),
                updated_at: Some(now),
            },
        )?;
        Ok(())
    }
}

/// `run-<UTC timestamp>-<6 lowercase alphanumerics>`.
pub fn generate_run_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RUN_ID_SUFFIX_LEN)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect();
    format!("run-{}-{suffix}", Utc::now().format("%Y%m%dT%H%M%SZ"))
}

fn stage_before(stage: Stage) -> Option<Stage> {
    stage
        .index()
        .checked_sub(1)
        .and_then(|idx| Stage::ALL.get(idx).copied())
}

fn describe_mismatches(mismatches: &[Mismatch]) -> String {
    let mut parts: Vec<String> = mismatches.iter().take(5).map(ToString::to_string).collect();
    if mismatches.len() > parts.len() {
        parts.push(format!("and {} more", mismatches.len() - parts.len()));
    }
    parts.join("; ")
}

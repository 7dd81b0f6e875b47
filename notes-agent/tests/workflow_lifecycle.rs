//! Lifecycle scenarios for the workflow orchestrator.
//!
//! Each test drives `start` / `resume` against a temp project with a scripted
//! tool and check runner, then inspects the durable state the run left behind.

use std::fs;

use anyhow::Result;

use notes_agent::core::stage::Stage;
use notes_agent::core::types::{InvocationKind, RunStatus, StageOutcome};
use notes_agent::errors::WorkflowError;
use notes_agent::io::check::NotesCheckRunner;
use notes_agent::io::executor::{ExecOutput, ExecRequest, Executor, RunManifest};
use notes_agent::io::feedback::load_feedback;
use notes_agent::io::lock::acquire_run_lock;
use notes_agent::io::snapshot::SnapshotStore;
use notes_agent::io::state::{
    PauseRequest, load_round_status, load_run_record, read_json, write_pause_request,
};
use notes_agent::test_support::{
    ScriptedCheckRunner, ScriptedExec, ScriptedExecutor, TestProject, failing_report, lines,
};
use notes_agent::workflow::{Halt, ResumeOptions, RunOptions, WorkflowOrchestrator};

fn lecture(n: usize) -> ScriptedExec {
    let path = format!("notes/lectures/lecture{n:02}.md");
    ScriptedExec::success(vec![(path.as_str(), lines(&format!("draft {n}"), 5))])
}

fn transient() -> ScriptedExec {
    ScriptedExec::failure(1, "ERROR: stream disconnected before completion")
}

/// Verifies a clean run over round1..final succeeds with one result per stage
/// and leaves the snapshot intact.
#[test]
fn full_run_succeeds_with_four_stage_results() {
    let project = TestProject::new().expect("project");
    let executor = ScriptedExecutor::new((1..=4).map(lecture).collect());
    let checks = ScriptedCheckRunner::default();
    let orchestrator = project.orchestrator(&executor, &checks).expect("orchestrator");

    let outcome = orchestrator
        .start(Stage::Round1, Stage::Final, RunOptions::default())
        .expect("start");

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.last_completed_stage, Some(Stage::Final));
    assert_eq!(outcome.halt, None);
    let stages: Vec<Stage> = outcome.stage_results.iter().map(|r| r.stage).collect();
    assert_eq!(
        stages,
        vec![Stage::Round1, Stage::Round2, Stage::Round3, Stage::Final]
    );
    let seqs: Vec<u32> = outcome.stage_results.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
    assert!(
        outcome
            .stage_results
            .iter()
            .all(|r| r.outcome == StageOutcome::Success)
    );
    assert_eq!(executor.calls(), 4);

    let paths = project.config.paths();
    let status = load_round_status(&paths.round_status_path).expect("status");
    assert_eq!(status.status, RunStatus::Succeeded);
    assert_eq!(status.active_run_id.as_deref(), Some(outcome.run_id.as_str()));
    let record = load_run_record(&paths.run_record_path(&outcome.run_id)).expect("record");
    assert_eq!(record.status, RunStatus::Succeeded);

    let store = SnapshotStore::new(paths.clone());
    assert!(store.verify(&project.snapshot).expect("verify").is_empty());

    let first = paths.invocation_dir(&outcome.run_id, 1, Stage::Round1, InvocationKind::Primary);
    for file in [
        &first.prompt_path,
        &first.stdout_log_path,
        &first.last_message_path,
        &first.manifest_path,
        &first.check_result_path,
        &first.patch_path,
        &first.diff_summary_path,
        &first.stage_result_path,
    ] {
        assert!(file.is_file(), "missing {}", file.display());
    }
}

/// Verifies three transient failures end the run recoverable with exactly two
/// retries recorded.
#[test]
fn transient_failures_exhaust_retries() {
    let project = TestProject::new().expect("project");
    let executor = ScriptedExecutor::new(vec![transient(), transient(), transient()]);
    let checks = ScriptedCheckRunner::default();
    let orchestrator = project.orchestrator(&executor, &checks).expect("orchestrator");

    let outcome = orchestrator
        .start(Stage::Round1, Stage::Final, RunOptions::default())
        .expect("start");

    assert_eq!(outcome.status, RunStatus::FailedRecoverable);
    assert_eq!(outcome.last_completed_stage, None);
    assert_eq!(outcome.stage_results.len(), 1);
    assert_eq!(outcome.stage_results[0].outcome, StageOutcome::ToolError);
    assert_eq!(executor.calls(), 3);
    assert_eq!(checks.calls(), 0);

    let paths = project.config.paths();
    let inv = paths.invocation_dir(&outcome.run_id, 1, Stage::Round1, InvocationKind::Primary);
    let manifest: RunManifest = read_json(&inv.manifest_path).expect("manifest");
    assert_eq!(manifest.attempts.len(), 3);
    assert_eq!(manifest.retry_count, 2);
    assert!(!manifest.success);
    let reason = outcome.halt.as_ref().map(Halt::reason).unwrap_or_default();
    assert!(reason.contains("transient tool error in round1 after 3 attempts"));
}

/// Verifies a check failure gets exactly one remediation before the run fails.
#[test]
fn check_failure_after_remediation_is_recoverable() {
    let project = TestProject::new().expect("project");
    let executor = ScriptedExecutor::new(vec![lecture(1), lecture(2)]);
    let checks = ScriptedCheckRunner::new(vec![
        Ok(failing_report("index/manifest.yml: missing course_id")),
        Ok(failing_report("index/manifest.yml: missing course_id")),
    ]);
    let orchestrator = project.orchestrator(&executor, &checks).expect("orchestrator");

    let outcome = orchestrator
        .start(Stage::Round1, Stage::Final, RunOptions::default())
        .expect("start");

    assert_eq!(outcome.status, RunStatus::FailedRecoverable);
    let kinds: Vec<InvocationKind> = outcome
        .stage_results
        .iter()
        .map(|r| r.invocation)
        .collect();
    assert_eq!(
        kinds,
        vec![InvocationKind::Primary, InvocationKind::Remediation]
    );
    assert!(
        outcome
            .stage_results
            .iter()
            .all(|r| r.outcome == StageOutcome::CheckFailed)
    );
    let reason = outcome.halt.as_ref().map(Halt::reason).unwrap_or_default();
    assert!(reason.starts_with("check failed after remediation"));

    let prompts = executor.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("Fix the check failures listed below and nothing else."));
    assert!(prompts[1].contains("index/manifest.yml: missing course_id"));
}

#[test]
fn remediation_that_passes_advances() {
    let project = TestProject::new().expect("project");
    let executor = ScriptedExecutor::new(vec![lecture(1), lecture(2)]);
    let checks = ScriptedCheckRunner::new(vec![Ok(failing_report("broken link"))]);
    let orchestrator = project.orchestrator(&executor, &checks).expect("orchestrator");

    let outcome = orchestrator
        .start(Stage::Round1, Stage::Round1, RunOptions::default())
        .expect("start");

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.stage_results.len(), 2);
    assert_eq!(outcome.stage_results[1].outcome, StageOutcome::Success);
}

#[test]
fn disabled_auto_remediation_fails_on_first_check_failure() {
    let project = TestProject::new().expect("project");
    let executor = ScriptedExecutor::new(vec![lecture(1)]);
    let checks = ScriptedCheckRunner::new(vec![Ok(failing_report("broken link"))]);
    let orchestrator = project.orchestrator(&executor, &checks).expect("orchestrator");

    let outcome = orchestrator
        .start(
            Stage::Round1,
            Stage::Final,
            RunOptions {
                auto_remediate: Some(false),
                ..RunOptions::default()
            },
        )
        .expect("start");

    assert_eq!(outcome.status, RunStatus::FailedRecoverable);
    assert_eq!(outcome.stage_results.len(), 1);
    assert_eq!(executor.calls(), 1);
}

/// Verifies an oversized change pauses before the next stage and that the
/// stage's patch is on disk.
#[test]
fn change_threshold_pauses_before_next_stage() {
    let mut project = TestProject::new().expect("project");
    project
        .configure(|config| config.thresholds.max_changed_lines = Some(50))
        .expect("configure");
    let executor = ScriptedExecutor::new(vec![
        ScriptedExec::success(vec![("notes/lectures/lecture01.md", lines("big", 80))]),
        lecture(2),
    ]);
    let checks = ScriptedCheckRunner::default();
    let orchestrator = project.orchestrator(&executor, &checks).expect("orchestrator");

    let outcome = orchestrator
        .start(Stage::Round1, Stage::Final, RunOptions::default())
        .expect("start");

    assert_eq!(outcome.status, RunStatus::Paused);
    assert_eq!(outcome.last_completed_stage, Some(Stage::Round1));
    assert_eq!(executor.calls(), 1);
    let reason = outcome.halt.as_ref().map(Halt::reason).unwrap_or_default();
    assert_eq!(reason, "change threshold exceeded: changed_lines 80 > 50");
    assert_eq!(outcome.stage_results[0].changes.lines_changed, 80);

    let paths = project.config.paths();
    let inv = paths.invocation_dir(&outcome.run_id, 1, Stage::Round1, InvocationKind::Primary);
    let patch = fs::read_to_string(&inv.patch_path).expect("patch");
    assert!(patch.contains("+++ b/notes/lectures/lecture01.md"));
    assert!(patch.contains("+big line 79"));

    let resumed = orchestrator
        .resume(ResumeOptions {
            to_stage: Some(Stage::Round2),
            restart_from: None,
        })
        .expect("resume");
    assert_eq!(resumed.run_id, outcome.run_id);
    assert_eq!(resumed.status, RunStatus::Succeeded);
    assert_eq!(resumed.stage_results.len(), 1);
    assert_eq!(resumed.stage_results[0].stage, Stage::Round2);
    assert_eq!(resumed.stage_results[0].seq, 2);
}

#[test]
fn threshold_breach_only_logs_when_policy_allows() {
    let mut project = TestProject::new().expect("project");
    project
        .configure(|config| {
            config.thresholds.max_changed_lines = Some(50);
            config.pause_policy.on_change_threshold = false;
        })
        .expect("configure");
    let executor = ScriptedExecutor::new(vec![ScriptedExec::success(vec![(
        "notes/lectures/lecture01.md",
        lines("big", 80),
    )])]);
    let checks = ScriptedCheckRunner::default();
    let orchestrator = project.orchestrator(&executor, &checks).expect("orchestrator");

    let outcome = orchestrator
        .start(Stage::Round1, Stage::Round1, RunOptions::default())
        .expect("start");

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(
        outcome.stage_results[0].changes.exceeded.as_deref(),
        Some("changed_lines 80 > 50")
    );
}

/// Verifies a sandbox refusal blocks immediately and keeps blocking `start`
/// until the operator clears it.
#[test]
fn permission_failure_blocks_until_cleared() {
    let project = TestProject::new().expect("project");
    let executor = ScriptedExecutor::new(vec![
        lecture(1),
        ScriptedExec::failure(1, "error: write to /etc/hosts blocked by sandbox"),
        lecture(2),
        lecture(3),
        lecture(4),
    ]);
    let checks = ScriptedCheckRunner::default();
    let orchestrator = project.orchestrator(&executor, &checks).expect("orchestrator");

    let outcome = orchestrator
        .start(Stage::Round1, Stage::Final, RunOptions::default())
        .expect("start");

    assert_eq!(outcome.status, RunStatus::FailedBlocking);
    assert_eq!(outcome.last_completed_stage, Some(Stage::Round1));
    assert_eq!(executor.calls(), 2);
    let blocked = &outcome.stage_results[1];
    assert_eq!(blocked.outcome, StageOutcome::Blocked);
    assert_eq!(blocked.tool.retry_count, 0);
    let reason = outcome.halt.as_ref().map(Halt::reason).unwrap_or_default();
    assert!(reason.contains("permission failure in round2"));

    let err = orchestrator
        .start(Stage::Round1, Stage::Final, RunOptions::default())
        .expect_err("blocked");
    assert!(matches!(err, WorkflowError::Blocked { .. }));
    assert!(matches!(
        orchestrator.resume(ResumeOptions::default()),
        Err(WorkflowError::Blocked { .. })
    ));

    let status = orchestrator.clear_block("sandbox fixed").expect("clear");
    assert_eq!(status.status, RunStatus::FailedRecoverable);
    assert!(
        status
            .pause_reason
            .as_deref()
            .unwrap_or_default()
            .starts_with("block cleared: sandbox fixed")
    );

    let resumed = orchestrator.resume(ResumeOptions::default()).expect("resume");
    assert_eq!(resumed.status, RunStatus::Succeeded);
    let stages: Vec<Stage> = resumed.stage_results.iter().map(|r| r.stage).collect();
    assert_eq!(stages, vec![Stage::Round2, Stage::Round3, Stage::Final]);
    assert_eq!(executor.remaining(), 0);
}

#[test]
fn auth_failure_is_blocking_and_verbatim() {
    let project = TestProject::new().expect("project");
    let executor = ScriptedExecutor::new(vec![ScriptedExec::failure(
        1,
        "Error: Not logged in. Run `codex login`.",
    )]);
    let checks = ScriptedCheckRunner::default();
    let orchestrator = project.orchestrator(&executor, &checks).expect("orchestrator");

    let outcome = orchestrator
        .start(Stage::Round1, Stage::Final, RunOptions::default())
        .expect("start");

    assert_eq!(outcome.status, RunStatus::FailedBlocking);
    assert_eq!(executor.calls(), 1);
    let reason = outcome.halt.as_ref().map(Halt::reason).unwrap_or_default();
    assert_eq!(
        reason,
        "authentication required: Error: Not logged in. Run `codex login`."
    );
}

/// Verifies resume continues after the last completed stage and only reruns a
/// finished stage when explicitly asked.
#[test]
fn resume_never_repeats_succeeded_stages() {
    let mut project = TestProject::new().expect("project");
    project
        .configure(|config| config.pause_policy.after_each_stage = true)
        .expect("configure");
    let executor = ScriptedExecutor::new((1..=5).map(lecture).collect());
    let checks = ScriptedCheckRunner::default();
    let orchestrator = project.orchestrator(&executor, &checks).expect("orchestrator");

    let first = orchestrator
        .start(Stage::Round1, Stage::Round3, RunOptions::default())
        .expect("start");
    assert_eq!(first.status, RunStatus::Paused);
    assert_eq!(first.last_completed_stage, Some(Stage::Round1));
    let reason = first.halt.as_ref().map(Halt::reason).unwrap_or_default();
    assert_eq!(reason, "pause after each stage: round1 completed");

    let second = orchestrator.resume(ResumeOptions::default()).expect("resume");
    assert_eq!(second.stage_results.len(), 1);
    assert_eq!(second.stage_results[0].stage, Stage::Round2);
    assert_eq!(second.status, RunStatus::Paused);

    let rerun = orchestrator
        .resume(ResumeOptions {
            to_stage: None,
            restart_from: Some(Stage::Round2),
        })
        .expect("restart");
    assert_eq!(rerun.stage_results[0].stage, Stage::Round2);
    assert_eq!(rerun.stage_results[0].seq, 3);
    assert_eq!(rerun.status, RunStatus::Paused);

    let last = orchestrator.resume(ResumeOptions::default()).expect("resume");
    assert_eq!(last.stage_results.len(), 1);
    assert_eq!(last.stage_results[0].stage, Stage::Round3);
    assert_eq!(last.status, RunStatus::Succeeded);
    assert_eq!(executor.calls(), 4);

    assert!(matches!(
        orchestrator.resume(ResumeOptions::default()),
        Err(WorkflowError::NoActiveRun)
    ));
}

#[test]
fn invalid_range_is_rejected_without_side_effects() {
    let project = TestProject::new().expect("project");
    let executor = ScriptedExecutor::default();
    let checks = ScriptedCheckRunner::default();
    let orchestrator = project.orchestrator(&executor, &checks).expect("orchestrator");
    let paths = project.config.paths();
    let before = fs::read_to_string(&paths.round_status_path).expect("status");

    let err = orchestrator
        .start(Stage::Final, Stage::Round1, RunOptions::default())
        .expect_err("invalid");
    assert!(matches!(err, WorkflowError::InvalidRange(_)));
    assert_eq!(
        fs::read_to_string(&paths.round_status_path).expect("status"),
        before
    );
    assert_eq!(fs::read_dir(&paths.runs_dir).expect("runs").count(), 0);
}

#[test]
fn tampered_snapshot_blocks_before_any_stage() {
    let project = TestProject::new().expect("project");
    project.tamper_snapshot().expect("tamper");
    let executor = ScriptedExecutor::new(vec![lecture(1)]);
    let checks = ScriptedCheckRunner::default();
    let orchestrator = project.orchestrator(&executor, &checks).expect("orchestrator");

    let outcome = orchestrator
        .start(Stage::Round1, Stage::Final, RunOptions::default())
        .expect("start");
    assert_eq!(outcome.status, RunStatus::FailedBlocking);
    assert!(outcome.stage_results.is_empty());
    assert_eq!(executor.calls(), 0);
    let reason = outcome.halt.as_ref().map(Halt::reason).unwrap_or_default();
    assert!(reason.starts_with("snapshot integrity failure: hash mismatch"));

    let err = orchestrator.clear_block("retry").expect_err("still tampered");
    assert!(matches!(err, WorkflowError::Integrity { .. }));
}

#[test]
fn start_preconditions_are_enforced() {
    let project = TestProject::new().expect("project");
    let executor = ScriptedExecutor::new(vec![lecture(1)]);
    let checks = ScriptedCheckRunner::default();
    let orchestrator = project.orchestrator(&executor, &checks).expect("orchestrator");

    let options = RunOptions {
        run_id: Some("run-fixed".to_string()),
        ..RunOptions::default()
    };
    orchestrator
        .start(Stage::Round1, Stage::Round1, options.clone())
        .expect("start");
    assert!(matches!(
        orchestrator.start(Stage::Round1, Stage::Round1, options),
        Err(WorkflowError::RunExists { .. })
    ));
    assert!(matches!(
        orchestrator.start(
            Stage::Round1,
            Stage::Round1,
            RunOptions {
                run_id: Some("../escape".to_string()),
                ..RunOptions::default()
            }
        ),
        Err(WorkflowError::InvalidInput(_))
    ));
    assert!(matches!(
        orchestrator.pause("stop"),
        Err(WorkflowError::InvalidInput(_))
    ));
}

#[test]
fn start_without_snapshot_is_rejected() {
    let project = TestProject::new().expect("project");
    let paths = project.config.paths();
    fs::remove_file(&paths.source_index_path).expect("remove index");
    let executor = ScriptedExecutor::default();
    let checks = ScriptedCheckRunner::default();
    let orchestrator = project.orchestrator(&executor, &checks).expect("orchestrator");

    assert!(matches!(
        orchestrator.start(Stage::Round1, Stage::Final, RunOptions::default()),
        Err(WorkflowError::NoSnapshot)
    ));
}

/// Executor that files a pause request while its attempt runs, like an
/// operator calling `pause` from another process.
struct PausingExecutor {
    inner: ScriptedExecutor,
    pause_path: std::path::PathBuf,
}

impl Executor for PausingExecutor {
    fn exec(&self, request: &ExecRequest) -> Result<ExecOutput> {
        let output = self.inner.exec(request)?;
        write_pause_request(
            &self.pause_path,
            &PauseRequest {
                reason: "lunch".to_string(),
                requested_at: "2026-01-01T12:00:00Z".to_string(),
            },
        )?;
        Ok(output)
    }

    fn command_line(&self, request: &ExecRequest) -> Vec<String> {
        self.inner.command_line(request)
    }
}

#[test]
fn pause_request_is_honored_at_stage_boundary() {
    let project = TestProject::new().expect("project");
    let paths = project.config.paths();
    let executor = PausingExecutor {
        inner: ScriptedExecutor::new(vec![lecture(1), lecture(2)]),
        pause_path: paths.pause_request_path.clone(),
    };
    let checks = ScriptedCheckRunner::default();
    let orchestrator =
        WorkflowOrchestrator::new(project.config.clone(), project.settings(), &executor, &checks)
            .expect("orchestrator");

    let outcome = orchestrator
        .start(Stage::Round1, Stage::Round2, RunOptions::default())
        .expect("start");

    assert_eq!(outcome.status, RunStatus::Paused);
    assert_eq!(outcome.last_completed_stage, Some(Stage::Round1));
    assert_eq!(executor.inner.calls(), 1);
    let reason = outcome.halt.as_ref().map(Halt::reason).unwrap_or_default();
    assert_eq!(reason, "pause requested: lunch");
    assert!(!paths.pause_request_path.exists());
    assert!(!orchestrator.pause("again").expect("pause"));
}

/// Verifies queued feedback reaches the round3 prompt and is marked addressed
/// once round3 succeeds.
#[test]
fn feedback_is_consumed_by_round3() {
    let project = TestProject::new().expect("project");
    let executor = ScriptedExecutor::new(vec![ScriptedExec::success(vec![(
        "review/feedback.md",
        "# Feedback\n\n- [x] fb-0001 added a worked example\n".to_string(),
    )])]);
    let checks = ScriptedCheckRunner::default();
    let orchestrator = project.orchestrator(&executor, &checks).expect("orchestrator");

    let added = orchestrator
        .record_feedback(
            &["Add a worked example for heaps".to_string(), " ".to_string()],
            Some("Week 3"),
            Some("ta"),
        )
        .expect("feedback");
    assert_eq!(added.len(), 1);
    assert!(matches!(
        orchestrator.record_feedback(&[" ".to_string()], None, None),
        Err(WorkflowError::InvalidInput(_))
    ));

    let outcome = orchestrator
        .start(Stage::Round3, Stage::Round3, RunOptions::default())
        .expect("start");
    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert!(executor.prompts()[0].contains("fb-0001 (Week 3): Add a worked example for heaps"));

    let queue = load_feedback(&project.config.paths().feedback_path).expect("feedback");
    assert!(queue.pending().is_empty());
    assert_eq!(
        queue.items[0].addressed_by_run.as_deref(),
        Some(outcome.run_id.as_str())
    );
}

/// Verifies round0 scaffolds locally and passes the built-in notes check.
#[test]
fn round0_scaffolds_without_calling_the_tool() {
    let project = TestProject::new().expect("project");
    let executor = ScriptedExecutor::default();
    let orchestrator = WorkflowOrchestrator::new(
        project.config.clone(),
        project.settings(),
        &executor,
        NotesCheckRunner,
    )
    .expect("orchestrator");

    let outcome = orchestrator
        .start(Stage::Round0, Stage::Round0, RunOptions::default())
        .expect("start");

    assert_eq!(outcome.status, RunStatus::Succeeded, "{:?}", outcome.halt);
    assert_eq!(executor.calls(), 0);
    assert_eq!(outcome.stage_results[0].tool.program, "scaffold");
    assert!(project.notes_root().join("index/manifest.yml").is_file());
    assert!(project.config.paths().round0_marker_path.is_file());
    assert!(outcome.stage_results[0].changes.files_added >= 7);
}

/// Verifies the change gate judges the whole stage: a remediation that pushes
/// the stage past the limit pauses even though each call stayed under it.
#[test]
fn remediation_cannot_split_an_oversized_stage() {
    let mut project = TestProject::new().expect("project");
    project
        .configure(|config| config.thresholds.max_changed_lines = Some(50))
        .expect("configure");
    let executor = ScriptedExecutor::new(vec![
        ScriptedExec::success(vec![("notes/lectures/lecture01.md", lines("first", 40))]),
        ScriptedExec::success(vec![("notes/lectures/lecture02.md", lines("second", 40))]),
        lecture(3),
    ]);
    let checks = ScriptedCheckRunner::new(vec![Ok(failing_report("broken link"))]);
    let orchestrator = project.orchestrator(&executor, &checks).expect("orchestrator");

    let outcome = orchestrator
        .start(Stage::Round1, Stage::Final, RunOptions::default())
        .expect("start");

    assert_eq!(outcome.status, RunStatus::Paused);
    assert_eq!(outcome.last_completed_stage, Some(Stage::Round1));
    assert_eq!(executor.calls(), 2);
    let reason = outcome.halt.as_ref().map(Halt::reason).unwrap_or_default();
    assert_eq!(reason, "change threshold exceeded: changed_lines 80 > 50");

    let per_call: Vec<usize> = outcome
        .stage_results
        .iter()
        .map(|r| r.changes.lines_changed)
        .collect();
    assert_eq!(per_call, vec![40, 40]);
    let repair = &outcome.stage_results[1];
    assert_eq!(repair.invocation, InvocationKind::Remediation);
    assert_eq!(repair.stage_changes.lines_changed, 80);
    assert_eq!(repair.stage_changes.files_changed, 2);

    let paths = project.config.paths();
    let inv = paths.invocation_dir(&outcome.run_id, 2, Stage::Round1, InvocationKind::Remediation);
    let stage_patch = fs::read_to_string(&inv.stage_patch_path).expect("stage patch");
    assert!(stage_patch.contains("+++ b/notes/lectures/lecture01.md"));
    assert!(stage_patch.contains("+++ b/notes/lectures/lecture02.md"));
    let own_patch = fs::read_to_string(&inv.patch_path).expect("patch");
    assert!(!own_patch.contains("lecture01.md"));
}

#[test]
fn oversized_primary_is_still_judged_after_a_small_remediation() {
    let mut project = TestProject::new().expect("project");
    project
        .configure(|config| config.thresholds.max_changed_lines = Some(50))
        .expect("configure");
    let executor = ScriptedExecutor::new(vec![
        ScriptedExec::success(vec![("notes/lectures/lecture01.md", lines("big", 200))]),
        ScriptedExec::success(vec![("notes/lectures/lecture02.md", lines("fix", 1))]),
        lecture(3),
    ]);
    let checks = ScriptedCheckRunner::new(vec![Ok(failing_report("broken link"))]);
    let orchestrator = project.orchestrator(&executor, &checks).expect("orchestrator");

    let outcome = orchestrator
        .start(Stage::Round1, Stage::Final, RunOptions::default())
        .expect("start");

    assert_eq!(outcome.status, RunStatus::Paused);
    assert_eq!(executor.calls(), 2);
    assert_eq!(outcome.stage_results[0].outcome, StageOutcome::CheckFailed);
    assert_eq!(outcome.stage_results[1].changes.lines_changed, 1);
    let reason = outcome.halt.as_ref().map(Halt::reason).unwrap_or_default();
    assert_eq!(reason, "change threshold exceeded: changed_lines 201 > 50");
}

/// Executor that overwrites a snapshot file during its `tamper_on`-th call.
struct TamperingExecutor<'a> {
    inner: ScriptedExecutor,
    project: &'a TestProject,
    tamper_on: usize,
}

impl Executor for TamperingExecutor<'_> {
    fn exec(&self, request: &ExecRequest) -> Result<ExecOutput> {
        let output = self.inner.exec(request)?;
        if self.inner.calls() == self.tamper_on {
            self.project.tamper_snapshot()?;
        }
        Ok(output)
    }

    fn command_line(&self, request: &ExecRequest) -> Vec<String> {
        self.inner.command_line(request)
    }
}

/// Verifies the built-in check catches a snapshot modified while a stage runs
/// and blocks without remediating.
#[test]
fn snapshot_tampered_during_a_stage_blocks_it() {
    let project = TestProject::new().expect("project");
    let executor = TamperingExecutor {
        inner: ScriptedExecutor::new(vec![ScriptedExec::success(Vec::new())]),
        project: &project,
        tamper_on: 1,
    };
    let orchestrator = WorkflowOrchestrator::new(
        project.config.clone(),
        project.settings(),
        &executor,
        NotesCheckRunner,
    )
    .expect("orchestrator");

    let outcome = orchestrator
        .start(Stage::Round0, Stage::Round1, RunOptions::default())
        .expect("start");

    assert_eq!(outcome.status, RunStatus::FailedBlocking);
    assert_eq!(outcome.last_completed_stage, Some(Stage::Round0));
    assert_eq!(executor.inner.calls(), 1);
    assert_eq!(outcome.stage_results.len(), 2);
    let blocked = &outcome.stage_results[1];
    assert_eq!(blocked.stage, Stage::Round1);
    assert_eq!(blocked.outcome, StageOutcome::Blocked);
    let reason = outcome.halt.as_ref().map(Halt::reason).unwrap_or_default();
    assert!(reason.starts_with("snapshot integrity failure:"), "{reason}");
    assert!(reason.contains("hash mismatch"), "{reason}");

    let status = load_round_status(&project.config.paths().round_status_path).expect("status");
    assert_eq!(status.status, RunStatus::FailedBlocking);
}

/// Verifies the integrity check after the last stage blocks a run whose
/// stages all passed.
#[test]
fn snapshot_tampered_in_the_final_stage_blocks_after_the_run() {
    let project = TestProject::new().expect("project");
    let executor = TamperingExecutor {
        inner: ScriptedExecutor::new((1..=4).map(lecture).collect()),
        project: &project,
        tamper_on: 4,
    };
    let checks = ScriptedCheckRunner::default();
    let orchestrator =
        WorkflowOrchestrator::new(project.config.clone(), project.settings(), &executor, &checks)
            .expect("orchestrator");

    let outcome = orchestrator
        .start(Stage::Round1, Stage::Final, RunOptions::default())
        .expect("start");

    assert_eq!(outcome.status, RunStatus::FailedBlocking);
    assert_eq!(outcome.last_completed_stage, Some(Stage::Final));
    assert_eq!(outcome.stage_results.len(), 4);
    assert!(
        outcome
            .stage_results
            .iter()
            .all(|r| r.outcome == StageOutcome::Success)
    );
    let reason = outcome.halt.as_ref().map(Halt::reason).unwrap_or_default();
    assert!(reason.starts_with("snapshot integrity failure: hash mismatch"), "{reason}");

    assert!(matches!(
        orchestrator.resume(ResumeOptions::default()),
        Err(WorkflowError::Blocked { .. })
    ));
}

#[test]
fn timed_out_attempts_end_recoverable_after_three_tries() {
    let project = TestProject::new().expect("project");
    let executor = ScriptedExecutor::new(vec![
        ScriptedExec::timeout(),
        ScriptedExec::timeout(),
        ScriptedExec::timeout(),
    ]);
    let checks = ScriptedCheckRunner::default();
    let orchestrator = project.orchestrator(&executor, &checks).expect("orchestrator");

    let outcome = orchestrator
        .start(Stage::Round1, Stage::Final, RunOptions::default())
        .expect("start");

    assert_eq!(outcome.status, RunStatus::FailedRecoverable);
    assert_eq!(executor.calls(), 3);
    assert_eq!(outcome.stage_results[0].outcome, StageOutcome::ToolError);
    let reason = outcome.halt.as_ref().map(Halt::reason).unwrap_or_default();
    assert!(
        reason.contains("transient tool error in round1 after 3 attempts: timed out after"),
        "{reason}"
    );

    let paths = project.config.paths();
    let inv = paths.invocation_dir(&outcome.run_id, 1, Stage::Round1, InvocationKind::Primary);
    let manifest: RunManifest = read_json(&inv.manifest_path).expect("manifest");
    assert_eq!(manifest.attempts.len(), 3);
    assert!(manifest.attempts.iter().all(|a| a.timed_out));
    assert_eq!(manifest.final_exit_code, None);
}

/// Verifies a second process cannot drive the project while the run lock is
/// held, and that nothing is written until it can.
#[test]
fn held_run_lock_rejects_start_and_resume() {
    let project = TestProject::new().expect("project");
    let paths = project.config.paths();
    let executor = ScriptedExecutor::new(vec![lecture(1)]);
    let checks = ScriptedCheckRunner::default();
    let orchestrator = project.orchestrator(&executor, &checks).expect("orchestrator");

    let guard = acquire_run_lock(&paths.run_lock_path).expect("lock");
    let err = orchestrator
        .start(Stage::Round1, Stage::Round1, RunOptions::default())
        .expect_err("locked");
    assert!(matches!(err, WorkflowError::Locked { pid } if pid == std::process::id()));
    assert!(matches!(
        orchestrator.resume(ResumeOptions::default()),
        Err(WorkflowError::Locked { .. })
    ));
    assert_eq!(executor.calls(), 0);
    assert_eq!(fs::read_dir(&paths.runs_dir).expect("runs").count(), 0);

    drop(guard);
    let outcome = orchestrator
        .start(Stage::Round1, Stage::Round1, RunOptions::default())
        .expect("start");
    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert!(!paths.run_lock_path.exists());
}

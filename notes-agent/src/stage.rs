//! One stage of a run: the primary invocation plus at most one remediation.
//!
//! Every invocation follows the same order: prompt, tool (or the local
//! scaffold for Round0's primary invocation), check, change gate. Its
//! [`StageResult`] is persisted before [`decide`] is consulted.
//!
//! The change gate measures the stage as a whole: `notes_root` is captured
//! once before the primary invocation and every decision sees the delta from
//! there, so a remediation pass cannot split an oversized change.

use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::classifier::FailureKind;
use crate::core::decision::{
    CheckVerdict, Decision, DecisionPolicy, Observation, ToolVerdict, decide, stage_outcome,
};
use crate::core::stage::Stage;
use crate::core::types::InvocationKind;
use crate::io::change_gate::{NotesState, capture_notes_state, evaluate, persist_changes};
use crate::io::check::{CheckRequest, CheckRunner};
use crate::io::config::AgentSettings;
use crate::io::executor::{
    ExecRequest, Executor, InvocationContract, InvocationId, RetryPolicy, ToolRun, run_tool,
};
use crate::io::feedback::FeedbackItem;
use crate::io::paths::InvocationPaths;
use crate::io::project::ProjectConfig;
use crate::io::prompt::{PromptBuilder, PromptInputs};
use crate::io::scaffold::{ScaffoldOptions, init_round0};
use crate::io::snapshot::SourceSnapshot;
use crate::io::state::{
    StageResult, ToolRecord, next_seq, timestamp, write_atomic, write_json_atomic,
    write_stage_result,
};
use crate::workflow::Halt;

const SCAFFOLD_PROGRAM: &str = "scaffold";

/// Everything a stage needs that stays fixed for the whole run.
pub struct StageContext<'a, E, C> {
    pub run_id: &'a str,
    pub config: &'a ProjectConfig,
    pub settings: &'a AgentSettings,
    pub snapshot: &'a SourceSnapshot,
    pub contract: &'a InvocationContract,
    pub executor: &'a E,
    pub check_runner: &'a C,
    pub prompts: &'a PromptBuilder,
    pub policy: DecisionPolicy,
    pub target_lectures: &'a [String],
    pub allow_external_refs: bool,
    pub pending_feedback: &'a [FeedbackItem],
}

/// What running one stage produced.
#[derive(Debug, Clone)]
pub struct StageRun {
    pub results: Vec<StageResult>,
    /// The stage succeeded and counts as completed, even when `halt` is a pause.
    pub completed: bool,
    pub halt: Option<Halt>,
}

/// Run `stage`, remediating once when its check fails.
#[instrument(skip_all, fields(run_id = ctx.run_id, stage = %stage))]
pub fn run_stage<E: Executor, C: CheckRunner>(
    ctx: &StageContext<'_, E, C>,
    stage: Stage,
) -> Result<StageRun> {
    info!("stage starting");
    let stage_start = capture_notes_state(&ctx.config.notes_root)?;
    let mut results = Vec::new();
    let mut kind = InvocationKind::Primary;
    let mut failures: (Vec<String>, Vec<String>) = (Vec::new(), Vec::new());

    loop {
        let (result, decision) = invoke(ctx, stage, kind, &stage_start, &failures)?;
        if let Some(report) = &result.check {
            failures = (
                report.errors().map(str::to_string).collect(),
                report.warnings().map(str::to_string).collect(),
            );
        }
        results.push(result);

        let (completed, halt) = match decision {
            Decision::Advance => (true, None),
            Decision::Pause { reason } => (true, Some(Halt::Paused { reason })),
            Decision::Remediate if kind == InvocationKind::Primary => {
                info!("check failed, remediating");
                kind = InvocationKind::Remediation;
                continue;
            }
            Decision::Remediate => (
                false,
                Some(Halt::Recoverable {
                    reason: "check failed after remediation".to_string(),
                }),
            ),
            Decision::FailRecoverable { reason } => (false, Some(Halt::Recoverable { reason })),
            Decision::FailBlocking { reason } => (false, Some(Halt::Blocking { reason })),
        };
        info!(completed, halted = halt.is_some(), "stage finished");
        return Ok(StageRun {
            results,
            completed,
            halt,
        });
    }
}

fn invoke<E: Executor, C: CheckRunner>(
    ctx: &StageContext<'_, E, C>,
    stage: Stage,
    kind: InvocationKind,
    stage_start: &NotesState,
    (errors, warnings): &(Vec<String>, Vec<String>),
) -> Result<(StageResult, Decision)> {
    let paths = ctx.config.paths();
    let seq = next_seq(&paths.run_dir(ctx.run_id))?;
    let inv = paths.invocation_dir(ctx.run_id, seq, stage, kind);
    fs::create_dir_all(&inv.dir).with_context(|| format!("create {}", inv.dir.display()))?;

    let inputs = PromptInputs {
        stage,
        config: ctx.config,
        snapshot: ctx.snapshot,
        target_lectures: ctx.target_lectures,
        allow_external_refs: ctx.allow_external_refs,
        pending_feedback: ctx.pending_feedback,
    };
    let prompt = match kind {
        InvocationKind::Primary => ctx.prompts.stage_prompt(&inputs)?,
        InvocationKind::Remediation => ctx.prompts.remediation_prompt(&inputs, errors, warnings)?,
    };
    write_atomic(&inv.prompt_path, prompt.as_bytes())?;

    let before = capture_notes_state(&ctx.config.notes_root)?;
    let (tool_run, program) = if stage.is_scaffold() && kind == InvocationKind::Primary {
        (scaffold(ctx.config, &inv)?, SCAFFOLD_PROGRAM.to_string())
    } else {
        let request = ExecRequest {
            contract: ctx.contract.clone(),
            prompt: prompt.clone(),
            last_message_path: inv.last_message_path.clone(),
            stdout_log_path: inv.stdout_log_path.clone(),
            timeout: Duration::from_secs(ctx.settings.tool.timeout_secs),
            output_limit_bytes: ctx.settings.tool.output_limit_bytes,
        };
        let id = InvocationId {
            run_id: ctx.run_id,
            stage,
            seq,
            kind,
        };
        let retry = RetryPolicy::from_settings(&ctx.settings.tool);
        (
            run_tool(ctx.executor, id, &request, &inv, retry)?,
            ctx.settings.tool.program.clone(),
        )
    };

    let check = match tool_run.verdict {
        ToolVerdict::Completed => Some(run_check(ctx, stage, &inv)?),
        ToolVerdict::Failed { .. } => None,
    };

    let after = capture_notes_state(&ctx.config.notes_root)?;
    let changes = evaluate(&before, &after, &ctx.config.thresholds);
    persist_changes(&inv, &changes, &after)?;
    let stage_changes = match kind {
        InvocationKind::Primary => changes.clone(),
        InvocationKind::Remediation => evaluate(stage_start, &after, &ctx.config.thresholds),
    };
    write_atomic(&inv.stage_patch_path, stage_changes.patch.as_bytes())?;

    let (failure, message) = match &tool_run.verdict {
        ToolVerdict::Completed => (None, None),
        ToolVerdict::Failed { kind, message, .. } => (Some(*kind), Some(message.clone())),
    };
    let result = StageResult {
        run_id: ctx.run_id.to_string(),
        seq,
        stage,
        invocation: kind,
        outcome: stage_outcome(&tool_run.verdict, check.as_ref()),
        prompt,
        tool_log: relative_if_exists(&inv, &inv.stdout_log_path),
        tool_last_message: relative_if_exists(&inv, &inv.last_message_path),
        tool: ToolRecord {
            program,
            attempts: tool_run.attempts,
            retry_count: tool_run.retry_count,
            exit_code: tool_run.exit_code,
            failure,
            message,
        },
        check: match &check {
            Some(CheckVerdict::Report(report)) => Some(report.clone()),
            _ => None,
        },
        check_error: match &check {
            Some(CheckVerdict::RunnerError(message)) => Some(message.clone()),
            _ => None,
        },
        changes: changes.metrics,
        stage_changes: stage_changes.metrics,
        created_at: timestamp(),
    };
    write_stage_result(&inv.stage_result_path, &result)?;

    let decision = decide(
        &Observation {
            stage,
            invocation: kind,
            tool: &tool_run.verdict,
            check: check.as_ref(),
            threshold_breach: result.stage_changes.exceeded.as_deref(),
        },
        &ctx.policy,
    );
    info!(
        seq,
        invocation = ?kind,
        outcome = ?result.outcome,
        decision = ?decision,
        "invocation recorded"
    );
    Ok((result, decision))
}

/// Round0's primary invocation writes the scaffold locally.
fn scaffold(config: &ProjectConfig, inv: &InvocationPaths) -> Result<ToolRun> {
    let verdict = match init_round0(config, ScaffoldOptions::default()) {
        Ok(report) => {
            let summary = format!(
                "scaffold: created {}, updated {}, skipped {}\n",
                report.created.len(),
                report.updated.len(),
                report.skipped.len()
            );
            write_atomic(&inv.last_message_path, summary.as_bytes())?;
            ToolVerdict::Completed
        }
        Err(err) => {
            warn!(err = %format!("{err:#}"), "scaffold failed");
            ToolVerdict::Failed {
                kind: FailureKind::Unclassified,
                message: format!("{err:#}"),
                attempts: 1,
            }
        }
    };
    let exit_code = match verdict {
        ToolVerdict::Completed => Some(0),
        ToolVerdict::Failed { .. } => None,
    };
    Ok(ToolRun {
        verdict,
        attempts: 1,
        retry_count: 0,
        exit_code,
    })
}

fn run_check<E, C: CheckRunner>(
    ctx: &StageContext<'_, E, C>,
    stage: Stage,
    inv: &InvocationPaths,
) -> Result<CheckVerdict> {
    let request = CheckRequest {
        stage,
        config: ctx.config,
        settings: &ctx.settings.check,
        snapshot: Some(ctx.snapshot),
        pending_feedback: ctx.pending_feedback,
        script_log_path: inv.dir.join("check_script.log"),
    };
    match ctx.check_runner.validate(&request) {
        Ok(report) => {
            write_json_atomic(&inv.check_result_path, &report)?;
            Ok(CheckVerdict::Report(report))
        }
        Err(err) => {
            warn!(err = %format!("{err:#}"), "check runner failed");
            Ok(CheckVerdict::RunnerError(format!("{err:#}")))
        }
    }
}

fn relative_if_exists(inv: &InvocationPaths, path: &std::path::Path) -> Option<String> {
    if !path.exists() {
        return None;
    }
    path.strip_prefix(&inv.dir)
        .ok()
        .map(|rel| rel.to_string_lossy().into_owned())
}

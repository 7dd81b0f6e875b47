//! `notes-agent`: round-based notes generation for one course project.
//!
//! Every command prints JSON on stdout. Errors go to stderr and the exit code
//! follows [`notes_agent::exit_codes`].

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use notes_agent::core::stage::Stage;
use notes_agent::errors::WorkflowError;
use notes_agent::exit_codes;
use notes_agent::io::check::{CheckRequest, CheckRunner, NotesCheckRunner};
use notes_agent::io::config::load_settings;
use notes_agent::io::feedback::load_feedback;
use notes_agent::io::history::{Artifact, list_runs, read_artifact};
use notes_agent::io::project::{
    CreateProjectRequest, ProjectUpdate, ReviewGranularity, create_project, discover_projects,
    load_project, update_project,
};
use notes_agent::io::scaffold::{ScaffoldOptions, init_round0};
use notes_agent::io::snapshot::{SnapshotStore, SourceInput};
use notes_agent::logging;
use notes_agent::workflow::{ResumeOptions, RunOptions, RunOutcome, WorkflowOrchestrator};

#[derive(Parser)]
#[command(
    name = "notes-agent",
    version,
    about = "Round-based study notes generation workflow"
)]
struct Cli {
    /// Project root (the directory holding `project.yaml`).
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a project and its directory layout.
    CreateProject {
        course_id: String,
        /// Workspace holding `projects/<course>` and `notes/<course>`.
        #[arg(long)]
        workspace: Option<PathBuf>,
        #[arg(long)]
        project_root: Option<PathBuf>,
        #[arg(long)]
        notes_root: Option<PathBuf>,
        #[arg(long)]
        language: Option<String>,
        #[arg(long, value_parser = parse_granularity)]
        granularity: Option<ReviewGranularity>,
        /// Load an existing project instead of failing.
        #[arg(long)]
        allow_existing: bool,
    },
    /// Print the project configuration.
    ShowProject,
    /// List projects under a workspace.
    ListProjects {
        #[arg(long)]
        workspace: PathBuf,
    },
    /// Update project policy.
    Configure {
        #[arg(long)]
        language: Option<String>,
        #[arg(long, value_parser = parse_granularity)]
        granularity: Option<ReviewGranularity>,
        #[arg(long)]
        pause_after_each_stage: Option<bool>,
        #[arg(long)]
        pause_on_threshold: Option<bool>,
        /// Maximum changed files per stage, or `none`.
        #[arg(long)]
        max_changed_files: Option<Limit>,
        /// Maximum changed lines per stage, or `none`.
        #[arg(long)]
        max_changed_lines: Option<Limit>,
        #[arg(long)]
        network_allowed: Option<bool>,
        #[arg(long)]
        auto_remediate: Option<bool>,
        #[arg(long)]
        min_language_ratio: Option<f64>,
    },
    /// Capture sources (`PATH` or `PATH::LECTURE`) into a new read-only snapshot.
    Snapshot {
        #[arg(required = true)]
        sources: Vec<String>,
        #[arg(long)]
        id: Option<String>,
    },
    /// Recompute snapshot hashes and report mismatches.
    VerifySnapshot,
    /// Write the Round0 notes scaffold.
    InitRound0 {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
        #[arg(long)]
        no_flashcards: bool,
    },
    /// Validate `notes_root` as if `stage` had just finished.
    Check {
        #[arg(long, default_value = "final")]
        stage: Stage,
    },
    /// Start a new run over `from..=to`.
    Run {
        #[arg(long, default_value = "round0")]
        from: Stage,
        #[arg(long, default_value = "final")]
        to: Stage,
        #[arg(long)]
        run_id: Option<String>,
        /// Restrict stages to these lectures.
        #[arg(long = "lecture")]
        lectures: Vec<String>,
        #[arg(long)]
        allow_external_refs: bool,
        #[arg(long)]
        no_auto_remediate: bool,
    },
    /// Continue the active run.
    Resume {
        #[arg(long)]
        to: Option<Stage>,
        #[arg(long)]
        restart_from: Option<Stage>,
    },
    /// Pause the running run at its next stage boundary.
    Pause {
        #[arg(long, default_value = "")]
        reason: String,
    },
    /// Acknowledge a blocking failure after fixing its cause.
    ClearBlock {
        #[arg(long)]
        note: String,
    },
    /// Queue review feedback for round3.
    Feedback {
        #[arg(required = true)]
        items: Vec<String>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        author: Option<String>,
    },
    /// Print the round status and pending feedback.
    Status,
    /// List runs, newest first.
    Runs,
    /// Print one artifact of a run.
    Inspect {
        run_id: String,
        #[arg(long)]
        stage: Option<Stage>,
        #[arg(long, default_value = "patch")]
        artifact: Artifact,
    },
}

/// A change limit; `none` disables it.
#[derive(Debug, Clone, Copy)]
struct Limit(Option<usize>);

impl FromStr for Limit {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.eq_ignore_ascii_case("none") {
            return Ok(Limit(None));
        }
        raw.parse()
            .map(|n| Limit(Some(n)))
            .map_err(|_| format!("expected a number or `none`, got `{raw}`"))
    }
}

fn parse_granularity(raw: &str) -> Result<ReviewGranularity, String> {
    match raw {
        "section" => Ok(ReviewGranularity::Section),
        "lecture" => Ok(ReviewGranularity::Lecture),
        other => Err(format!("expected `section` or `lecture`, got `{other}`")),
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(error_exit_code(&err));
        }
    }
}

fn error_exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<WorkflowError>() {
        Some(workflow) if workflow.is_blocking() => exit_codes::FAILED_BLOCKING,
        _ => exit_codes::INVALID,
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let project = cli.project;
    match cli.command {
        Command::CreateProject {
            course_id,
            workspace,
            project_root,
            notes_root,
            language,
            granularity,
            allow_existing,
        } => {
            let config = create_project(
                &CreateProjectRequest {
                    course_id,
                    workspace_root: workspace,
                    project_root,
                    notes_root,
                    language,
                    review_granularity: granularity,
                },
                allow_existing,
            )?;
            print_json(&config)?;
            Ok(exit_codes::OK)
        }
        Command::ShowProject => {
            print_json(&load_project(&project)?)?;
            Ok(exit_codes::OK)
        }
        Command::ListProjects { workspace } => {
            print_json(&discover_projects(&workspace)?)?;
            Ok(exit_codes::OK)
        }
        Command::Configure {
            language,
            granularity,
            pause_after_each_stage,
            pause_on_threshold,
            max_changed_files,
            max_changed_lines,
            network_allowed,
            auto_remediate,
            min_language_ratio,
        } => {
            let config = update_project(
                &project,
                &ProjectUpdate {
                    language,
                    review_granularity: granularity,
                    pause_after_each_stage,
                    pause_on_change_threshold: pause_on_threshold,
                    max_changed_files: max_changed_files.map(|limit| limit.0),
                    max_changed_lines: max_changed_lines.map(|limit| limit.0),
                    network_allowed,
                    auto_remediate,
                    min_language_ratio,
                },
            )?;
            print_json(&config)?;
            Ok(exit_codes::OK)
        }
        Command::Snapshot { sources, id } => {
            let inputs: Vec<SourceInput> = sources.iter().map(|raw| parse_source(raw)).collect();
            let orchestrator = WorkflowOrchestrator::open(&project)?;
            let snapshot = orchestrator.snapshot(&inputs, id.as_deref())?;
            print_json(&snapshot)?;
            Ok(exit_codes::OK)
        }
        Command::VerifySnapshot => {
            let config = load_project(&project)?;
            let store = SnapshotStore::new(config.paths());
            let snapshot = store.current()?.ok_or(WorkflowError::NoSnapshot)?;
            let mismatches = store.verify(&snapshot)?;
            print_json(&json!({
                "snapshot_id": snapshot.snapshot_id,
                "passed": mismatches.is_empty(),
                "mismatches": mismatches,
            }))?;
            Ok(if mismatches.is_empty() {
                exit_codes::OK
            } else {
                exit_codes::FAILED_BLOCKING
            })
        }
        Command::InitRound0 {
            force,
            no_flashcards,
        } => {
            let config = load_project(&project)?;
            let report = init_round0(
                &config,
                ScaffoldOptions {
                    force,
                    flashcards: !no_flashcards,
                },
            )?;
            print_json(&report)?;
            Ok(exit_codes::OK)
        }
        Command::Check { stage } => {
            let config = load_project(&project)?;
            let paths = config.paths();
            let settings = load_settings(&paths.settings_path)?;
            let snapshot = SnapshotStore::new(paths.clone()).current()?;
            let pending = load_feedback(&paths.feedback_path)?.pending();
            let report = NotesCheckRunner.validate(&CheckRequest {
                stage,
                config: &config,
                settings: &settings.check,
                snapshot: snapshot.as_ref(),
                pending_feedback: &pending,
                script_log_path: paths.state_dir.join("check_script.log"),
            })?;
            print_json(&report)?;
            Ok(if report.passed {
                exit_codes::OK
            } else {
                exit_codes::INVALID
            })
        }
        Command::Run {
            from,
            to,
            run_id,
            lectures,
            allow_external_refs,
            no_auto_remediate,
        } => {
            let orchestrator = WorkflowOrchestrator::open(&project)?;
            let outcome = orchestrator.start(
                from,
                to,
                RunOptions {
                    run_id,
                    target_lectures: lectures,
                    allow_external_refs,
                    auto_remediate: no_auto_remediate.then_some(false),
                },
            )?;
            report_outcome(&outcome)
        }
        Command::Resume { to, restart_from } => {
            let orchestrator = WorkflowOrchestrator::open(&project)?;
            let outcome = orchestrator.resume(ResumeOptions {
                to_stage: to,
                restart_from,
            })?;
            report_outcome(&outcome)
        }
        Command::Pause { reason } => {
            let orchestrator = WorkflowOrchestrator::open(&project)?;
            let requested = orchestrator.pause(&reason)?;
            print_json(&json!({ "requested": requested, "already_paused": !requested }))?;
            Ok(exit_codes::OK)
        }
        Command::ClearBlock { note } => {
            let orchestrator = WorkflowOrchestrator::open(&project)?;
            print_json(&orchestrator.clear_block(&note)?)?;
            Ok(exit_codes::OK)
        }
        Command::Feedback {
            items,
            title,
            author,
        } => {
            let orchestrator = WorkflowOrchestrator::open(&project)?;
            let added =
                orchestrator.record_feedback(&items, title.as_deref(), author.as_deref())?;
            print_json(&added)?;
            Ok(exit_codes::OK)
        }
        Command::Status => {
            let orchestrator = WorkflowOrchestrator::open(&project)?;
            let status = orchestrator.status()?;
            let pending = load_feedback(&orchestrator.paths().feedback_path)?.pending();
            print_json(&json!({
                "course_id": orchestrator.config().course_id,
                "round_status": status,
                "pending_feedback": pending.len(),
            }))?;
            Ok(exit_codes::for_status(status.status))
        }
        Command::Runs => {
            let config = load_project(&project)?;
            print_json(&list_runs(&config.paths())?)?;
            Ok(exit_codes::OK)
        }
        Command::Inspect {
            run_id,
            stage,
            artifact,
        } => {
            let config = load_project(&project)?;
            let (path, contents) = read_artifact(&config.paths(), &run_id, stage, artifact)?;
            print_json(&json!({
                "run_id": run_id,
                "artifact": artifact.as_str(),
                "path": path,
                "contents": contents,
            }))?;
            Ok(exit_codes::OK)
        }
    }
}

fn parse_source(raw: &str) -> SourceInput {
    match raw.rsplit_once("::") {
        Some((path, lecture)) if !path.is_empty() && !lecture.is_empty() => SourceInput {
            path: PathBuf::from(path),
            lecture: Some(lecture.to_string()),
        },
        _ => SourceInput {
            path: PathBuf::from(raw),
            lecture: None,
        },
    }
}

fn report_outcome(outcome: &RunOutcome) -> Result<i32> {
    print_json(&json!({
        "run_id": outcome.run_id,
        "status": outcome.status,
        "last_completed_stage": outcome.last_completed_stage,
        "halt": outcome.halt,
        "stage_results": outcome
            .stage_results
            .iter()
            .map(|result| json!({
                "seq": result.seq,
                "stage": result.stage,
                "invocation": result.invocation,
                "outcome": result.outcome,
                "changes": result.changes,
                "stage_changes": result.stage_changes,
            }))
            .collect::<Vec<_>>(),
    }))?;
    Ok(exit_codes::for_status(outcome.status))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{payload}");
    Ok(())
}

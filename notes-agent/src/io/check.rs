//! Post-stage validation of `notes_root`.
//!
//! [`CheckRunner`] returns a structured report; expected validation failures
//! are rule results, only I/O trouble is an `Err`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use jsonschema::Draft;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::stage::Stage;
use crate::core::types::{CheckReport, CheckRule, RuleResult};
use crate::io::config::CheckSettings;
use crate::io::feedback::FeedbackItem;
use crate::io::process::run_captured;
use crate::io::project::ProjectConfig;
use crate::io::scaffold::{
    FEEDBACK_PATH, FLASHCARDS_HEADER, FLASHCARDS_PATH, LECTURES_DIR, MANIFEST_PATH, REQUIRED_PATHS,
};
use crate::io::snapshot::{SnapshotStore, SourceSnapshot};
use crate::io::state::write_atomic;

const CHECK_PAYLOAD_SCHEMA: &str = include_str!("schemas/check_payload.schema.json");
const CHECK_SCRIPT_PATH: &str = "scripts/check.sh";

/// Lecture prose shorter than this needs no `Source:` marker.
const ATTRIBUTION_MIN_CHARS: usize = 120;
/// Lecture prose with fewer letters than this is not ratio-checked.
const LANGUAGE_MIN_LETTERS: usize = 80;

static FENCED_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```|~~~.*?~~~").expect("valid regex"));
static INLINE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`[^`\n]*`").expect("valid regex"));
static LATIN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z]").expect("valid regex"));
static HAN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\p{Han}").expect("valid regex"));
static JAPANESE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{Han}\p{Hiragana}\p{Katakana}]").expect("valid regex"));
static HANGUL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\p{Hangul}").expect("valid regex"));

/// Inputs for one validation pass.
#[derive(Debug, Clone)]
pub struct CheckRequest<'a> {
    pub stage: Stage,
    pub config: &'a ProjectConfig,
    pub settings: &'a CheckSettings,
    pub snapshot: Option<&'a SourceSnapshot>,
    /// Feedback the stage was asked to resolve.
    pub pending_feedback: &'a [FeedbackItem],
    /// Where the check script's output is logged.
    pub script_log_path: PathBuf,
}

/// Pluggable validation capability.
pub trait CheckRunner {
    fn validate(&self, request: &CheckRequest<'_>) -> Result<CheckReport>;
}

impl<C: CheckRunner + ?Sized> CheckRunner for &C {
    fn validate(&self, request: &CheckRequest<'_>) -> Result<CheckReport> {
        (**self).validate(request)
    }
}

/// Built-in notes rules plus the optional `scripts/check.sh` hook.
#[derive(Debug, Default)]
pub struct NotesCheckRunner;

impl CheckRunner for NotesCheckRunner {
    #[instrument(skip_all, fields(stage = %request.stage))]
    fn validate(&self, request: &CheckRequest<'_>) -> Result<CheckReport> {
        let notes_root = &request.config.notes_root;
        let lectures = lecture_files(notes_root)?;

        let mut rules = vec![
            check_required_paths(notes_root),
            check_well_formed(notes_root, &lectures)?,
            check_attribution(&lectures),
            check_language_ratio(
                &lectures,
                &request.config.language,
                request.config.min_language_ratio,
            ),
        ];
        if request.stage.consumes_feedback() {
            rules.push(check_feedback_closed(notes_root, request.pending_feedback)?);
        }
        rules.push(check_snapshot_integrity(request)?);
        if request.settings.run_script
            && let Some(rule) = run_check_script(request)?
        {
            rules.push(rule);
        }

        let report = CheckReport::from_rules(rules);
        debug!(passed = report.passed, "notes check finished");
        Ok(report)
    }
}

/// A lecture markdown file and its text, when it decoded as UTF-8.
struct LectureFile {
    rel: String,
    text: Option<String>,
}

fn lecture_files(notes_root: &Path) -> Result<Vec<LectureFile>> {
    let dir = notes_root.join(LECTURES_DIR);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if !path.is_file() || !name.ends_with(".md") || name == "README.md" {
            continue;
        }
        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        files.push(LectureFile {
            rel: format!("{LECTURES_DIR}/{name}"),
            text: String::from_utf8(bytes).ok(),
        });
    }
    files.sort_by(|a, b| a.rel.cmp(&b.rel));
    Ok(files)
}

fn check_required_paths(notes_root: &Path) -> RuleResult {
    let errors = REQUIRED_PATHS
        .iter()
        .filter(|rel| !notes_root.join(rel).is_file())
        .map(|rel| format!("missing required path {rel}"))
        .collect();
    RuleResult::from_errors(CheckRule::RequiredPaths, errors)
}

#[derive(Deserialize)]
struct ManifestHead {
    course_id: Option<String>,
}

fn check_well_formed(notes_root: &Path, lectures: &[LectureFile]) -> Result<RuleResult> {
    let mut errors = Vec::new();

    let manifest_path = notes_root.join(MANIFEST_PATH);
    if manifest_path.is_file() {
        let contents = fs::read_to_string(&manifest_path)
            .with_context(|| format!("read {}", manifest_path.display()));
        match contents.map(|text| serde_yaml::from_str::<ManifestHead>(&text)) {
            Ok(Ok(ManifestHead {
                course_id: Some(id),
            })) if !id.trim().is_empty() => {}
            Ok(Ok(_)) => errors.push(format!("{MANIFEST_PATH} has no course_id")),
            Ok(Err(err)) => errors.push(format!("{MANIFEST_PATH} is not valid YAML: {err}")),
            Err(_) => errors.push(format!("{MANIFEST_PATH} is not valid UTF-8")),
        }
    }

    let flashcards_path = notes_root.join(FLASHCARDS_PATH);
    if flashcards_path.is_file() {
        let bytes = fs::read(&flashcards_path)
            .with_context(|| format!("read {}", flashcards_path.display()))?;
        let header = String::from_utf8_lossy(&bytes)
            .lines()
            .next()
            .map(|line| line.trim().trim_start_matches('\u{feff}').to_string());
        if header.as_deref() != Some(FLASHCARDS_HEADER) {
            errors.push(format!("{FLASHCARDS_PATH} must start with `{FLASHCARDS_HEADER}`"));
        }
    }

    for lecture in lectures {
        if lecture.text.is_none() {
            errors.push(format!("{} is not valid UTF-8", lecture.rel));
        }
    }
    Ok(RuleResult::from_errors(CheckRule::WellFormed, errors))
}

/// Lecture text with fenced and inline code removed.
fn prose(text: &str) -> String {
    let without_blocks = FENCED_CODE.replace_all(text, "");
    INLINE_CODE.replace_all(&without_blocks, "").into_owned()
}

fn check_attribution(lectures: &[LectureFile]) -> RuleResult {
    let mut errors = Vec::new();
    for lecture in lectures {
        let Some(text) = &lecture.text else { continue };
        let body = prose(text);
        let chars = body.chars().filter(|c| !c.is_whitespace()).count();
        if chars >= ATTRIBUTION_MIN_CHARS && !text.contains("Source:") {
            errors.push(format!("{} has no `Source:` attribution", lecture.rel));
        }
    }
    RuleResult::from_errors(CheckRule::Attribution, errors)
}

fn target_script(language: &str) -> Option<&'static Regex> {
    let primary = language
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    match primary.as_str() {
        "zh" => Some(&*HAN),
        "ja" => Some(&*JAPANESE),
        "ko" => Some(&*HANGUL),
        _ => None,
    }
}

/// Share of target-script letters among target and Latin letters.
pub fn language_ratio(text: &str, script: &Regex) -> (f64, usize) {
    let body = prose(text);
    let target = script.find_iter(&body).count();
    let latin = LATIN.find_iter(&body).count();
    let letters = target + latin;
    if letters == 0 {
        return (1.0, 0);
    }
    (target as f64 / letters as f64, letters)
}

fn check_language_ratio(lectures: &[LectureFile], language: &str, min_ratio: f64) -> RuleResult {
    let Some(script) = target_script(language) else {
        return RuleResult {
            rule: CheckRule::LanguageRatio,
            passed: true,
            errors: Vec::new(),
            warnings: vec![format!("language ratio not checked for `{language}`")],
        };
    };
    let mut errors = Vec::new();
    for lecture in lectures {
        let Some(text) = &lecture.text else { continue };
        let (ratio, letters) = language_ratio(text, script);
        if letters >= LANGUAGE_MIN_LETTERS && ratio < min_ratio {
            errors.push(format!(
                "{} language ratio {ratio:.2} below {min_ratio:.2}",
                lecture.rel
            ));
        }
    }
    RuleResult::from_errors(CheckRule::LanguageRatio, errors)
}

fn check_feedback_closed(notes_root: &Path, pending: &[FeedbackItem]) -> Result<RuleResult> {
    if pending.is_empty() {
        return Ok(RuleResult::from_errors(CheckRule::FeedbackClosed, Vec::new()));
    }
    let path = notes_root.join(FEEDBACK_PATH);
    let text = if path.is_file() {
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?
    } else {
        String::new()
    };
    let mut errors = Vec::new();
    for item in pending {
        let pattern = format!(r"(?m)^\s*[-*]\s*\[[xX]\].*\b{}\b", regex::escape(&item.id));
        let resolved = Regex::new(&pattern)
            .with_context(|| format!("compile feedback pattern for {}", item.id))?
            .is_match(&text);
        if !resolved {
            errors.push(format!("feedback {} is not marked resolved in {FEEDBACK_PATH}", item.id));
        }
    }
    Ok(RuleResult::from_errors(CheckRule::FeedbackClosed, errors))
}

fn check_snapshot_integrity(request: &CheckRequest<'_>) -> Result<RuleResult> {
    let Some(snapshot) = request.snapshot else {
        return Ok(RuleResult {
            rule: CheckRule::SnapshotIntegrity,
            passed: true,
            errors: Vec::new(),
            warnings: vec!["no snapshot captured".to_string()],
        });
    };
    let store = SnapshotStore::new(request.config.paths());
    let errors = store
        .verify(snapshot)?
        .iter()
        .map(ToString::to_string)
        .collect();
    Ok(RuleResult::from_errors(CheckRule::SnapshotIntegrity, errors))
}

#[derive(Debug, Deserialize)]
struct ScriptPayload {
    passed: bool,
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

/// Run `notes_root/scripts/check.sh <project_root>` when present.
fn run_check_script(request: &CheckRequest<'_>) -> Result<Option<RuleResult>> {
    let notes_root = &request.config.notes_root;
    let script = notes_root.join(CHECK_SCRIPT_PATH);
    if !script.is_file() {
        return Ok(None);
    }
    let mut cmd = Command::new("sh");
    cmd.arg(&script)
        .arg(&request.config.project_root)
        .current_dir(notes_root);
    let timeout = Duration::from_secs(request.settings.script_timeout_secs);
    let output = run_captured(cmd, None, timeout, request.settings.output_limit_bytes, None)
        .context("run check script")?;
    write_atomic(&request.script_log_path, output.render_log().as_bytes())?;

    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    if output.timed_out {
        errors.push(format!("{CHECK_SCRIPT_PATH} timed out after {}s", timeout.as_secs()));
        return Ok(Some(RuleResult {
            rule: CheckRule::CheckScript,
            passed: false,
            errors,
            warnings,
        }));
    }

    let stdout = output.stdout_text();
    // Plain-text output is allowed; only a JSON object is treated as a payload.
    let payload_passed = if stdout.trim_start().starts_with('{') {
        match parse_payload(stdout.trim()) {
            Ok(payload) => {
                errors.extend(payload.errors);
                warnings.extend(payload.warnings);
                payload.passed
            }
            Err(err) => {
                errors.push(format!("{CHECK_SCRIPT_PATH} payload rejected: {err:#}"));
                false
            }
        }
    } else {
        true
    };
    let exit_ok = output.status.success();
    if !exit_ok {
        warn!(exit_code = ?output.exit_code(), "check script failed");
        if errors.is_empty() {
            errors.push(format!(
                "{CHECK_SCRIPT_PATH} exited with {:?}",
                output.exit_code()
            ));
        }
    }
    if !payload_passed && errors.is_empty() {
        errors.push(format!("{CHECK_SCRIPT_PATH} reported failure"));
    }

    Ok(Some(RuleResult {
        rule: CheckRule::CheckScript,
        passed: exit_ok && payload_passed,
        errors,
        warnings,
    }))
}

/// Parse and schema-check a check script payload.
fn parse_payload(raw: &str) -> Result<ScriptPayload> {
    let instance: Value = serde_json::from_str(raw).context("parse check payload json")?;
    let schema: Value =
        serde_json::from_str(CHECK_PAYLOAD_SCHEMA).context("parse check payload schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile check payload schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        anyhow::bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    serde_json::from_value(instance).context("decode check payload")
}

//! Round0 scaffold: the fixed notes layout every later stage builds on.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::{debug, info};

use crate::io::project::{ProjectConfig, ReviewGranularity};
use crate::io::state::{timestamp, write_atomic};

pub const MANIFEST_PATH: &str = "index/manifest.yml";
pub const QUESTIONS_PATH: &str = "index/questions_backlog.md";
pub const GLOSSARY_PATH: &str = "index/glossary.md";
pub const LECTURES_DIR: &str = "notes/lectures";
pub const LECTURES_README_PATH: &str = "notes/lectures/README.md";
pub const CHEATSHEET_PATH: &str = "notes/cheatsheet.md";
pub const FLASHCARDS_PATH: &str = "notes/flashcards.csv";
pub const FEEDBACK_PATH: &str = "review/feedback.md";
pub const RUBRIC_PATH: &str = "review/rubric.md";

/// Paths the notes check requires to exist, relative to `notes_root`.
pub const REQUIRED_PATHS: &[&str] = &[
    MANIFEST_PATH,
    QUESTIONS_PATH,
    GLOSSARY_PATH,
    CHEATSHEET_PATH,
    FEEDBACK_PATH,
    RUBRIC_PATH,
];

pub const FLASHCARDS_HEADER: &str = "front,back,source";

const MANIFEST_TEMPLATE: &str = include_str!("templates/manifest.yml.j2");
const QUESTIONS_TEMPLATE: &str = include_str!("templates/questions_backlog.md");
const GLOSSARY_TEMPLATE: &str = include_str!("templates/glossary.md");
const LECTURES_README_TEMPLATE: &str = include_str!("templates/lectures_readme.md");
const CHEATSHEET_TEMPLATE: &str = include_str!("templates/cheatsheet.md");
const FLASHCARDS_TEMPLATE: &str = include_str!("templates/flashcards.csv");
const FEEDBACK_TEMPLATE: &str = include_str!("templates/feedback.md");
const RUBRIC_TEMPLATE: &str = include_str!("templates/rubric.md");

#[derive(Debug, Clone, Copy)]
pub struct ScaffoldOptions {
    /// Overwrite files that already exist.
    pub force: bool,
    pub flashcards: bool,
}

impl Default for ScaffoldOptions {
    fn default() -> Self {
        Self {
            force: false,
            flashcards: true,
        }
    }
}

/// Which scaffold files were touched, relative to `notes_root`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScaffoldReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub skipped: Vec<String>,
}

/// Write the Round0 layout into `notes_root` and record the marker under `project_root`.
pub fn init_round0(config: &ProjectConfig, options: ScaffoldOptions) -> Result<ScaffoldReport> {
    let now = timestamp();
    let manifest = render_manifest(config, &now)?;

    let mut files: Vec<(&str, &str)> = vec![
        (MANIFEST_PATH, manifest.as_str()),
        (QUESTIONS_PATH, QUESTIONS_TEMPLATE),
        (GLOSSARY_PATH, GLOSSARY_TEMPLATE),
        (LECTURES_README_PATH, LECTURES_README_TEMPLATE),
        (CHEATSHEET_PATH, CHEATSHEET_TEMPLATE),
        (FEEDBACK_PATH, FEEDBACK_TEMPLATE),
        (RUBRIC_PATH, RUBRIC_TEMPLATE),
    ];
    if options.flashcards {
        files.push((FLASHCARDS_PATH, FLASHCARDS_TEMPLATE));
    }

    let mut report = ScaffoldReport::default();
    for (rel, contents) in files {
        let path = config.notes_root.join(rel);
        let existed = path.exists();
        if existed && !options.force {
            report.skipped.push(rel.to_string());
            continue;
        }
        write_file(&path, contents)?;
        if existed {
            report.updated.push(rel.to_string());
        } else {
            report.created.push(rel.to_string());
        }
    }

    let marker = config.paths().round0_marker_path;
    if !marker.exists() || options.force {
        write_atomic(&marker, format!("{now}\n").as_bytes())?;
    }

    info!(
        created = report.created.len(),
        updated = report.updated.len(),
        skipped = report.skipped.len(),
        "round0 scaffold written"
    );
    Ok(report)
}

fn render_manifest(config: &ProjectConfig, generated_at: &str) -> Result<String> {
    let env = Environment::new();
    let granularity = match config.review_granularity {
        ReviewGranularity::Section => "section",
        ReviewGranularity::Lecture => "lecture",
    };
    let rendered = env
        .render_str(
            MANIFEST_TEMPLATE,
            context! {
                course_id => config.course_id,
                language => config.language,
                review_granularity => granularity,
                human_review_timing => config.human_review_timing,
                generated_at => generated_at,
            },
        )
        .context("render manifest template")?;
    Ok(format!("{}\n", rendered.trim_end()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    debug!(path = %path.display(), "writing scaffold file");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

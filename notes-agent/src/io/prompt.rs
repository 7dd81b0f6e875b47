//! Stage and remediation prompts rendered from minijinja templates.
//!
//! Templates mark sections with `<!-- section:KEY required|droppable -->`.
//! When the rendered prompt exceeds the byte budget, droppable sections are
//! removed first and the last section is truncated as a final resort.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::stage::Stage;
use crate::io::feedback::FeedbackItem;
use crate::io::project::ProjectConfig;
use crate::io::snapshot::SourceSnapshot;

const STAGE_TEMPLATE: &str = include_str!("prompts/stage.md");
const REMEDIATION_TEMPLATE: &str = include_str!("prompts/remediation.md");

/// Default byte budget for a rendered prompt.
pub const DEFAULT_PROMPT_BUDGET: usize = 64_000;

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("valid regex")
});

#[derive(Debug, Clone, Serialize)]
struct SourceEntry {
    path: String,
    lecture: Option<String>,
}

/// Everything a stage prompt depends on.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub stage: Stage,
    pub config: &'a ProjectConfig,
    pub snapshot: &'a SourceSnapshot,
    pub target_lectures: &'a [String],
    pub allow_external_refs: bool,
    /// Only rendered for the feedback stage.
    pub pending_feedback: &'a [FeedbackItem],
}

impl PromptInputs<'_> {
    fn feedback(&self) -> &[FeedbackItem] {
        if self.stage.consumes_feedback() {
            self.pending_feedback
        } else {
            &[]
        }
    }
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |next| next.start());
        let content = rendered[whole.end()..end].trim().to_string();
        if content.is_empty() {
            continue;
        }
        sections.push(ParsedSection {
            key: key.as_str().to_string(),
            required: kind.as_str() == "required",
            content,
        });
    }
    sections
}

fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total = |secs: &[ParsedSection]| secs.iter().map(|s| s.content.len()).sum::<usize>();
    while total(sections) > budget {
        let Some(idx) = sections.iter().rposition(|s| !s.required) else {
            break;
        };
        let dropped = sections.remove(idx);
        debug!(
            section = %dropped.key,
            bytes_dropped = dropped.content.len(),
            "dropped prompt section for budget"
        );
    }

    let over = total(sections).saturating_sub(budget);
    if over == 0 {
        return;
    }
    if let Some(last) = sections.last_mut() {
        let mut keep = last.content.len().saturating_sub(over + 12);
        while !last.content.is_char_boundary(keep) {
            keep -= 1;
        }
        last.content.truncate(keep);
        last.content.push_str("\n[truncated]");
        debug!(
            section = %last.key,
            after_len = last.content.len(),
            "truncated prompt section for budget"
        );
    }
}

fn join_sections(sections: &[ParsedSection]) -> String {
    let mut out = sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    out.push('\n');
    out
}

/// Renders prompts within a byte budget.
#[derive(Debug)]
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("stage", STAGE_TEMPLATE)?;
        env.add_template("remediation", REMEDIATION_TEMPLATE)?;
        Ok(Self { env, budget_bytes })
    }

    /// Prompt for the primary invocation of a stage.
    pub fn stage_prompt(&self, input: &PromptInputs<'_>) -> Result<String> {
        let sources: Vec<SourceEntry> = input
            .snapshot
            .files
            .iter()
            .map(|file| SourceEntry {
                path: file.snapshot_path.clone(),
                lecture: file.lecture.clone(),
            })
            .collect();
        let rendered = self.env.get_template("stage")?.render(context! {
            course_id => input.config.course_id,
            stage => input.stage.as_str(),
            task => input.stage.task(),
            notes_root => input.config.notes_root.display().to_string(),
            snapshot_root => input.snapshot.root.display().to_string(),
            language => input.config.language,
            review_granularity => input.config.review_granularity,
            allow_external_refs => input.allow_external_refs && input.stage == Stage::Final,
            target_lectures => input.target_lectures,
            feedback => input.feedback(),
            sources => sources,
        })?;
        Ok(self.finish(&rendered))
    }

    /// Prompt for the single remediation invocation after a failed check.
    pub fn remediation_prompt(
        &self,
        input: &PromptInputs<'_>,
        errors: &[String],
        warnings: &[String],
    ) -> Result<String> {
        let rendered = self.env.get_template("remediation")?.render(context! {
            course_id => input.config.course_id,
            stage => input.stage.as_str(),
            notes_root => input.config.notes_root.display().to_string(),
            language => input.config.language,
            errors => errors,
            warnings => warnings,
            feedback => input.feedback(),
        })?;
        Ok(self.finish(&rendered))
    }

    fn finish(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget(&mut sections, self.budget_bytes);
        join_sections(&sections)
    }
}

//! Durable review feedback queue (`state/feedback.json`).
//!
//! Items are consumed by the feedback stage, which must mark each id resolved
//! in `review/feedback.md`. Recording feedback never touches run status.

use std::path::Path;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::io::state::{read_json, timestamp, write_json_atomic};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackItem {
    pub id: String,
    pub text: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub added_at: String,
    pub addressed_by_run: Option<String>,
    pub addressed_at: Option<String>,
}

impl FeedbackItem {
    pub fn is_pending(&self) -> bool {
        self.addressed_at.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackQueue {
    pub items: Vec<FeedbackItem>,
}

impl FeedbackQueue {
    pub fn pending(&self) -> Vec<FeedbackItem> {
        self.items
            .iter()
            .filter(|item| item.is_pending())
            .cloned()
            .collect()
    }

    fn next_number(&self) -> u32 {
        self.items
            .iter()
            .filter_map(|item| item.id.strip_prefix("fb-")?.parse::<u32>().ok())
            .max()
            .unwrap_or(0)
            + 1
    }
}

pub fn load_feedback(path: &Path) -> Result<FeedbackQueue> {
    if !path.exists() {
        return Ok(FeedbackQueue::default());
    }
    read_json(path)
}

/// Append non-blank `items` to the queue and return the new entries.
pub fn record_feedback(
    path: &Path,
    items: &[String],
    title: Option<&str>,
    author: Option<&str>,
) -> Result<Vec<FeedbackItem>> {
    let texts: Vec<&str> = items
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .collect();
    if texts.is_empty() {
        bail!("no feedback items given");
    }

    let mut queue = load_feedback(path)?;
    let mut number = queue.next_number();
    let added_at = timestamp();
    let mut added = Vec::with_capacity(texts.len());
    for text in texts {
        let item = FeedbackItem {
            id: format!("fb-{number:04}"),
            text: text.to_string(),
            title: title.map(str::to_string),
            author: author.map(str::to_string),
            added_at: added_at.clone(),
            addressed_by_run: None,
            addressed_at: None,
        };
        number += 1;
        added.push(item.clone());
        queue.items.push(item);
    }
    write_json_atomic(path, &queue)?;
    info!(count = added.len(), "recorded feedback");
    Ok(added)
}

/// Mark `ids` addressed by `run_id`. Returns how many items changed.
pub fn mark_addressed(path: &Path, ids: &[String], run_id: &str) -> Result<usize> {
    let mut queue = load_feedback(path)?;
    let now = timestamp();
    let mut changed = 0;
    for item in &mut queue.items {
        if item.is_pending() && ids.contains(&item.id) {
            item.addressed_at = Some(now.clone());
            item.addressed_by_run = Some(run_id.to_string());
            changed += 1;
        }
    }
    if changed > 0 {
        write_json_atomic(path, &queue)?;
    }
    Ok(changed)
}

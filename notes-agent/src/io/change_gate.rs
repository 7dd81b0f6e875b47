//! Size-of-change measurement between two states of `notes_root`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::core::line_diff::diff_lines;
use crate::core::types::{ChangeMetrics, ChangeThresholds};
use crate::io::paths::InvocationPaths;
use crate::io::state::{write_atomic, write_json_atomic};

const PATCH_CONTEXT_LINES: usize = 3;

/// Contents of one file in a captured state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub sha256: String,
    /// `None` for files that are not UTF-8.
    pub text: Option<String>,
    pub bytes: Vec<u8>,
}

/// Every file under `notes_root`, keyed by `/`-separated relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotesState {
    pub files: BTreeMap<String, FileState>,
}

/// Read the whole notes tree. A missing root is an empty state.
pub fn capture_notes_state(notes_root: &Path) -> Result<NotesState> {
    let mut files = BTreeMap::new();
    if !notes_root.is_dir() {
        return Ok(NotesState { files });
    }
    for entry in WalkDir::new(notes_root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git")
    {
        let entry = entry.with_context(|| format!("walk {}", notes_root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(notes_root)
            .with_context(|| format!("relativize {}", entry.path().display()))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let bytes =
            fs::read(entry.path()).with_context(|| format!("read {}", entry.path().display()))?;
        let sha256 = hex::encode(Sha256::digest(&bytes));
        let text = String::from_utf8(bytes.clone()).ok();
        files.insert(rel, FileState { sha256, text, bytes });
    }
    debug!(files = files.len(), "captured notes state");
    Ok(NotesState { files })
}

/// Difference between two notes states.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub metrics: ChangeMetrics,
    #[serde(skip)]
    pub patch: String,
}

/// Diff `before` against `after` and compare against `thresholds`.
pub fn evaluate(
    before: &NotesState,
    after: &NotesState,
    thresholds: &ChangeThresholds,
) -> ChangeSet {
    let mut changes = ChangeSet::default();
    let mut added_lines = 0usize;
    let mut removed_lines = 0usize;

    let mut paths: Vec<&String> = before.files.keys().chain(after.files.keys()).collect();
    paths.sort();
    paths.dedup();

    for rel in paths {
        let old = before.files.get(rel);
        let new = after.files.get(rel);
        match (old, new) {
            (Some(a), Some(b)) if a.sha256 == b.sha256 => continue,
            (Some(_), Some(_)) => changes.modified.push(rel.clone()),
            (None, Some(_)) => changes.added.push(rel.clone()),
            (Some(_), None) => changes.deleted.push(rel.clone()),
            (None, None) => continue,
        }

        let old_label = match old {
            Some(_) => format!("a/{rel}"),
            None => "/dev/null".to_string(),
        };
        let new_label = match new {
            Some(_) => format!("b/{rel}"),
            None => "/dev/null".to_string(),
        };
        let old_text = old.map(|f| f.text.as_deref());
        let new_text = new.map(|f| f.text.as_deref());
        match (old_text.unwrap_or(Some("")), new_text.unwrap_or(Some(""))) {
            (Some(a), Some(b)) => {
                let diff = diff_lines(a, b);
                added_lines += diff.added();
                removed_lines += diff.removed();
                changes
                    .patch
                    .push_str(&diff.unified(&old_label, &new_label, PATCH_CONTEXT_LINES));
            }
            _ => {
                changes
                    .patch
                    .push_str(&format!("Binary files {old_label} and {new_label} differ\n"));
            }
        }
    }

    let files_changed = changes.added.len() + changes.modified.len() + changes.deleted.len();
    let lines_changed = added_lines + removed_lines;
    let exceeded = thresholds.breach(files_changed, lines_changed);
    if let Some(reason) = &exceeded {
        warn!(reason = %reason, "change threshold exceeded");
    }
    changes.metrics = ChangeMetrics {
        files_added: changes.added.len(),
        files_modified: changes.modified.len(),
        files_deleted: changes.deleted.len(),
        files_changed,
        lines_added: added_lines,
        lines_removed: removed_lines,
        lines_changed,
        exceeded,
    };
    changes
}

/// Write `changes.patch`, `diff_summary.json` and a copy of every changed file.
pub fn persist_changes(
    paths: &InvocationPaths,
    changes: &ChangeSet,
    after: &NotesState,
) -> Result<()> {
    write_atomic(&paths.patch_path, changes.patch.as_bytes())?;
    write_json_atomic(&paths.diff_summary_path, changes)?;
    for rel in changes.added.iter().chain(&changes.modified) {
        if let Some(file) = after.files.get(rel) {
            let dest = paths.notes_snapshot_dir.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create directory {}", parent.display()))?;
            }
            fs::write(&dest, &file.bytes).with_context(|| format!("write {}", dest.display()))?;
        }
    }
    if !changes.deleted.is_empty() {
        write_json_atomic(
            &paths.notes_snapshot_dir.join("deleted_files.json"),
            &changes.deleted,
        )?;
    }
    Ok(())
}

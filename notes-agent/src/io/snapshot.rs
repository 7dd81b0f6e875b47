//! Content-addressed, read-only snapshots of source material.
//!
//! A capture copies every input into `artifacts/snapshots/<id>/`, hashing each
//! file while it is copied, then marks the tree read-only. Stages only ever see
//! the copy; [`SnapshotStore::verify`] detects any later modification.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::core::path::{safe_name, validate_component};
use crate::io::paths::ProjectPaths;
use crate::io::state::{read_json, timestamp, write_json_atomic};

/// A source path that could not be read during capture. Nothing was written.
#[derive(Debug, Error)]
#[error("source unreadable: {path}: {message}")]
pub struct SourceUnreadableError {
    pub path: PathBuf,
    pub message: String,
}

/// One user-selected input and the lecture it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInput {
    pub path: PathBuf,
    pub lecture: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSource {
    pub source_id: String,
    pub source_path: PathBuf,
    pub source_type: SourceType,
    /// Relative to the snapshot directory.
    pub snapshot_rel_path: String,
    pub lecture: Option<String>,
    pub file_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub source_id: String,
    pub original_path: PathBuf,
    /// Relative to the snapshot directory, `/`-separated.
    pub snapshot_path: String,
    pub sha256: String,
    pub size: u64,
    pub lecture: Option<String>,
}

/// Persisted as `artifacts/source_index.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub snapshot_id: String,
    pub created_at: String,
    pub root: PathBuf,
    pub sources: Vec<SnapshotSource>,
    pub files: Vec<SnapshotFile>,
}

/// Persisted as `artifacts/source_hashes.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceHashes {
    pub snapshot_id: String,
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchReason {
    Missing,
    HashMismatch,
    Unexpected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub path: String,
    pub reason: MismatchReason,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.reason {
            MismatchReason::Missing => write!(f, "missing {}", self.path),
            MismatchReason::HashMismatch => write!(f, "hash mismatch {}", self.path),
            MismatchReason::Unexpected => write!(f, "unexpected file {}", self.path),
        }
    }
}

/// Snapshot capture and verification for one project.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    paths: ProjectPaths,
}

impl SnapshotStore {
    pub fn new(paths: ProjectPaths) -> Self {
        Self { paths }
    }

    /// Copy `inputs` into a new read-only snapshot and make it current.
    ///
    /// Every input is checked for readability before anything is written; a
    /// failure is a [`SourceUnreadableError`].
    #[instrument(skip_all, fields(inputs = inputs.len()))]
    pub fn capture(
        &self,
        inputs: &[SourceInput],
        snapshot_id: Option<&str>,
    ) -> Result<SourceSnapshot> {
        if inputs.is_empty() {
            bail!("no source paths given");
        }
        for input in inputs {
            ensure_readable(&input.path)?;
        }

        let snapshot_id = match snapshot_id {
            Some(id) => {
                validate_component("snapshot id", id).map_err(|msg| anyhow!(msg))?;
                if self.paths.snapshot_dir(id).exists() {
                    bail!("snapshot {id} already exists");
                }
                id.to_string()
            }
            None => self.fresh_snapshot_id(),
        };

        let final_dir = self.paths.snapshot_dir(&snapshot_id);
        let staging_dir = self.paths.snapshots_dir.join(format!(".{snapshot_id}.partial"));
        if staging_dir.exists() {
            fs::remove_dir_all(&staging_dir)
                .with_context(|| format!("remove stale staging dir {}", staging_dir.display()))?;
        }
        fs::create_dir_all(&staging_dir)
            .with_context(|| format!("create staging dir {}", staging_dir.display()))?;

        let mut sources = Vec::with_capacity(inputs.len());
        let mut files = Vec::new();
        for (idx, input) in inputs.iter().enumerate() {
            let source_id = format!("src_{:04}", idx + 1);
            let base_name = input
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let entry_name = format!("{:03}_{}", idx + 1, safe_name(&base_name));
            let dest_root = staging_dir.join(&entry_name);

            let is_dir = input.path.is_dir();
            let before = files.len();
            if is_dir {
                for entry in WalkDir::new(&input.path).sort_by_file_name() {
                    let entry = entry.map_err(|err| SourceUnreadableError {
                        path: input.path.clone(),
                        message: err.to_string(),
                    })?;
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let rel = entry
                        .path()
                        .strip_prefix(&input.path)
                        .with_context(|| format!("relativize {}", entry.path().display()))?;
                    let dest = dest_root.join(rel);
                    let (sha256, size) = copy_and_hash(entry.path(), &dest)?;
                    files.push(SnapshotFile {
                        source_id: source_id.clone(),
                        original_path: entry.path().to_path_buf(),
                        snapshot_path: rel_string(&Path::new(&entry_name).join(rel)),
                        sha256,
                        size,
                        lecture: input.lecture.clone(),
                    });
                }
            } else {
                let (sha256, size) = copy_and_hash(&input.path, &dest_root)?;
                files.push(SnapshotFile {
                    source_id: source_id.clone(),
                    original_path: input.path.clone(),
                    snapshot_path: entry_name.clone(),
                    sha256,
                    size,
                    lecture: input.lecture.clone(),
                });
            }

            sources.push(SnapshotSource {
                source_id,
                source_path: input.path.clone(),
                source_type: if is_dir {
                    SourceType::Directory
                } else {
                    SourceType::File
                },
                snapshot_rel_path: entry_name,
                lecture: input.lecture.clone(),
                file_count: files.len() - before,
            });
        }

        fs::rename(&staging_dir, &final_dir)
            .with_context(|| format!("publish snapshot {}", final_dir.display()))?;
        mark_read_only(&final_dir)?;

        let snapshot = SourceSnapshot {
            snapshot_id: snapshot_id.clone(),
            created_at: timestamp(),
            root: final_dir,
            sources,
            files,
        };
        let hashes = SourceHashes {
            snapshot_id: snapshot_id.clone(),
            files: snapshot
                .files
                .iter()
                .map(|file| (file.snapshot_path.clone(), file.sha256.clone()))
                .collect(),
        };
        write_json_atomic(
            &self.paths.snapshot_history_dir.join(format!("{snapshot_id}.json")),
            &snapshot,
        )?;
        write_json_atomic(&self.paths.source_hashes_path, &hashes)?;
        write_json_atomic(&self.paths.source_index_path, &snapshot)?;

        info!(snapshot_id = %snapshot_id, files = snapshot.files.len(), "captured snapshot");
        Ok(snapshot)
    }

    /// The snapshot stages currently read from, if one was captured.
    pub fn current(&self) -> Result<Option<SourceSnapshot>> {
        if !self.paths.source_index_path.exists() {
            return Ok(None);
        }
        read_json(&self.paths.source_index_path).map(Some)
    }

    /// Recompute every hash. An empty result means the snapshot is intact.
    #[instrument(skip_all, fields(snapshot_id = %snapshot.snapshot_id))]
    pub fn verify(&self, snapshot: &SourceSnapshot) -> Result<Vec<Mismatch>> {
        let mut mismatches = Vec::new();
        let mut recorded = BTreeSet::new();
        for file in &snapshot.files {
            recorded.insert(file.snapshot_path.clone());
            let path = snapshot.root.join(&file.snapshot_path);
            if !path.is_file() {
                mismatches.push(Mismatch {
                    path: file.snapshot_path.clone(),
                    reason: MismatchReason::Missing,
                    expected: Some(file.sha256.clone()),
                    actual: None,
                });
                continue;
            }
            let actual = hash_file(&path)?;
            if actual != file.sha256 {
                mismatches.push(Mismatch {
                    path: file.snapshot_path.clone(),
                    reason: MismatchReason::HashMismatch,
                    expected: Some(file.sha256.clone()),
                    actual: Some(actual),
                });
            }
        }

        if snapshot.root.is_dir() {
            for entry in WalkDir::new(&snapshot.root).sort_by_file_name() {
                let entry = entry.with_context(|| format!("walk {}", snapshot.root.display()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&snapshot.root)
                    .with_context(|| format!("relativize {}", entry.path().display()))?;
                let rel = rel_string(rel);
                if !recorded.contains(&rel) {
                    mismatches.push(Mismatch {
                        path: rel,
                        reason: MismatchReason::Unexpected,
                        expected: None,
                        actual: Some(hash_file(entry.path())?),
                    });
                }
            }
        }

        if mismatches.is_empty() {
            debug!("snapshot verified");
        } else {
            warn!(mismatches = mismatches.len(), "snapshot verification failed");
        }
        Ok(mismatches)
    }

    fn fresh_snapshot_id(&self) -> String {
        let base = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        if !self.paths.snapshot_dir(&base).exists() {
            return base;
        }
        let mut suffix = 2u32;
        loop {
            let candidate = format!("{base}-{suffix}");
            if !self.paths.snapshot_dir(&candidate).exists() {
                return candidate;
            }
            suffix += 1;
        }
    }
}

fn ensure_readable(path: &Path) -> Result<()> {
    let unreadable = |message: String| SourceUnreadableError {
        path: path.to_path_buf(),
        message,
    };
    let meta = fs::metadata(path).map_err(|err| unreadable(err.to_string()))?;
    if meta.is_file() {
        File::open(path).map_err(|err| unreadable(err.to_string()))?;
        return Ok(());
    }
    if !meta.is_dir() {
        return Err(unreadable("not a regular file or directory".to_string()).into());
    }
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(|err| unreadable(err.to_string()))?;
        if entry.file_type().is_file() {
            File::open(entry.path()).map_err(|err| SourceUnreadableError {
                path: entry.path().to_path_buf(),
                message: err.to_string(),
            })?;
        }
    }
    Ok(())
}

fn copy_and_hash(src: &Path, dest: &Path) -> Result<(String, u64)> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut reader = File::open(src).map_err(|err| SourceUnreadableError {
        path: src.to_path_buf(),
        message: err.to_string(),
    })?;
    let mut writer = File::create(dest).with_context(|| format!("create {}", dest.display()))?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut chunk = [0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut chunk)
            .with_context(|| format!("read {}", src.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
        writer
            .write_all(&chunk[..n])
            .with_context(|| format!("write {}", dest.display()))?;
        size += n as u64;
    }
    writer
        .sync_all()
        .with_context(|| format!("sync {}", dest.display()))?;
    Ok((hex::encode(hasher.finalize()), size))
}

/// Streaming SHA-256 of a file, hex encoded.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut chunk = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut chunk)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn rel_string(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Files become 0444 and directories 0555, children before parents.
fn mark_read_only(root: &Path) -> Result<()> {
    for entry in WalkDir::new(root).contents_first(true) {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        set_read_only(entry.path(), entry.file_type().is_dir())?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_read_only(path: &Path, is_dir: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = if is_dir { 0o555 } else { 0o444 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("mark read-only {}", path.display()))
}

#[cfg(not(unix))]
fn set_read_only(path: &Path, is_dir: bool) -> Result<()> {
    if is_dir {
        return Ok(());
    }
    let mut perms = fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms).with_context(|| format!("mark read-only {}", path.display()))
}

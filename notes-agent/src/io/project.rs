//! Project configuration (`project_root/project.yaml`) and project discovery.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::path::slugify;
use crate::core::types::{ChangeThresholds, PausePolicy};
use crate::io::paths::{ProjectPaths, is_within};
use crate::io::state::{RoundStatus, timestamp, write_atomic, write_round_status};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewGranularity {
    #[default]
    Section,
    Lecture,
}

/// Per-project policy. Mutated only through [`update_project`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub course_id: String,
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    pub project_root: PathBuf,
    pub notes_root: PathBuf,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub review_granularity: ReviewGranularity,
    #[serde(default = "default_review_timing")]
    pub human_review_timing: String,
    #[serde(default)]
    pub pause_policy: PausePolicy,
    #[serde(default)]
    pub thresholds: ChangeThresholds,
    #[serde(default)]
    pub network_allowed: bool,
    #[serde(default = "default_true")]
    pub auto_remediate: bool,
    /// Minimum share of target-script characters in lecture prose.
    #[serde(default = "default_language_ratio")]
    pub min_language_ratio: f64,
    pub created_at: String,
    pub updated_at: String,
}

fn default_language() -> String {
    "zh-CN".to_string()
}

fn default_review_timing() -> String {
    "final_only".to_string()
}

fn default_true() -> bool {
    true
}

fn default_language_ratio() -> f64 {
    0.75
}

impl ProjectConfig {
    pub fn paths(&self) -> ProjectPaths {
        ProjectPaths::new(&self.project_root)
    }

    /// Check the root layout the tool invocation contract depends on.
    pub fn validate(&self) -> Result<()> {
        if self.course_id.trim().is_empty() {
            bail!("course_id must not be empty");
        }
        if self.notes_root == self.project_root {
            bail!("notes_root must differ from project_root");
        }
        let artifacts = self.paths().artifacts_dir;
        if is_within(&self.notes_root, &artifacts) || is_within(&artifacts, &self.notes_root) {
            bail!(
                "notes_root {} overlaps the snapshot store {}",
                self.notes_root.display(),
                artifacts.display()
            );
        }
        if is_within(&self.project_root, &self.notes_root) {
            bail!(
                "project_root {} must not live inside notes_root {}",
                self.project_root.display(),
                self.notes_root.display()
            );
        }
        if self.language.trim().is_empty() {
            bail!("language must not be empty");
        }
        if !(0.0..=1.0).contains(&self.min_language_ratio) {
            bail!("min_language_ratio must be within 0.0..=1.0");
        }
        Ok(())
    }
}

/// Inputs for [`create_project`].
#[derive(Debug, Clone, Default)]
pub struct CreateProjectRequest {
    pub course_id: String,
    pub workspace_root: Option<PathBuf>,
    pub project_root: Option<PathBuf>,
    pub notes_root: Option<PathBuf>,
    pub language: Option<String>,
    pub review_granularity: Option<ReviewGranularity>,
}

/// Partial update applied by [`update_project`]. `None` leaves a field alone.
#[derive(Debug, Clone, Default)]
pub struct ProjectUpdate {
    pub language: Option<String>,
    pub review_granularity: Option<ReviewGranularity>,
    pub pause_after_each_stage: Option<bool>,
    pub pause_on_change_threshold: Option<bool>,
    /// `Some(None)` removes the limit.
    pub max_changed_files: Option<Option<usize>>,
    pub max_changed_lines: Option<Option<usize>>,
    pub network_allowed: Option<bool>,
    pub auto_remediate: Option<bool>,
    pub min_language_ratio: Option<f64>,
}

/// Create the project layout and its `project.yaml`.
///
/// With `allow_existing`, an existing project is loaded and its directories
/// are re-created if missing; otherwise an existing project is an error.
pub fn create_project(
    request: &CreateProjectRequest,
    allow_existing: bool,
) -> Result<ProjectConfig> {
    let course_id = slugify(&request.course_id)
        .ok_or_else(|| anyhow!("course id `{}` has no usable characters", request.course_id))?;
    let workspace_root = request.workspace_root.as_deref().map(absolute).transpose()?;

    let project_root = match (&request.project_root, &workspace_root) {
        (Some(root), _) => absolute(root)?,
        (None, Some(ws)) => ws.join("projects").join(&course_id),
        (None, None) => bail!("project_root or workspace_root is required"),
    };
    let notes_root = match (&request.notes_root, &workspace_root) {
        (Some(root), _) => absolute(root)?,
        (None, Some(ws)) => ws.join("notes").join(&course_id),
        (None, None) => bail!("notes_root or workspace_root is required"),
    };

    let paths = ProjectPaths::new(&project_root);
    if paths.project_config_path.exists() {
        if !allow_existing {
            bail!("project already exists at {}", project_root.display());
        }
        let config = load_project(&project_root)?;
        ensure_layout(&config)?;
        return Ok(config);
    }

    let now = timestamp();
    let config = ProjectConfig {
        course_id,
        workspace_root,
        project_root,
        notes_root,
        language: request.language.clone().unwrap_or_else(default_language),
        review_granularity: request.review_granularity.unwrap_or_default(),
        human_review_timing: default_review_timing(),
        pause_policy: PausePolicy::default(),
        thresholds: ChangeThresholds::default(),
        network_allowed: false,
        auto_remediate: true,
        min_language_ratio: default_language_ratio(),
        created_at: now.clone(),
        updated_at: now,
    };
    config.validate()?;
    ensure_layout(&config)?;
    write_project(&config)?;
    info!(
        course_id = %config.course_id,
        project_root = %config.project_root.display(),
        "created project"
    );
    Ok(config)
}

fn ensure_layout(config: &ProjectConfig) -> Result<()> {
    let paths = config.paths();
    for dir in [
        &paths.state_dir,
        &paths.runs_dir,
        &paths.artifacts_dir,
        &config.notes_root,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    if !paths.round_status_path.exists() {
        write_round_status(&paths.round_status_path, &RoundStatus::default())?;
    }
    Ok(())
}

pub fn load_project(project_root: &Path) -> Result<ProjectConfig> {
    let path = ProjectPaths::new(project_root).project_config_path;
    debug!(path = %path.display(), "loading project config");
    let contents = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let config: ProjectConfig =
        serde_yaml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid project config {}", path.display()))?;
    Ok(config)
}

pub fn write_project(config: &ProjectConfig) -> Result<()> {
    config.validate()?;
    let path = config.paths().project_config_path;
    let buf = serde_yaml::to_string(config).context("serialize project yaml")?;
    write_atomic(&path, buf.as_bytes())
}

/// Apply `update` and persist the result.
pub fn update_project(project_root: &Path, update: &ProjectUpdate) -> Result<ProjectConfig> {
    let mut config = load_project(project_root)?;
    if let Some(language) = &update.language {
        config.language.clone_from(language);
    }
    if let Some(granularity) = update.review_granularity {
        config.review_granularity = granularity;
    }
    if let Some(flag) = update.pause_after_each_stage {
        config.pause_policy.after_each_stage = flag;
    }
    if let Some(flag) = update.pause_on_change_threshold {
        config.pause_policy.on_change_threshold = flag;
    }
    if let Some(limit) = update.max_changed_files {
        config.thresholds.max_changed_files = limit;
    }
    if let Some(limit) = update.max_changed_lines {
        config.thresholds.max_changed_lines = limit;
    }
    if let Some(flag) = update.network_allowed {
        config.network_allowed = flag;
    }
    if let Some(flag) = update.auto_remediate {
        config.auto_remediate = flag;
    }
    if let Some(ratio) = update.min_language_ratio {
        config.min_language_ratio = ratio;
    }
    config.updated_at = timestamp();
    write_project(&config)?;
    info!(course_id = %config.course_id, "updated project config");
    Ok(config)
}

/// Every project under `<workspace>/projects/*/project.yaml`, ordered by directory name.
pub fn discover_projects(workspace_root: &Path) -> Result<Vec<ProjectConfig>> {
    let projects_dir = workspace_root.join("projects");
    if !projects_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut roots: Vec<PathBuf> = fs::read_dir(&projects_dir)
        .with_context(|| format!("read {}", projects_dir.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| ProjectPaths::new(path).project_config_path.is_file())
        .collect();
    roots.sort();
    roots.iter().map(|root| load_project(root)).collect()
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("resolve {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RunStatus;
    use crate::io::state::load_round_status;

    fn request(ws: &Path, course: &str) -> CreateProjectRequest {
        CreateProjectRequest {
            course_id: course.to_string(),
            workspace_root: Some(ws.to_path_buf()),
            ..CreateProjectRequest::default()
        }
    }

    /// Verifies creation derives roots from the workspace and writes a pending status.
    #[test]
    fn create_project_lays_out_workspace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = create_project(&request(temp.path(), "CS 101"), false).expect("create");
        assert_eq!(config.course_id, "cs-101");
        assert_eq!(config.project_root, temp.path().join("projects").join("cs-101"));
        assert_eq!(config.notes_root, temp.path().join("notes").join("cs-101"));
        let paths = config.paths();
        assert!(paths.runs_dir.is_dir());
        assert!(paths.artifacts_dir.is_dir());
        assert!(config.notes_root.is_dir());
        let status = load_round_status(&paths.round_status_path).expect("status");
        assert_eq!(status.status, RunStatus::Pending);
        assert_eq!(load_project(&config.project_root).expect("load"), config);
    }

    #[test]
    fn create_project_rejects_duplicates_unless_allowed() {
        let temp = tempfile::tempdir().expect("tempdir");
        create_project(&request(temp.path(), "algo"), false).expect("create");
        let err = create_project(&request(temp.path(), "algo"), false).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        create_project(&request(temp.path(), "algo"), true).expect("allow existing");
    }

    #[test]
    fn create_project_rejects_overlapping_roots() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("p");
        let req = CreateProjectRequest {
            course_id: "x".to_string(),
            project_root: Some(root.clone()),
            notes_root: Some(root.join("artifacts").join("notes")),
            ..CreateProjectRequest::default()
        };
        assert!(create_project(&req, false).is_err());
        assert!(!root.join("project.yaml").exists());
    }

    #[test]
    fn update_project_changes_only_requested_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = create_project(&request(temp.path(), "os"), false).expect("create");
        let updated = update_project(
            &config.project_root,
            &ProjectUpdate {
                max_changed_lines: Some(Some(50)),
                max_changed_files: Some(None),
                pause_after_each_stage: Some(true),
                ..ProjectUpdate::default()
            },
        )
        .expect("update");
        assert_eq!(updated.thresholds.max_changed_lines, Some(50));
        assert_eq!(updated.thresholds.max_changed_files, None);
        assert!(updated.pause_policy.after_each_stage);
        assert_eq!(updated.language, config.language);
        assert_eq!(load_project(&config.project_root).expect("load"), updated);
    }

    #[test]
    fn discover_projects_is_sorted() {
        let temp = tempfile::tempdir().expect("tempdir");
        create_project(&request(temp.path(), "zeta"), false).expect("create");
        create_project(&request(temp.path(), "alpha"), false).expect("create");
        let ids: Vec<String> = discover_projects(temp.path())
            .expect("discover")
            .into_iter()
            .map(|p| p.course_id)
            .collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }
}

//! Operator settings stored in `project_root/agent.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::state::write_atomic;

/// Operator settings (TOML).
///
/// Meant to be edited by humans. Missing fields take the defaults below and a
/// missing file is the default document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentSettings {
    pub tool: ToolSettings,
    pub check: CheckSettings,
}

/// Sandbox passed to the generation tool. Full access is never accepted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    ReadOnly,
    WorkspaceWrite,
    DangerFullAccess,
}

impl SandboxMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxMode::ReadOnly => "read-only",
            SandboxMode::WorkspaceWrite => "workspace-write",
            SandboxMode::DangerFullAccess => "danger-full-access",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolSettings {
    /// Executable to spawn.
    pub program: String,
    pub model: Option<String>,
    pub sandbox_mode: SandboxMode,
    /// Wall-clock limit for one attempt.
    pub timeout_secs: u64,
    /// Bytes of stdout/stderr kept in memory per attempt.
    pub output_limit_bytes: usize,
    /// Automatic retries after a transient failure.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Extra arguments appended before the prompt marker.
    pub extra_args: Vec<String>,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            program: "codex".to_string(),
            model: None,
            sandbox_mode: SandboxMode::WorkspaceWrite,
            timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
            max_retries: 2,
            retry_backoff_ms: 2_000,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CheckSettings {
    /// Run `notes_root/scripts/check.sh` when it exists.
    pub run_script: bool,
    pub script_timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            run_script: true,
            script_timeout_secs: 5 * 60,
            output_limit_bytes: 200_000,
        }
    }
}

/// Flags the orchestrator owns. Passing them through `extra_args` would bypass
/// the invocation contract.
const RESERVED_FLAGS: &[&str] = &[
    "--sandbox",
    "-s",
    "--ask-for-approval",
    "-a",
    "--cd",
    "-C",
    "--add-dir",
    "--full-auto",
    "--dangerously-bypass-approvals-and-sandbox",
    "--output-last-message",
];

impl AgentSettings {
    pub fn validate(&self) -> Result<()> {
        let tool = &self.tool;
        if tool.program.trim().is_empty() {
            return Err(anyhow!("tool.program must not be empty"));
        }
        if tool.timeout_secs == 0 {
            return Err(anyhow!("tool.timeout_secs must be > 0"));
        }
        if tool.output_limit_bytes == 0 {
            return Err(anyhow!("tool.output_limit_bytes must be > 0"));
        }
        if tool.sandbox_mode == SandboxMode::DangerFullAccess {
            return Err(anyhow!(
                "tool.sandbox_mode danger-full-access is not permitted"
            ));
        }
        if let Some(arg) = tool.extra_args.iter().find(|arg| {
            let flag = arg.split('=').next().unwrap_or(arg.as_str());
            RESERVED_FLAGS.contains(&flag)
        }) {
            return Err(anyhow!("tool.extra_args must not override `{arg}`"));
        }
        if self.check.script_timeout_secs == 0 {
            return Err(anyhow!("check.script_timeout_secs must be > 0"));
        }
        if self.check.output_limit_bytes == 0 {
            return Err(anyhow!("check.output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

/// Load settings from a TOML file.
///
/// If the file is missing, returns `AgentSettings::default()`.
pub fn load_settings(path: &Path) -> Result<AgentSettings> {
    if !path.exists() {
        let settings = AgentSettings::default();
        settings.validate()?;
        return Ok(settings);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let settings: AgentSettings =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    settings
        .validate()
        .with_context(|| format!("invalid settings {}", path.display()))?;
    Ok(settings)
}

/// Atomically write settings to disk (temp file + rename).
pub fn write_settings(path: &Path, settings: &AgentSettings) -> Result<()> {
    settings.validate()?;
    let mut buf = toml::to_string_pretty(settings).context("serialize settings toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

//! Per-project run lock: one process drives a project's runs at a time.
//!
//! The lock is a pid file created with `create_new`. A file whose pid no
//! longer runs is stale and is taken over.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use thiserror::Error;
use tracing::{debug, warn};

/// Another live process holds the lock.
#[derive(Debug, Error)]
#[error("{} is held by pid {pid}", .path.display())]
pub struct LockHeld {
    pub path: PathBuf,
    pub pid: u32,
}

/// Held for as long as the value lives; dropping it removes the lock file.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), err = %err, "failed to release run lock");
        }
    }
}

/// Take the lock at `path`, replacing it once if it is stale.
///
/// Fails with [`LockHeld`] when a live process owns it.
pub fn acquire_run_lock(path: &Path) -> Result<RunLock> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    for _ in 0..2 {
        match OpenOptions::new().create_new(true).write(true).open(path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())
                    .with_context(|| format!("write {}", path.display()))?;
                debug!(path = %path.display(), "run lock acquired");
                return Ok(RunLock {
                    path: path.to_path_buf(),
                });
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("read {}", path.display()))?;
                let Ok(pid) = raw.trim().parse::<u32>() else {
                    bail!(
                        "unreadable run lock {}; remove it if no notes-agent process is running",
                        path.display()
                    );
                };
                if is_process_running(pid) {
                    return Err(LockHeld {
                        path: path.to_path_buf(),
                        pid,
                    }
                    .into());
                }
                warn!(pid, path = %path.display(), "removing stale run lock");
                fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("create {}", path.display()));
            }
        }
    }
    bail!("could not acquire run lock {}", path.display())
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    true
}

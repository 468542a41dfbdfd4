#![forbid(unsafe_code)]

//! Run checkpoints: an append-only text log plus a JSON progress snapshot that
//! external tooling can poll.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};

pub const CHECKPOINT_LOG_FILE: &str = "progress.log";
pub const PROGRESS_SNAPSHOT_FILE: &str = "progress.json";

/// Append-only `progress.log`. Each line is `<local time> <message>`.
#[derive(Debug, Clone)]
pub struct CheckpointLog {
    path: PathBuf,
}

impl CheckpointLog {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(CHECKPOINT_LOG_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, message: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        writeln!(
            file,
            "{} {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            message
        )
        .with_context(|| format!("appending to {}", self.path.display()))
    }

    /// Appends, logging instead of failing. Checkpoints never abort a run.
    pub fn note(&self, message: &str) {
        log::info!("{message}");
        if let Err(err) = self.append(message) {
            log::warn!("Could not write checkpoint: {err:#}");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub progress: u8,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ProgressWriter {
    path: PathBuf,
}

impl ProgressWriter {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(PROGRESS_SNAPSHOT_FILE),
        }
    }

    pub fn write(&self, progress: u8, message: &str) {
        let report = ProgressReport {
            progress: progress.min(100),
            message: message.to_string(),
        };
        if let Err(err) = write_json_atomic(&self.path, &report) {
            log::warn!("Could not write progress snapshot: {err:#}");
        }
    }

    #[cfg(test)]
    pub fn read(&self) -> Option<ProgressReport> {
        let raw = fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

/// Writes pretty JSON next to `path` and renames it into place.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    let payload = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp_path, payload).with_context(|| format!("writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

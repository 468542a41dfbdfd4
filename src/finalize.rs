#![forbid(unsafe_code)]

//! Re-encodes the fetched media into the canonical `<stem>_final.mp4` and
//! clears everything else out of the item directory.
//!
//! Finalizing is idempotent: if a non-empty canonical file is already present
//! (say the encoder finished writing before being killed by a timeout) the
//! encoder is not run again.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::HarvestError;
use crate::retry::{Pacer, RetryPolicy};

pub const CANONICAL_SUFFIX: &str = "_final";
pub const CANONICAL_EXTENSION: &str = "mp4";
pub const MEDIA_EXTENSIONS: [&str; 6] = ["mp4", "mkv", "webm", "flv", "mov", "m4v"];

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const STDERR_TAIL: usize = 400;

pub struct FinalizeStage {
    encoder: PathBuf,
    policy: RetryPolicy,
    pacer: Pacer,
    timeout: Duration,
}

impl FinalizeStage {
    pub fn new(encoder: PathBuf, policy: RetryPolicy, pacer: Pacer, timeout: Duration) -> Self {
        Self {
            encoder,
            policy,
            pacer,
            timeout,
        }
    }

    pub fn encoder(&self) -> &Path {
        &self.encoder
    }

    /// Produces the single canonical artifact in `dir` and returns its path.
    pub fn finalize(&self, dir: &Path) -> Result<PathBuf, HarvestError> {
        let label = format!("finalize {}", dir.display());
        self.policy
            .run(&self.pacer, &label, |attempt| self.attempt(dir, attempt))
    }

    fn attempt(&self, dir: &Path, attempt: u32) -> Result<PathBuf, HarvestError> {
        if let Some(existing) = find_canonical(dir)? {
            log::info!("Already finalized: {}", existing.display());
            cleanup_except(dir, &existing)?;
            return Ok(existing);
        }

        let input = first_media_file(dir)?.ok_or_else(|| {
            HarvestError::tool(&tool_name(&self.encoder), "no media file to encode")
        })?;
        let output = canonical_path(&input);
        log::info!(
            "Encoding {} (attempt {attempt})",
            input.file_name().unwrap_or_default().to_string_lossy()
        );
        self.run_encoder(&input, &output)?;

        if !is_non_empty(&output) {
            return Err(HarvestError::tool(
                &tool_name(&self.encoder),
                "encoder exited cleanly but produced no output",
            ));
        }
        cleanup_except(dir, &output)?;
        Ok(output)
    }

    fn run_encoder(&self, input: &Path, output: &Path) -> Result<(), HarvestError> {
        let name = tool_name(&self.encoder);
        let fail = |detail: String| HarvestError::tool(&name, detail);

        let mut stderr_log = tempfile::tempfile().map_err(|err| fail(err.to_string()))?;
        let stderr_handle = stderr_log.try_clone().map_err(|err| fail(err.to_string()))?;

        let mut child = Command::new(&self.encoder)
            .arg("-i")
            .arg(input)
            .args(["-c:v", "libx264", "-preset", "medium", "-crf", "23"])
            .args(["-c:a", "aac", "-b:a", "128k"])
            .arg("-y")
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_handle))
            .spawn()
            .map_err(|err| fail(format!("could not start: {err}")))?;

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(fail(format!(
                        "timed out after {}s",
                        self.timeout.as_secs()
                    )));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(err) => return Err(fail(format!("waiting for process: {err}"))),
            }
        };

        if status.success() {
            return Ok(());
        }
        // A failed run may leave a truncated output that would pass as canonical.
        if output.exists()
            && let Err(err) = fs::remove_file(output)
        {
            log::warn!("Could not remove {}: {err}", output.display());
        }
        let mut stderr = String::new();
        let _ = stderr_log.seek(SeekFrom::Start(0));
        let _ = stderr_log.read_to_string(&mut stderr);
        Err(fail(format!("exited with {status}: {}", tail(&stderr))))
    }
}

pub(crate) fn tool_name(program: &Path) -> String {
    program
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string())
}

pub(crate) fn tail(text: &str) -> String {
    let trimmed = text.trim();
    let start = trimmed
        .char_indices()
        .rev()
        .nth(STDERR_TAIL)
        .map(|(index, _)| index)
        .unwrap_or(0);
    trimmed[start..].replace('\n', " | ")
}

fn is_media(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn is_canonical(path: &Path) -> bool {
    is_media(path)
        && path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .is_some_and(|stem| stem.ends_with(CANONICAL_SUFFIX))
}

fn is_non_empty(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|meta| meta.is_file() && meta.len() > 0)
}

fn sorted_files(dir: &Path) -> Result<Vec<PathBuf>, HarvestError> {
    let entries = fs::read_dir(dir)
        .map_err(|err| HarvestError::tool("filesystem", format!("reading {}: {err}", dir.display())))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    Ok(files)
}

/// First non-empty canonical artifact in `dir`, if any.
pub fn find_canonical(dir: &Path) -> Result<Option<PathBuf>, HarvestError> {
    if !dir.is_dir() {
        return Ok(None);
    }
    Ok(sorted_files(dir)?
        .into_iter()
        .find(|path| is_canonical(path) && is_non_empty(path)))
}

/// First media file in sorted order that is not already canonical.
pub fn first_media_file(dir: &Path) -> Result<Option<PathBuf>, HarvestError> {
    Ok(sorted_files(dir)?
        .into_iter()
        .find(|path| is_media(path) && !is_canonical(path)))
}

/// `<dir>/<stem>_final.mp4` for `input`.
pub fn canonical_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    input.with_file_name(format!("{stem}{CANONICAL_SUFFIX}.{CANONICAL_EXTENSION}"))
}

/// Removes every file and sub-directory of `dir` except `keep`.
pub fn cleanup_except(dir: &Path, keep: &Path) -> Result<(), HarvestError> {
    let entries = fs::read_dir(dir)
        .map_err(|err| HarvestError::tool("filesystem", format!("reading {}: {err}", dir.display())))?;
    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path();
        if path == keep {
            continue;
        }
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(err) = removed {
            return Err(HarvestError::tool(
                "filesystem",
                format!("removing {}: {err}", path.display()),
            ));
        }
        log::debug!("Removed {}", path.display());
    }
    Ok(())
}

#![forbid(unsafe_code)]

//! Fetching one item with the external download tool.
//!
//! The tool writes into the item directory, sometimes into nested
//! sub-directories. Its stdout announces the size of the selected video
//! stream before downloading, which is where the size cap is enforced.

use std::fs;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use chrono::{Local, TimeZone};
use regex::Regex;
use walkdir::WalkDir;

use crate::error::HarvestError;
use crate::finalize::{self, FinalizeStage, MEDIA_EXTENSIONS, tail, tool_name};
use crate::ledger::CompletionLedger;
use crate::model::SkipReason;
use crate::retry::{Pacer, RetryPolicy};

const MAX_TITLE_CHARS: usize = 80;

#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub id: String,
    pub title: String,
    pub published_at: Option<i64>,
    pub target_dir: PathBuf,
    pub source_url: String,
}

impl AcquireRequest {
    /// `<id>_<YYYYMMDD>_<title>`, or `<id>_<title>` without a publish date.
    /// The id leads so finalized artifacts can be mapped back to it.
    pub fn file_pattern(&self) -> String {
        let date = self
            .published_at
            .and_then(|ts| Local.timestamp_opt(ts, 0).single())
            .map(|datetime| datetime.format("%Y%m%d").to_string());
        let title = sanitize(&self.title);
        match date {
            Some(date) => format!("{}_{}_{}", self.id, date, title),
            None => format!("{}_{}", self.id, title),
        }
    }
}

/// Keeps titles filesystem-safe and short.
pub fn sanitize(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .take(MAX_TITLE_CHARS)
        .collect();
    let trimmed = cleaned.trim().trim_matches('.');
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    /// Fetched and finalized into the returned artifact.
    Completed(PathBuf),
    /// Already in the ledger; nothing was attempted.
    AlreadyComplete,
    /// Deliberately not fetched.
    Skipped { reason: SkipReason, detail: String },
}

pub struct AcquisitionStage {
    fetch_tool: PathBuf,
    encoder: PathBuf,
    max_media_mb: f64,
    policy: RetryPolicy,
    pacer: Pacer,
    finalize: FinalizeStage,
}

impl AcquisitionStage {
    pub fn new(
        fetch_tool: PathBuf,
        max_media_mb: f64,
        policy: RetryPolicy,
        pacer: Pacer,
        finalize: FinalizeStage,
    ) -> Self {
        Self {
            fetch_tool,
            encoder: finalize.encoder().to_path_buf(),
            max_media_mb,
            policy,
            pacer,
            finalize,
        }
    }

    pub fn acquire(
        &self,
        ledger: &CompletionLedger,
        request: &AcquireRequest,
    ) -> Result<AcquireOutcome, HarvestError> {
        if ledger.contains(&request.id) {
            log::debug!("{} already complete", request.id);
            return Ok(AcquireOutcome::AlreadyComplete);
        }

        let label = format!("acquire {}", request.id);
        match self
            .policy
            .run(&self.pacer, &label, |attempt| self.attempt(request, attempt))
        {
            Ok(path) => Ok(AcquireOutcome::Completed(path)),
            Err(err @ HarvestError::OversizedMedia { .. }) => {
                log::info!("Skipping {}: {err}", request.id);
                if request.target_dir.exists()
                    && let Err(remove_err) = fs::remove_dir_all(&request.target_dir)
                {
                    log::warn!(
                        "Could not remove {}: {remove_err}",
                        request.target_dir.display()
                    );
                }
                Ok(AcquireOutcome::Skipped {
                    reason: SkipReason::OversizedMedia,
                    detail: err.to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }

    fn attempt(&self, request: &AcquireRequest, attempt: u32) -> Result<PathBuf, HarvestError> {
        let dir = &request.target_dir;
        fs::create_dir_all(dir).map_err(|err| {
            HarvestError::tool("filesystem", format!("creating {}: {err}", dir.display()))
        })?;

        // An earlier attempt may have fetched and partly finalized already.
        if finalize::find_canonical(dir)?.is_none() {
            log::info!("Fetching {} (attempt {attempt})", request.id);
            self.run_fetch(request)?;
            relocate_nested_media(dir)?;
            if finalize::first_media_file(dir)?.is_none() {
                return Err(HarvestError::tool(
                    &tool_name(&self.fetch_tool),
                    "finished without producing a media file",
                ));
            }
        }
        self.finalize.finalize(dir)
    }

    fn run_fetch(&self, request: &AcquireRequest) -> Result<(), HarvestError> {
        let name = tool_name(&self.fetch_tool);
        let fail = |detail: String| HarvestError::tool(&name, detail);

        let mut stderr_log = tempfile::tempfile().map_err(|err| fail(err.to_string()))?;
        let stderr_handle = stderr_log.try_clone().map_err(|err| fail(err.to_string()))?;

        let mut child = Command::new(&self.fetch_tool)
            .arg(&request.source_url)
            .arg("--work-dir")
            .arg(&request.target_dir)
            .arg("--ffmpeg-path")
            .arg(&self.encoder)
            .arg("--file-pattern")
            .arg(request.file_pattern())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr_handle))
            .spawn()
            .map_err(|err| fail(format!("could not start: {err}")))?;

        if let Some(stdout) = child.stdout.take() {
            // The tool's console encoding varies, so lines are decoded lossily
            // and the pipe is drained to the end.
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(err) => {
                        log::warn!("[{name}] stopped reading output: {err}");
                        break;
                    }
                }
                let decoded = String::from_utf8_lossy(&buf);
                let line = decoded.trim_end();
                log::debug!("[{name}] {line}");
                if let Some(size_mb) = parse_media_size_mb(line)
                    && size_mb > self.max_media_mb
                {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(HarvestError::OversizedMedia {
                        size_mb,
                        cap_mb: self.max_media_mb,
                    });
                }
            }
        }

        let status = child
            .wait()
            .map_err(|err| fail(format!("waiting for process: {err}")))?;
        if status.success() {
            return Ok(());
        }
        let mut stderr = String::new();
        let _ = stderr_log.seek(SeekFrom::Start(0));
        let _ = stderr_log.read_to_string(&mut stderr);
        Err(fail(format!("exited with {status}: {}", tail(&stderr))))
    }
}

fn size_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)~?\s*([\d.]+)\s*(GB|MB|KB)")
            .unwrap_or_else(|err| panic!("size pattern: {err}"))
    })
}

/// Reads the announced video stream size from a line of fetch tool output,
/// e.g. `[视频] [1080P] [H.264] ... ~123.45 MB`.
pub fn parse_media_size_mb(line: &str) -> Option<f64> {
    if !(line.contains("[视频]") || line.contains("[Video]")) || !line.contains('~') {
        return None;
    }
    let tail = &line[line.rfind('~')?..];
    let caps = size_pattern().captures(tail)?;
    let value: f64 = caps[1].parse().ok()?;
    let size = match caps[2].to_ascii_uppercase().as_str() {
        "GB" => value * 1024.0,
        "KB" => value / 1024.0,
        _ => value,
    };
    Some(size)
}

/// Moves media files from nested directories up into `dir` and removes the
/// directories left empty.
pub fn relocate_nested_media(dir: &Path) -> Result<(), HarvestError> {
    let nested: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(2)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        })
        .collect();

    for source in nested {
        let Some(file_name) = source.file_name() else {
            continue;
        };
        let target = dir.join(file_name);
        if target.exists() {
            log::warn!(
                "Not moving {}: {} already exists",
                source.display(),
                target.display()
            );
            continue;
        }
        fs::rename(&source, &target).map_err(|err| {
            HarvestError::tool(
                "filesystem",
                format!("moving {} to {}: {err}", source.display(), target.display()),
            )
        })?;
        log::debug!("Moved {} up to {}", source.display(), target.display());
    }

    remove_empty_dirs(dir);
    Ok(())
}

fn remove_empty_dirs(dir: &Path) {
    let dirs: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .collect();
    for path in dirs {
        // Fails harmlessly when the directory still has content.
        let _ = fs::remove_dir(&path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DelayRange;
    use crate::ledger::LEDGER_FILE;
    use crate::testutil::{install_script, instant_pacer};
    use std::time::Duration;
    use tempfile::tempdir;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            max_blocked_attempts: 0,
            transient_backoff: DelayRange::new(2.0, 5.0),
            blocked_backoff: DelayRange::new(10.0, 20.0),
        }
    }

    fn copying_encoder(dir: &Path) -> PathBuf {
        install_script(
            dir,
            "encoder",
            &format!(
                "echo run >> \"{}\"\ncp \"$2\" \"${{@: -1}}\"",
                dir.join("encoder_calls").display()
            ),
        )
    }

    fn stage(fetch_tool: PathBuf, encoder: PathBuf) -> AcquisitionStage {
        let (pacer, _) = instant_pacer();
        let finalize = FinalizeStage::new(encoder, policy(), pacer.clone(), Duration::from_secs(10));
        AcquisitionStage::new(fetch_tool, 500.0, policy(), pacer, finalize)
    }

    fn request(target: &Path) -> AcquireRequest {
        AcquireRequest {
            id: "BV1aa411c7aa".into(),
            title: "a/b: song?".into(),
            published_at: None,
            target_dir: target.to_path_buf(),
            source_url: "https://www.bilibili.com/video/BV1aa411c7aa".into(),
        }
    }

    fn call_count(path: &Path) -> usize {
        fs::read_to_string(path)
            .map(|text| text.lines().count())
            .unwrap_or(0)
    }

    #[test]
    fn file_pattern_and_sanitizing() {
        let mut req = request(Path::new("/tmp/x"));
        assert_eq!(req.file_pattern(), "BV1aa411c7aa_a_b_ song_");
        req.published_at = Local
            .with_ymd_and_hms(2023, 1, 3, 12, 0, 0)
            .single()
            .map(|dt| dt.timestamp());
        assert_eq!(req.file_pattern(), "BV1aa411c7aa_20230103_a_b_ song_");
        assert_eq!(sanitize("  ...  "), "untitled");
    }

    #[test]
    fn parses_announced_sizes() {
        assert_eq!(
            parse_media_size_mb("[视频] [1080P 高清] [1920x1080] [AVC] [30.000] [2345 kbps] [~123.5 MB]"),
            Some(123.5)
        );
        assert_eq!(
            parse_media_size_mb("[Video] [4K] [HEVC] ~1.5 GB"),
            Some(1536.0)
        );
        assert_eq!(parse_media_size_mb("[音频] [~3.2 MB]"), None);
        assert_eq!(parse_media_size_mb("[视频] size unknown"), None);
    }

    #[test]
    fn completed_item_is_not_fetched_again() {
        let tools = tempdir().unwrap();
        let out = tempdir().unwrap();
        let fetch = install_script(
            tools.path(),
            "fetch",
            &format!("echo run >> \"{}\"", tools.path().join("fetch_calls").display()),
        );
        fs::write(out.path().join(LEDGER_FILE), "id\nBV1aa411c7aa\n").unwrap();
        let ledger = CompletionLedger::open(out.path()).unwrap();

        let outcome = stage(fetch, copying_encoder(tools.path()))
            .acquire(&ledger, &request(&out.path().join("item")))
            .unwrap();
        assert_eq!(outcome, AcquireOutcome::AlreadyComplete);
        assert_eq!(call_count(&tools.path().join("fetch_calls")), 0);
    }

    #[test]
    fn fetches_relocates_and_finalizes() {
        let tools = tempdir().unwrap();
        let out = tempdir().unwrap();
        // Mimics a tool that nests output under a sub-directory and leaves extras.
        let fetch = install_script(
            tools.path(),
            "fetch",
            r#"dir="$3"; pattern="$7"
echo "[视频] [720P] ~12.0 MB"
mkdir -p "$dir/sub/deeper"
printf 'media' > "$dir/sub/deeper/$pattern.mp4"
printf '<d/>' > "$dir/$pattern.xml""#,
        );
        let ledger = CompletionLedger::open(out.path()).unwrap();
        let target = out.path().join("item");

        let outcome = stage(fetch, copying_encoder(tools.path()))
            .acquire(&ledger, &request(&target))
            .unwrap();
        let AcquireOutcome::Completed(artifact) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert!(artifact.starts_with(&target));
        assert!(
            artifact
                .file_name()
                .unwrap()
                .to_str()
                .unwrap()
                .ends_with("_final.mp4")
        );
        let names: Vec<_> = fs::read_dir(&target).unwrap().collect();
        assert_eq!(names.len(), 1);
        assert_eq!(call_count(&tools.path().join("encoder_calls")), 1);
    }

    #[test]
    fn oversized_media_is_skipped_and_removed() {
        let tools = tempdir().unwrap();
        let out = tempdir().unwrap();
        let fetch = install_script(
            tools.path(),
            "fetch",
            r#"echo "[视频] [4K] [HEVC] ~812.40 MB"
mkdir -p "$3"
printf 'partial' > "$3/partial.mp4"
sleep 5"#,
        );
        let ledger = CompletionLedger::open(out.path()).unwrap();
        let target = out.path().join("item");

        let outcome = stage(fetch, copying_encoder(tools.path()))
            .acquire(&ledger, &request(&target))
            .unwrap();
        match outcome {
            AcquireOutcome::Skipped { reason, detail } => {
                assert_eq!(reason, SkipReason::OversizedMedia);
                assert!(detail.contains("812.40"));
            }
            other => panic!("expected skip, got {other:?}"),
        }
        assert!(!target.exists());
        assert_eq!(call_count(&tools.path().join("encoder_calls")), 0);
    }

    #[test]
    fn undecodable_output_does_not_stall_the_tool() {
        let tools = tempdir().unwrap();
        let out = tempdir().unwrap();
        let fetch = install_script(
            tools.path(),
            "fetch",
            &format!(
                r#"echo run >> "{}"
printf '\xc4\xe3\xba\xc3\n'
for i in $(seq 1 20000); do echo "progress $i"; done
echo "[视频] [720P] ~12.0 MB"
mkdir -p "$3"
printf 'media' > "$3/$7.mp4""#,
                tools.path().join("fetch_calls").display()
            ),
        );
        let ledger = CompletionLedger::open(out.path()).unwrap();
        let outcome = stage(fetch, copying_encoder(tools.path()))
            .acquire(&ledger, &request(&out.path().join("item")))
            .unwrap();
        assert!(matches!(outcome, AcquireOutcome::Completed(_)));
        assert_eq!(call_count(&tools.path().join("fetch_calls")), 1);
    }

    #[test]
    fn tool_without_output_exhausts_retries() {
        let tools = tempdir().unwrap();
        let out = tempdir().unwrap();
        let fetch = install_script(
            tools.path(),
            "fetch",
            &format!("echo run >> \"{}\"", tools.path().join("fetch_calls").display()),
        );
        let ledger = CompletionLedger::open(out.path()).unwrap();
        let err = stage(fetch, copying_encoder(tools.path()))
            .acquire(&ledger, &request(&out.path().join("item")))
            .unwrap_err();
        assert!(matches!(err, HarvestError::ExternalTool { .. }));
        assert_eq!(call_count(&tools.path().join("fetch_calls")), 3);
    }
}

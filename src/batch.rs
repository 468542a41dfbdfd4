#![forbid(unsafe_code)]

//! Batch controller: walks every window in chronological order, searches it,
//! and acquires the accepted items most-viewed first.
//!
//! Failures are contained at the narrowest level. A failed item is logged to
//! `failed_downloads.csv` and the window moves on; a window whose search is cut
//! short still processes what it found and the batch moves on.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;

use crate::acquire::{AcquireOutcome, AcquireRequest, AcquisitionStage, sanitize};
use crate::cache::WindowCache;
use crate::checkpoint::{CheckpointLog, ProgressWriter};
use crate::config::{DelaySettings, PipelineSettings, RuntimePaths};
use crate::error::HarvestError;
use crate::filter::FilterThresholds;
use crate::finalize::FinalizeStage;
use crate::ledger::CompletionLedger;
use crate::model::{CandidateItem, FailureEntry, LedgerEntry, SkipEntry, SkipReason};
use crate::provider::SearchProvider;
use crate::retry::{Pacer, RetryPolicy};
use crate::search::{SearchEngine, SearchOptions};
use crate::window::{TimeWindow, generate_windows};

pub const MEDIA_DIR: &str = "media";

/// Popularity tier used as the first level of the media tree.
pub fn view_bucket(view_count: u64) -> &'static str {
    match view_count {
        1_000_000.. => "1M+",
        500_000.. => "500K-1M",
        100_000.. => "100K-500K",
        10_000.. => "10K-100K",
        _ => "500-10K",
    }
}

/// `<root>/media/<bucket>/<author>_<author_id>/<id>`
pub fn item_directory(root: &Path, item: &CandidateItem) -> PathBuf {
    root.join(MEDIA_DIR)
        .join(view_bucket(item.view_count))
        .join(format!("{}_{}", sanitize(&item.author_name), item.author_id))
        .join(&item.id)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub windows: usize,
    pub windows_from_cache: usize,
    pub incomplete_windows: usize,
    pub found: usize,
    pub completed: usize,
    pub already_complete: usize,
    pub skipped: usize,
    pub failed: usize,
    pub interrupted: bool,
    /// The platform rejected the session; the run stopped early.
    pub session_lost: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemResult {
    Completed,
    AlreadyComplete,
    Skipped,
    Failed,
    Interrupted,
}

pub struct BatchController<P> {
    root: PathBuf,
    keyword: String,
    search: SearchEngine<P>,
    acquisition: AcquisitionStage,
    ledger: CompletionLedger,
    thresholds: FilterThresholds,
    delays: DelaySettings,
    pacer: Pacer,
    shutdown: Arc<AtomicBool>,
    checkpoints: CheckpointLog,
    progress: ProgressWriter,
}

impl<P: SearchProvider> BatchController<P> {
    /// Wires the search, acquisition and finalize stages from configuration.
    pub fn from_settings(
        provider: P,
        paths: &RuntimePaths,
        settings: &PipelineSettings,
        pacer: Pacer,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let root = paths.output_root.clone();
        let search_policy = RetryPolicy {
            max_attempts: settings.max_retries,
            max_blocked_attempts: settings.max_blocked_retries,
            transient_backoff: settings.delays.transient,
            blocked_backoff: settings.delays.blocked,
        };
        let tool_policy = RetryPolicy {
            max_attempts: settings.max_retries,
            max_blocked_attempts: 0,
            transient_backoff: settings.delays.tool_retry,
            blocked_backoff: settings.delays.blocked,
        };

        let search = SearchEngine::new(
            provider,
            WindowCache::new(&root, &settings.keyword),
            SearchOptions {
                keyword: settings.keyword.clone(),
                thresholds: settings.thresholds(),
                max_pages: settings.max_pages,
                policy: search_policy,
                request_delay: settings.delays.request,
            },
            pacer.clone(),
        );
        let finalize = FinalizeStage::new(
            paths.encoder.clone(),
            tool_policy,
            pacer.clone(),
            Duration::from_secs(settings.encode_timeout_secs),
        );
        let acquisition = AcquisitionStage::new(
            paths.fetch_tool.clone(),
            settings.max_media_mb,
            tool_policy,
            pacer.clone(),
            finalize,
        );
        let ledger = CompletionLedger::open(&root)?;
        log::info!(
            "Ledger at {} lists {} completed item(s)",
            root.display(),
            ledger.len()
        );

        Ok(Self {
            checkpoints: CheckpointLog::new(&root),
            progress: ProgressWriter::new(&root),
            keyword: settings.keyword.clone(),
            thresholds: settings.thresholds(),
            delays: settings.delays,
            root,
            search,
            acquisition,
            ledger,
            pacer,
            shutdown,
        })
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Processes every window covering `start..=end`.
    pub fn run_range(&mut self, start: NaiveDate, end: NaiveDate) -> BatchSummary {
        let windows: Vec<TimeWindow> = generate_windows(start, end).collect();
        let mut summary = BatchSummary::default();
        self.checkpoints.note(&format!(
            "run started: keyword '{}', {} to {}, {} window(s)",
            self.keyword,
            start,
            end,
            windows.len()
        ));
        self.progress.write(0, "starting");

        for (index, window) in windows.iter().enumerate() {
            if self.stopping() {
                summary.interrupted = true;
                break;
            }
            if index > 0 {
                self.pacer.pause(self.delays.window);
                if self.stopping() {
                    summary.interrupted = true;
                    break;
                }
            }
            self.run_window(window, &mut summary);
            if summary.session_lost {
                break;
            }
            let percent = ((index + 1) * 100 / windows.len()) as u8;
            self.progress.write(
                percent,
                &format!(
                    "window {}/{} ({}) done",
                    index + 1,
                    windows.len(),
                    window.label()
                ),
            );
        }

        self.checkpoints.note(&format!(
            "run {}: {} window(s), {} found, {} completed, {} already complete, {} skipped, {} failed",
            if summary.session_lost {
                "stopped (session rejected)"
            } else if summary.interrupted {
                "interrupted"
            } else {
                "finished"
            },
            summary.windows,
            summary.found,
            summary.completed,
            summary.already_complete,
            summary.skipped,
            summary.failed
        ));
        if summary.session_lost {
            self.progress.write(0, "session rejected by the platform");
        } else if summary.interrupted {
            self.progress.write(0, "interrupted");
        } else {
            self.progress.write(100, "finished");
        }
        summary
    }

    /// Searches one window and acquires its accepted items.
    pub fn run_window(&mut self, window: &TimeWindow, summary: &mut BatchSummary) {
        self.checkpoints
            .note(&format!("window {} started", window.label()));

        let result = self.search.search_window(window);
        summary.windows += 1;
        if result.from_cache {
            summary.windows_from_cache += 1;
        }
        if !result.complete {
            summary.incomplete_windows += 1;
        }
        if result.session_lost {
            log::error!(
                "The platform no longer accepts the session; save a fresh token with `harvest save-credential`"
            );
            self.checkpoints.note(&format!(
                "window {} abandoned: session rejected",
                window.label()
            ));
            summary.session_lost = true;
            return;
        }

        let mut items = result.items;
        items.sort_by(|a, b| b.view_count.cmp(&a.view_count));
        summary.found += items.len();

        if let Err(err) = self.ledger.load() {
            log::warn!("Could not reload the ledger, using the previous view: {err}");
        }

        let mut tally = [0usize; 5];
        let mut attempted_any = false;
        for item in &items {
            if self.stopping() {
                summary.interrupted = true;
                break;
            }
            let will_attempt = !self.ledger.contains(&item.id)
                && item.duration_secs <= self.thresholds.max_duration_secs;
            if will_attempt && attempted_any {
                self.pacer.pause(self.delays.item);
                if self.stopping() {
                    summary.interrupted = true;
                    break;
                }
            }
            attempted_any |= will_attempt;

            let result = self.process_item(item);
            match result {
                ItemResult::Completed => summary.completed += 1,
                ItemResult::AlreadyComplete => summary.already_complete += 1,
                ItemResult::Skipped => summary.skipped += 1,
                ItemResult::Failed => summary.failed += 1,
                ItemResult::Interrupted => summary.interrupted = true,
            }
            tally[result as usize] += 1;
        }

        self.checkpoints.note(&format!(
            "window {} finished: {} found, {} completed, {} already complete, {} skipped, {} failed",
            window.label(),
            items.len(),
            tally[ItemResult::Completed as usize],
            tally[ItemResult::AlreadyComplete as usize],
            tally[ItemResult::Skipped as usize],
            tally[ItemResult::Failed as usize]
        ));
    }

    fn process_item(&mut self, item: &CandidateItem) -> ItemResult {
        if self.ledger.contains(&item.id) {
            log::debug!("{} already complete", item.id);
            return ItemResult::AlreadyComplete;
        }
        if item.duration_secs > self.thresholds.max_duration_secs {
            let detail = format!(
                "{}s exceeds {}s",
                item.duration_secs, self.thresholds.max_duration_secs
            );
            log::info!("Skipping {}: {detail}", item.id);
            self.log_skip(item, SkipReason::OverDuration, &detail);
            return ItemResult::Skipped;
        }

        let request = AcquireRequest {
            id: item.id.clone(),
            title: item.title.clone(),
            published_at: item.published_at,
            target_dir: item_directory(&self.root, item),
            source_url: item.source_url.clone(),
        };
        log::info!(
            "Acquiring {} ({} views): {}",
            item.id,
            item.view_count,
            item.title
        );

        match self.acquisition.acquire(&self.ledger, &request) {
            Ok(AcquireOutcome::Completed(artifact)) => {
                let entry = LedgerEntry::from_item(item, &artifact.display().to_string());
                if let Err(err) = self.ledger.record(&entry) {
                    // The artifact on disk still marks the item complete.
                    log::error!("Could not record {}: {err}", item.id);
                }
                log::info!("Completed {} -> {}", item.id, artifact.display());
                ItemResult::Completed
            }
            Ok(AcquireOutcome::AlreadyComplete) => ItemResult::AlreadyComplete,
            Ok(AcquireOutcome::Skipped { reason, detail }) => {
                self.log_skip(item, reason, &detail);
                ItemResult::Skipped
            }
            Err(HarvestError::Interrupted) => {
                log::warn!("Stopped acquiring {} on shutdown request", item.id);
                ItemResult::Interrupted
            }
            Err(err) => {
                log::warn!("Failed {}: {err}", item.id);
                if let Err(record_err) = self
                    .ledger
                    .record_failure(&FailureEntry::from_item(item, &err.to_string()))
                {
                    log::error!("Could not record failure of {}: {record_err}", item.id);
                }
                ItemResult::Failed
            }
        }
    }

    fn log_skip(&self, item: &CandidateItem, reason: SkipReason, detail: &str) {
        if let Err(err) = self
            .ledger
            .record_skip(&SkipEntry::from_item(item, reason, detail))
        {
            log::error!("Could not record skip of {}: {err}", item.id);
        }
    }
}

#![forbid(unsafe_code)]

//! Per-window search cache under `search_results/`.
//!
//! A cache file only exists for windows whose pagination finished, so its
//! presence is the signal that the window needs no network activity.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;

use crate::model::{CACHE_COLUMNS, CandidateItem};
use crate::timetext;
use crate::window::TimeWindow;

pub const CACHE_DIR: &str = "search_results";

#[derive(Debug, Clone)]
pub struct WindowCache {
    dir: PathBuf,
    keyword: String,
}

impl WindowCache {
    pub fn new(root: &Path, keyword: &str) -> Self {
        Self {
            dir: root.join(CACHE_DIR),
            keyword: keyword.to_string(),
        }
    }

    /// `<start>_<end>_<keyword>.csv`
    pub fn path_for(&self, window: &TimeWindow) -> PathBuf {
        self.dir.join(format!(
            "{}_{}.csv",
            window.label(),
            sanitize_keyword(&self.keyword)
        ))
    }

    /// Reads the cache for `window`. `Ok(None)` means no cache exists.
    pub fn load(&self, window: &TimeWindow) -> Result<Option<Vec<CandidateItem>>> {
        let path = self.path_for(window);
        if !path.exists() {
            return Ok(None);
        }
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        let now = Local::now();
        let mut items = Vec::new();
        for record in reader.deserialize::<CandidateItem>() {
            let mut item = record.with_context(|| format!("parsing {}", path.display()))?;
            item.published_at = timetext::normalize(&item.published_text, window, now);
            items.push(item);
        }
        Ok(Some(items))
    }

    /// Replaces the cache for `window` atomically. An empty list still
    /// produces a valid file with a header row.
    pub fn store(&self, window: &TimeWindow, items: &[CandidateItem]) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.path_for(window);
        let tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("creating temp file in {}", self.dir.display()))?;
        {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(tmp.as_file());
            writer.write_record(CACHE_COLUMNS)?;
            for item in items {
                writer.serialize(item)?;
            }
            writer.flush()?;
        }
        tmp.persist(&path)
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(path)
    }
}

fn sanitize_keyword(keyword: &str) -> String {
    keyword
        .chars()
        .map(|ch| if ch.is_alphanumeric() || ch == '-' { ch } else { '_' })
        .collect()
}

//! Helpers shared by the unit tests.

use std::collections::VecDeque;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::HarvestError;
use crate::model::CandidateItem;
use crate::provider::{SearchPage, SearchProvider, SearchQuery};
use crate::retry::{Pacer, Sleeper};

/// Writes an executable bash script standing in for an external program.
pub fn install_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/usr/bin/env bash\nset -euo pipefail\n{body}\n")).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

pub fn sample_item(id: &str, view_count: u64, duration_secs: u64) -> CandidateItem {
    CandidateItem {
        id: id.to_string(),
        secondary_id: "1001".into(),
        title: format!("clip {id}"),
        author_name: "uploader".into(),
        author_id: "42".into(),
        duration_secs,
        view_count,
        published_text: "2023-01-03 10:00:00".into(),
        source_url: format!("https://www.bilibili.com/video/{id}"),
        ..CandidateItem::default()
    }
}

#[derive(Default)]
pub struct RecordingSleeper {
    calls: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn recorded(&self) -> Vec<Duration> {
        self.calls.lock().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.calls.lock().push(duration);
    }
}

/// A pacer that records requested pauses instead of sleeping.
pub fn instant_pacer() -> (Pacer, Arc<RecordingSleeper>) {
    let sleeper = Arc::new(RecordingSleeper::default());
    (Pacer::new(sleeper.clone()), sleeper)
}

/// Replays scripted page responses and counts calls.
pub struct FakeProvider {
    pub page_size: usize,
    responses: Mutex<VecDeque<Result<SearchPage, HarvestError>>>,
    pub queries: Mutex<Vec<u32>>,
}

impl FakeProvider {
    pub fn new(page_size: usize, responses: Vec<Result<SearchPage, HarvestError>>) -> Self {
        Self {
            page_size,
            responses: Mutex::new(responses.into()),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.queries.lock().len()
    }
}

impl SearchProvider for FakeProvider {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn fetch_page(&self, query: &SearchQuery) -> Result<SearchPage, HarvestError> {
        self.queries.lock().push(query.page);
        self.responses.lock().pop_front().unwrap_or_else(|| {
            Ok(SearchPage {
                items: Vec::new(),
                has_next_page: false,
                total_results: None,
            })
        })
    }
}

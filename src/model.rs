#![forbid(unsafe_code)]

//! Records that flow through the pipeline and into the CSV files.
//!
//! Field order matters: the csv writer emits columns in declaration order, and
//! the header constants below must stay in sync with it.

use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};

/// Columns of a per-window search cache.
pub const CACHE_COLUMNS: [&str; 15] = [
    "id",
    "secondary_id",
    "title",
    "author",
    "author_id",
    "duration",
    "view_count",
    "danmaku",
    "reply",
    "favorite",
    "coin",
    "share",
    "like",
    "upload_time",
    "url",
];

/// Columns of the completion ledger: the cache columns plus `local_path`.
pub const LEDGER_COLUMNS: [&str; 16] = [
    "id",
    "secondary_id",
    "title",
    "author",
    "author_id",
    "duration",
    "view_count",
    "danmaku",
    "reply",
    "favorite",
    "coin",
    "share",
    "like",
    "upload_time",
    "url",
    "local_path",
];

pub const FAILURE_COLUMNS: [&str; 10] = [
    "id",
    "title",
    "author",
    "author_id",
    "duration",
    "view_count",
    "upload_time",
    "url",
    "error",
    "timestamp",
];

pub const SKIP_COLUMNS: [&str; 5] = ["id", "title", "reason", "detail", "timestamp"];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One search hit. Missing provider fields become zeros and empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateItem {
    pub id: String,
    #[serde(default)]
    pub secondary_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "author", default)]
    pub author_name: String,
    #[serde(default)]
    pub author_id: String,
    #[serde(rename = "duration")]
    pub duration_secs: u64,
    pub view_count: u64,
    #[serde(default)]
    pub danmaku: u64,
    #[serde(default)]
    pub reply: u64,
    #[serde(default)]
    pub favorite: u64,
    #[serde(default)]
    pub coin: u64,
    #[serde(default)]
    pub share: u64,
    #[serde(default)]
    pub like: u64,
    /// Raw publish text as the provider showed it, or a formatted absolute
    /// time once resolved.
    #[serde(rename = "upload_time", default)]
    pub published_text: String,
    #[serde(rename = "url", default)]
    pub source_url: String,
    #[serde(skip)]
    pub published_at: Option<i64>,
}

impl CandidateItem {
    /// Attaches an absolute publish time and rewrites the text form so the
    /// cache and ledger carry an unambiguous value.
    pub fn resolve_published(&mut self, timestamp: i64) {
        self.published_at = Some(timestamp);
        if let Some(text) = format_local_timestamp(timestamp) {
            self.published_text = text;
        }
    }
}

/// A fully finalized item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub secondary_id: String,
    pub title: String,
    pub author: String,
    pub author_id: String,
    pub duration: u64,
    pub view_count: u64,
    pub danmaku: u64,
    pub reply: u64,
    pub favorite: u64,
    pub coin: u64,
    pub share: u64,
    pub like: u64,
    pub upload_time: String,
    pub url: String,
    pub local_path: String,
}

impl LedgerEntry {
    pub fn from_item(item: &CandidateItem, local_path: &str) -> Self {
        Self {
            id: item.id.clone(),
            secondary_id: item.secondary_id.clone(),
            title: item.title.clone(),
            author: item.author_name.clone(),
            author_id: item.author_id.clone(),
            duration: item.duration_secs,
            view_count: item.view_count,
            danmaku: item.danmaku,
            reply: item.reply,
            favorite: item.favorite,
            coin: item.coin,
            share: item.share,
            like: item.like,
            upload_time: item.published_text.clone(),
            url: item.source_url.clone(),
            local_path: local_path.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub id: String,
    pub title: String,
    pub author: String,
    pub author_id: String,
    pub duration: u64,
    pub view_count: u64,
    pub upload_time: String,
    pub url: String,
    pub error: String,
    pub timestamp: String,
}

impl FailureEntry {
    pub fn from_item(item: &CandidateItem, error: &str) -> Self {
        Self {
            id: item.id.clone(),
            title: item.title.clone(),
            author: item.author_name.clone(),
            author_id: item.author_id.clone(),
            duration: item.duration_secs,
            view_count: item.view_count,
            upload_time: item.published_text.clone(),
            url: item.source_url.clone(),
            error: error.to_string(),
            timestamp: now_text(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    OverDuration,
    OversizedMedia,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::OverDuration => "over_duration",
            SkipReason::OversizedMedia => "oversized_media",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipEntry {
    pub id: String,
    pub title: String,
    pub reason: String,
    pub detail: String,
    pub timestamp: String,
}

impl SkipEntry {
    pub fn from_item(item: &CandidateItem, reason: SkipReason, detail: &str) -> Self {
        Self {
            id: item.id.clone(),
            title: item.title.clone(),
            reason: reason.as_str().to_string(),
            detail: detail.to_string(),
            timestamp: now_text(),
        }
    }
}

pub fn format_local_timestamp(timestamp: i64) -> Option<String> {
    Local
        .timestamp_opt(timestamp, 0)
        .single()
        .map(|datetime| datetime.format(TIMESTAMP_FORMAT).to_string())
}

fn now_text() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

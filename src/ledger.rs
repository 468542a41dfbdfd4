#![forbid(unsafe_code)]

//! Completion ledger.
//!
//! The set of completed ids is always recomputed as the union of the ids in
//! `completed.csv` and the ids recovered from finalized artifacts on disk, so
//! a crash between finalizing and recording never causes a re-download.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use walkdir::WalkDir;

use crate::error::HarvestError;
use crate::model::{
    FAILURE_COLUMNS, FailureEntry, LEDGER_COLUMNS, LedgerEntry, SKIP_COLUMNS, SkipEntry,
};

pub const LEDGER_FILE: &str = "completed.csv";
pub const FAILURE_FILE: &str = "failed_downloads.csv";
pub const SKIP_FILE: &str = "skipped.csv";

/// Header names accepted for the id column. `bvid` is what older ledgers used.
const ID_HEADERS: [&str; 2] = ["id", "bvid"];

pub struct CompletionLedger {
    root: PathBuf,
    record_path: PathBuf,
    failure_path: PathBuf,
    skip_path: PathBuf,
    ids: HashSet<String>,
}

impl CompletionLedger {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            record_path: root.join(LEDGER_FILE),
            failure_path: root.join(FAILURE_FILE),
            skip_path: root.join(SKIP_FILE),
            ids: HashSet::new(),
        }
    }

    /// Opens the ledger and computes the completed set.
    pub fn open(root: &Path) -> Result<Self, HarvestError> {
        let mut ledger = Self::new(root);
        ledger.load()?;
        Ok(ledger)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Recomputes the completed set from scratch.
    pub fn load(&mut self) -> Result<(), HarvestError> {
        let mut ids = self.recorded_ids()?;
        let recovered = self.recovered_ids();
        let before = ids.len();
        ids.extend(recovered);
        if ids.len() > before {
            log::info!(
                "Recovered {} completed id(s) from artifacts missing in {}",
                ids.len() - before,
                LEDGER_FILE
            );
        }
        self.ids = ids;
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ids listed in `completed.csv`. Accepts an `id` or `bvid` header, or a
    /// headerless file whose first column is the id.
    pub fn recorded_ids(&self) -> Result<HashSet<String>, HarvestError> {
        let mut ids = HashSet::new();
        if !self.record_path.exists() {
            return Ok(ids);
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&self.record_path)
            .map_err(|err| HarvestError::ledger(&self.record_path, err))?;

        let mut column = 0;
        for (index, record) in reader.records().enumerate() {
            let record = record.map_err(|err| HarvestError::ledger(&self.record_path, err))?;
            if index == 0
                && let Some(position) = record.iter().position(|field| {
                    ID_HEADERS.contains(&field.trim().to_ascii_lowercase().as_str())
                })
            {
                column = position;
                continue;
            }
            if let Some(id) = record.get(column).map(str::trim)
                && !id.is_empty()
            {
                ids.insert(id.to_owned());
            }
        }
        Ok(ids)
    }

    /// Ids recovered from `<id>_..._final.<ext>` files anywhere under the root.
    pub fn recovered_ids(&self) -> HashSet<String> {
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(id_from_artifact_name)
                    .map(str::to_owned)
            })
            .collect()
    }

    pub fn record(&mut self, entry: &LedgerEntry) -> Result<(), HarvestError> {
        append_row(&self.record_path, &LEDGER_COLUMNS, entry)?;
        self.ids.insert(entry.id.clone());
        Ok(())
    }

    pub fn record_failure(&self, entry: &FailureEntry) -> Result<(), HarvestError> {
        append_row(&self.failure_path, &FAILURE_COLUMNS, entry)
    }

    pub fn record_skip(&self, entry: &SkipEntry) -> Result<(), HarvestError> {
        append_row(&self.skip_path, &SKIP_COLUMNS, entry)
    }

    /// Deletes every artifact and record under the root, leaving it empty.
    pub fn reset(&mut self) -> Result<(), HarvestError> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root).map_err(|err| HarvestError::ledger(&self.root, err))?;
        }
        fs::create_dir_all(&self.root).map_err(|err| HarvestError::ledger(&self.root, err))?;
        self.ids.clear();
        Ok(())
    }
}

fn artifact_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([A-Za-z0-9]+)_.*final\.(?:mp4|mkv|webm|flv|mov)$")
            .unwrap_or_else(|err| panic!("artifact pattern: {err}"))
    })
}

/// Extracts the id from a finalized artifact file name.
pub fn id_from_artifact_name(name: &str) -> Option<&str> {
    artifact_pattern()
        .captures(name)
        .and_then(|caps| caps.get(1))
        .map(|id| id.as_str())
}

/// Appends one CSV row, writing the header first when the file is new or empty.
fn append_row<T: Serialize>(path: &Path, columns: &[&str], row: &T) -> Result<(), HarvestError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| HarvestError::ledger(parent, err))?;
    }
    let fresh = fs::metadata(path).map(|meta| meta.len() == 0).unwrap_or(true);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| HarvestError::ledger(path, err))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if fresh {
        writer
            .write_record(columns)
            .map_err(|err| HarvestError::ledger(path, err))?;
    }
    writer
        .serialize(row)
        .map_err(|err| HarvestError::ledger(path, err))?;
    writer.flush().map_err(|err| HarvestError::ledger(path, err))?;
    Ok(())
}

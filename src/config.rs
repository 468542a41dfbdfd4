#![forbid(unsafe_code)]

//! Runtime configuration.
//!
//! Paths and tool locations come from a `.env` file, the process environment
//! and CLI overrides (in increasing precedence). Pipeline tuning lives in a
//! TOML settings file where every field has a default.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::filter::FilterThresholds;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_SETTINGS_PATH: &str = "harvest.toml";
pub const DEFAULT_OUTPUT_ROOT: &str = "harvest_output";
pub const DEFAULT_FETCH_TOOL: &str = "BBDown";
pub const DEFAULT_ENCODER: &str = "ffmpeg";
pub const DEFAULT_CREDENTIAL_FILE: &str = "session.json";

#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub output_root: PathBuf,
    pub fetch_tool: PathBuf,
    pub encoder: PathBuf,
    pub credential_file: PathBuf,
    /// Where the fetch tool expects its cookie JSON, if it reads one.
    pub fetch_cookie_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub output_root: Option<PathBuf>,
    pub fetch_tool: Option<PathBuf>,
    pub encoder: Option<PathBuf>,
    pub credential_file: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_paths(overrides: RuntimeOverrides) -> Result<RuntimePaths> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    Ok(build_runtime_paths_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

fn build_runtime_paths_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimePaths {
    let pick = |override_value: Option<PathBuf>, key: &str, default: &str| {
        override_value
            .or_else(|| lookup_value(key, file_vars, &env_lookup).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(default))
    };

    RuntimePaths {
        output_root: pick(
            overrides.output_root,
            "HARVEST_OUTPUT_ROOT",
            DEFAULT_OUTPUT_ROOT,
        ),
        fetch_tool: pick(overrides.fetch_tool, "HARVEST_FETCH_TOOL", DEFAULT_FETCH_TOOL),
        encoder: pick(overrides.encoder, "HARVEST_ENCODER", DEFAULT_ENCODER),
        credential_file: pick(
            overrides.credential_file,
            "HARVEST_CREDENTIAL_FILE",
            DEFAULT_CREDENTIAL_FILE,
        ),
        fetch_cookie_file: lookup_value("HARVEST_FETCH_COOKIES", file_vars, &env_lookup)
            .map(PathBuf::from),
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .filter(|value| !value.trim().is_empty())
            .cloned()
    })
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

/// Inclusive range of seconds a randomized pause is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl DelayRange {
    pub const fn new(min_secs: f64, max_secs: f64) -> Self {
        Self { min_secs, max_secs }
    }

    pub fn sample(&self) -> Duration {
        let min = self.min_secs.max(0.0);
        let max = self.max_secs.max(min);
        let secs = if max > min {
            rand::rng().random_range(min..=max)
        } else {
            min
        };
        Duration::from_secs_f64(secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelaySettings {
    /// After every search request.
    pub request: DelayRange,
    /// Between two item acquisitions.
    pub item: DelayRange,
    /// Between two windows.
    pub window: DelayRange,
    /// Backoff after an anti-automation response.
    pub blocked: DelayRange,
    /// Backoff after a transient network failure.
    pub transient: DelayRange,
    /// Backoff between fetch/encode attempts.
    pub tool_retry: DelayRange,
}

impl Default for DelaySettings {
    fn default() -> Self {
        Self {
            request: DelayRange::new(2.0, 5.0),
            item: DelayRange::new(3.0, 6.0),
            window: DelayRange::new(5.0, 15.0),
            blocked: DelayRange::new(10.0, 20.0),
            transient: DelayRange::new(5.0, 10.0),
            tool_retry: DelayRange::new(2.0, 5.0),
        }
    }
}

/// Contents of `harvest.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub keyword: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub min_view_count: u64,
    pub max_duration_secs: u64,
    pub max_media_mb: f64,
    pub max_pages: u32,
    pub max_retries: u32,
    pub max_blocked_retries: u32,
    pub encode_timeout_secs: u64,
    pub delays: DelaySettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            keyword: "哈基米".to_string(),
            start_date: NaiveDate::from_ymd_opt(2023, 4, 22).unwrap_or_default(),
            end_date: NaiveDate::from_ymd_opt(2025, 6, 6).unwrap_or_default(),
            min_view_count: 500,
            max_duration_secs: 600,
            max_media_mb: 500.0,
            max_pages: 20,
            max_retries: 3,
            max_blocked_retries: 3,
            encode_timeout_secs: 30 * 60,
            delays: DelaySettings::default(),
        }
    }
}

impl PipelineSettings {
    pub fn thresholds(&self) -> FilterThresholds {
        FilterThresholds {
            min_view_count: self.min_view_count,
            max_duration_secs: self.max_duration_secs,
        }
    }
}

/// Reads the TOML settings file. A missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<PipelineSettings> {
    if !path.exists() {
        return Ok(PipelineSettings::default());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("Parsing {}", path.display()))
}

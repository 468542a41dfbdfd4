#![forbid(unsafe_code)]

//! Search provider abstraction and the HTTP implementation backed by the
//! platform's JSON search API.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use serde_json::Value;

use crate::credential::{Credential, CredentialValidator, SessionContext};
use crate::error::HarvestError;
use crate::model::CandidateItem;
use crate::window::TimeWindow;

pub const API_BASE: &str = "https://api.bilibili.com";
pub const VIDEO_URL_BASE: &str = "https://www.bilibili.com/video/";
pub const PAGE_SIZE: usize = 20;
/// Body code the API returns instead of HTTP 412 on some edges.
const BLOCKED_BODY_CODE: i64 = -412;
const NOT_LOGGED_IN_CODE: i64 = -101;
const REFRESH_AFTER_SECS: i64 = 60 * 60;

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub keyword: String,
    /// 1-based.
    pub page: u32,
    pub window: TimeWindow,
}

#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub items: Vec<CandidateItem>,
    pub has_next_page: bool,
    pub total_results: Option<u64>,
}

pub trait SearchProvider {
    /// Nominal number of results in a full page.
    fn page_size(&self) -> usize;
    fn fetch_page(&self, query: &SearchQuery) -> Result<SearchPage, HarvestError>;
}

impl<P: SearchProvider + ?Sized> SearchProvider for Arc<P> {
    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    fn fetch_page(&self, query: &SearchQuery) -> Result<SearchPage, HarvestError> {
        (**self).fetch_page(query)
    }
}

/// Blocking HTTP access to the platform API.
pub struct PlatformClient {
    agent: ureq::Agent,
    api_base: String,
}

impl Default for PlatformClient {
    fn default() -> Self {
        Self::new(API_BASE)
    }
}

impl PlatformClient {
    pub fn new(api_base: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(15))
            .timeout_write(Duration::from_secs(10))
            .build();
        Self {
            agent,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    fn get(&self, credential: &Credential, path: &str) -> ureq::Request {
        self.agent
            .get(&format!("{}{}", self.api_base, path))
            .set("User-Agent", &credential.user_agent)
            .set("Referer", "https://search.bilibili.com/")
            .set("Accept", "application/json, text/plain, */*")
            .set("Accept-Language", "zh-CN,zh;q=0.9,en-US;q=0.8,en;q=0.7")
            .set("Cookie", &credential.cookie_header())
    }
}

fn read_body(response: ureq::Response) -> Result<String, HarvestError> {
    response
        .into_string()
        .map_err(|err| HarvestError::TransientNetwork(format!("reading body: {err}")))
}

impl CredentialValidator for PlatformClient {
    fn validate(&self, credential: &Credential) -> Result<bool, HarvestError> {
        let response = self.get(credential, "/x/web-interface/nav").call()?;
        parse_nav_payload(&read_body(response)?)
    }
}

/// Keyword search over the platform API using the run's session.
pub struct HttpSearchProvider {
    client: PlatformClient,
    session: Arc<SessionContext>,
}

impl HttpSearchProvider {
    pub fn new(client: PlatformClient, session: Arc<SessionContext>) -> Self {
        Self { client, session }
    }

    /// Revalidates a session older than an hour. A rejection ends the run;
    /// a failed check is retried on the next request.
    fn refresh_if_stale(&self) -> Result<(), HarvestError> {
        let now = Local::now().timestamp();
        if now - self.session.current().captured_at < REFRESH_AFTER_SECS {
            return Ok(());
        }
        match self.session.refresh(&self.client, now) {
            Ok(true) => {
                log::debug!("Session credential revalidated");
                Ok(())
            }
            Ok(false) => Err(HarvestError::Credential(
                "the platform rejected the session on revalidation".into(),
            )),
            Err(err) => {
                log::warn!("Could not revalidate the session: {err}");
                Ok(())
            }
        }
    }
}

impl SearchProvider for HttpSearchProvider {
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn fetch_page(&self, query: &SearchQuery) -> Result<SearchPage, HarvestError> {
        self.refresh_if_stale()?;
        let credential = self.session.current();
        log::debug!(
            "Requesting page {} of '{}' in {}",
            query.page,
            query.keyword,
            query.window.label()
        );
        let response = self
            .client
            .get(&credential, "/x/web-interface/search/type")
            .query("search_type", "video")
            .query("keyword", &query.keyword)
            .query("order", "pubdate")
            .query("duration", "0")
            .query("tids", "0")
            .query("page", &query.page.to_string())
            .query("pubtime_begin_s", &query.window.start_timestamp.to_string())
            .query("pubtime_end_s", &query.window.end_timestamp.to_string())
            .call()?;
        parse_search_payload(&read_body(response)?, query.page, PAGE_SIZE)
    }
}

fn decode_json(body: &str) -> Result<Value, HarvestError> {
    serde_json::from_str(body)
        .map_err(|err| HarvestError::ProviderDataAnomaly(format!("invalid JSON: {err}")))
}

fn body_code(payload: &Value) -> i64 {
    payload.get("code").and_then(Value::as_i64).unwrap_or(0)
}

fn check_code(payload: &Value) -> Result<(), HarvestError> {
    match body_code(payload) {
        0 => Ok(()),
        BLOCKED_BODY_CODE => Err(HarvestError::Blocked {
            status: BLOCKED_BODY_CODE,
        }),
        NOT_LOGGED_IN_CODE => Err(HarvestError::Credential(format!(
            "the platform no longer accepts the session (API code {NOT_LOGGED_IN_CODE})"
        ))),
        code => {
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            Err(HarvestError::ProviderDataAnomaly(format!(
                "API code {code}: {message}"
            )))
        }
    }
}

pub fn parse_nav_payload(body: &str) -> Result<bool, HarvestError> {
    let payload = decode_json(body)?;
    if body_code(&payload) == NOT_LOGGED_IN_CODE {
        return Ok(false);
    }
    check_code(&payload)?;
    Ok(payload
        .pointer("/data/isLogin")
        .and_then(Value::as_bool)
        .unwrap_or(false))
}

/// Decodes one search response. Entries without an id are skipped with a
/// warning rather than failing the page.
pub fn parse_search_payload(
    body: &str,
    page: u32,
    page_size: usize,
) -> Result<SearchPage, HarvestError> {
    let payload = decode_json(body)?;
    check_code(&payload)?;
    let Some(data) = payload.get("data") else {
        return Ok(SearchPage::default());
    };

    let raw_results = data
        .get("result")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut items = Vec::with_capacity(raw_results.len());
    for entry in raw_results {
        match candidate_from_value(entry) {
            Some(item) => items.push(item),
            None => log::warn!("Skipping search entry without an id"),
        }
    }

    let total_results = data.get("numResults").and_then(value_as_u64);
    let has_next_page = match data.get("numPages").and_then(value_as_u64) {
        Some(pages) => u64::from(page) < pages,
        None => raw_results.len() >= page_size,
    };

    Ok(SearchPage {
        items,
        has_next_page,
        total_results,
    })
}

fn candidate_from_value(entry: &Value) -> Option<CandidateItem> {
    let id = value_as_string(entry.get("bvid")?);
    if id.is_empty() {
        return None;
    }
    let field_u64 = |key: &str| entry.get(key).and_then(value_as_u64).unwrap_or(0);
    let field_string = |key: &str| entry.get(key).map(value_as_string).unwrap_or_default();

    let duration_secs = match entry.get("duration") {
        Some(Value::String(text)) if text.contains(':') => parse_duration(text),
        Some(other) => value_as_u64(other).unwrap_or(0),
        None => 0,
    };
    let published_text = match entry.get("pubdate") {
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::String(text)) => text.clone(),
        _ => String::new(),
    };

    Some(CandidateItem {
        secondary_id: field_string("aid"),
        title: strip_highlight(&field_string("title")),
        author_name: field_string("author"),
        author_id: field_string("mid"),
        duration_secs,
        view_count: field_u64("play"),
        danmaku: field_u64("video_review"),
        reply: field_u64("review"),
        favorite: field_u64("favorites"),
        coin: field_u64("coins"),
        share: field_u64("share"),
        like: field_u64("like"),
        published_text,
        source_url: format!("{VIDEO_URL_BASE}{id}"),
        id,
        published_at: None,
    })
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64)),
        Value::String(text) => Some(parse_count(text)),
        _ => None,
    }
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Removes the `<em class="keyword">` highlight markup from titles.
pub fn strip_highlight(title: &str) -> String {
    title
        .replace("<em class=\"keyword\">", "")
        .replace("</em>", "")
}

/// Parses display counts such as `1234`, `1,234`, `3.5万` and `1.2亿`.
/// Unparseable text counts as zero.
pub fn parse_count(text: &str) -> u64 {
    let text = text.trim();
    let scaled = |number: &str, factor: f64| {
        number
            .trim()
            .parse::<f64>()
            .map(|value| (value * factor) as u64)
            .unwrap_or(0)
    };
    if let Some(number) = text.strip_suffix('万') {
        scaled(number, 10_000.0)
    } else if let Some(number) = text.strip_suffix('亿') {
        scaled(number, 100_000_000.0)
    } else {
        text.replace(',', "").parse().unwrap_or(0)
    }
}

/// `MM:SS` or `HH:MM:SS` to seconds. Anything else is zero.
pub fn parse_duration(text: &str) -> u64 {
    let parts: Option<Vec<u64>> = text
        .trim()
        .split(':')
        .map(|part| part.trim().parse().ok())
        .collect();
    match parts.as_deref() {
        Some([minutes, seconds]) => minutes * 60 + seconds,
        Some([hours, minutes, seconds]) => hours * 3600 + minutes * 60 + seconds,
        _ => 0,
    }
}

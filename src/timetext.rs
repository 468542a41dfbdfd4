#![forbid(unsafe_code)]

//! Turns the publish-time text shown by the provider into a unix timestamp.
//!
//! The provider mixes absolute dates, month-day dates without a year and
//! relative phrases ("3小时前", "yesterday"). Anything that does not match a
//! known form stays unresolved and the caller drops the item.

use std::sync::OnceLock;

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, NaiveTime, TimeZone};
use regex::Regex;

use crate::window::TimeWindow;

struct Patterns {
    absolute: Regex,
    month_day: Regex,
    hours_ago: Regex,
    minutes_ago: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        absolute: Regex::new(
            r"^(\d{4})-(\d{1,2})-(\d{1,2})(?:[ T](\d{1,2}):(\d{2})(?::(\d{2}))?)?$",
        )
        .unwrap_or_else(|err| panic!("absolute date pattern: {err}")),
        month_day: Regex::new(r"^(\d{1,2})-(\d{1,2})$")
            .unwrap_or_else(|err| panic!("month-day pattern: {err}")),
        hours_ago: Regex::new(r"(?i)(\d+)\s*(?:小时前|hours? ago)")
            .unwrap_or_else(|err| panic!("hours-ago pattern: {err}")),
        minutes_ago: Regex::new(r"(?i)(\d+)\s*(?:分钟前|min(?:ute)?s? ago)")
            .unwrap_or_else(|err| panic!("minutes-ago pattern: {err}")),
    })
}

/// Resolves `raw` against `window` (for year inference) and `now` (for
/// relative phrases). Returns `None` when no form matches.
pub fn normalize(raw: &str, window: &TimeWindow, now: DateTime<Local>) -> Option<i64> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }

    // Unix seconds, as the JSON API reports them.
    if text.bytes().all(|byte| byte.is_ascii_digit()) && text.len() >= 9 {
        return text.parse().ok();
    }

    let patterns = patterns();

    if let Some(caps) = patterns.absolute.captures(text) {
        let date = NaiveDate::from_ymd_opt(
            caps[1].parse().ok()?,
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
        )?;
        let field = |index: usize| {
            caps.get(index)
                .map_or(Some(0), |value| value.as_str().parse::<u32>().ok())
        };
        let time = NaiveTime::from_hms_opt(field(4)?, field(5)?, field(6)?)?;
        return local_timestamp(date, time);
    }

    if let Some(caps) = patterns.month_day.captures(text) {
        let month: u32 = caps[1].parse().ok()?;
        let day: u32 = caps[2].parse().ok()?;
        return month_day_timestamp(month, day, window);
    }

    if let Some(caps) = patterns.hours_ago.captures(text) {
        let hours: i64 = caps[1].parse().ok()?;
        return Some(now.timestamp() - hours * 3600);
    }

    if let Some(caps) = patterns.minutes_ago.captures(text) {
        let minutes: i64 = caps[1].parse().ok()?;
        return Some(now.timestamp() - minutes * 60);
    }

    let lowered = text.to_lowercase();
    if text.contains("前天") || lowered.contains("day before yesterday") {
        return Some((now - Duration::days(2)).timestamp());
    }
    if text.contains("昨天") || lowered.contains("yesterday") {
        return Some((now - Duration::days(1)).timestamp());
    }

    None
}

/// A month-day string carries no year. Use the window's start year unless the
/// window crosses New Year and only the end year lands inside it.
fn month_day_timestamp(month: u32, day: u32, window: &TimeWindow) -> Option<i64> {
    let start_year = window.start_date.year();
    let end_year = window.end_date.year();

    let at_year = |year: i32| {
        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|date| local_timestamp(date, NaiveTime::MIN))
    };

    let from_start = at_year(start_year);
    if end_year != start_year
        && !from_start.is_some_and(|ts| window.contains(ts))
        && let Some(ts) = at_year(end_year).filter(|ts| window.contains(*ts))
    {
        return Some(ts);
    }
    from_start
}

fn local_timestamp(date: NaiveDate, time: NaiveTime) -> Option<i64> {
    Local
        .from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|datetime| datetime.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::parse_date;

    fn window(start: &str, end: &str) -> TimeWindow {
        TimeWindow::new(parse_date(start).unwrap(), parse_date(end).unwrap())
    }

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, min, 0).single().unwrap()
    }

    #[test]
    fn absolute_forms() {
        let w = window("2023-01-01", "2023-01-07");
        let now = local(2024, 1, 1, 0, 0);
        assert_eq!(
            normalize("2023-01-03", &w, now),
            Some(local(2023, 1, 3, 0, 0).timestamp())
        );
        assert_eq!(
            normalize("2023-01-03 14:05", &w, now),
            Some(local(2023, 1, 3, 14, 5).timestamp())
        );
        assert_eq!(normalize("1672704000", &w, now), Some(1_672_704_000));
        assert_eq!(normalize("2023-02-30", &w, now), None);
    }

    #[test]
    fn month_day_uses_window_year() {
        let w = window("2023-05-01", "2023-05-07");
        let now = local(2025, 1, 1, 0, 0);
        assert_eq!(
            normalize("5-3", &w, now),
            Some(local(2023, 5, 3, 0, 0).timestamp())
        );
    }

    #[test]
    fn month_day_across_new_year() {
        let w = window("2022-12-29", "2023-01-04");
        let now = local(2025, 1, 1, 0, 0);
        assert_eq!(
            normalize("12-30", &w, now),
            Some(local(2022, 12, 30, 0, 0).timestamp())
        );
        assert_eq!(
            normalize("01-02", &w, now),
            Some(local(2023, 1, 2, 0, 0).timestamp())
        );
    }

    #[test]
    fn relative_phrases() {
        let w = window("2023-01-01", "2023-01-07");
        let now = local(2023, 1, 5, 12, 0);
        let base = now.timestamp();
        assert_eq!(normalize("3小时前", &w, now), Some(base - 3 * 3600));
        assert_eq!(normalize("2 hours ago", &w, now), Some(base - 2 * 3600));
        assert_eq!(normalize("15分钟前", &w, now), Some(base - 15 * 60));
        assert_eq!(normalize("5 minutes ago", &w, now), Some(base - 5 * 60));
        assert_eq!(
            normalize("昨天", &w, now),
            Some((now - Duration::days(1)).timestamp())
        );
        assert_eq!(
            normalize("前天", &w, now),
            Some((now - Duration::days(2)).timestamp())
        );
        assert_eq!(
            normalize("Day before yesterday", &w, now),
            Some((now - Duration::days(2)).timestamp())
        );
        assert_eq!(
            normalize("yesterday", &w, now),
            Some((now - Duration::days(1)).timestamp())
        );
    }

    #[test]
    fn unrecognized_text_is_unresolved() {
        let w = window("2023-01-01", "2023-01-07");
        let now = local(2023, 1, 5, 12, 0);
        assert_eq!(normalize("", &w, now), None);
        assert_eq!(normalize("recently", &w, now), None);
        assert_eq!(normalize("13-45", &w, now), None);
    }
}

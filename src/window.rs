#![forbid(unsafe_code)]

//! Weekly partitioning of the search date range.
//!
//! Searching the whole range at once hits the provider's result cap, so the
//! range is cut into contiguous windows of at most [`WINDOW_DAYS`] days. The
//! last window is shortened to end on the requested end date.

use anyhow::{Context, Result};
use chrono::{Days, Local, NaiveDate, NaiveTime, TimeZone};

pub const WINDOW_DAYS: u64 = 7;

/// Inclusive span of calendar days, with local-time second bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Local midnight at the start of `start_date`.
    pub start_timestamp: i64,
    /// Local 23:59:59 on `end_date`.
    pub end_timestamp: i64,
}

impl TimeWindow {
    pub fn new(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            start_date,
            end_date,
            start_timestamp: local_timestamp(start_date, NaiveTime::MIN),
            end_timestamp: local_timestamp(
                end_date,
                NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN),
            ),
        }
    }

    /// `YYYY-MM-DD_YYYY-MM-DD`, used in cache names and checkpoint lines.
    pub fn label(&self) -> String {
        format!(
            "{}_{}",
            self.start_date.format("%Y-%m-%d"),
            self.end_date.format("%Y-%m-%d")
        )
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        (self.start_timestamp..=self.end_timestamp).contains(&timestamp)
    }
}

/// Local wall-clock time to a unix timestamp. Skipped local times (DST gaps)
/// fall back to the earliest valid interpretation, then to UTC.
fn local_timestamp(date: NaiveDate, time: NaiveTime) -> i64 {
    let naive = date.and_time(time);
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|datetime| datetime.timestamp())
        .unwrap_or_else(|| naive.and_utc().timestamp())
}

pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{raw}', expected YYYY-MM-DD"))
}

/// Restartable iterator over the windows covering `start..=end`.
#[derive(Debug, Clone)]
pub struct WindowIter {
    next_start: Option<NaiveDate>,
    end: NaiveDate,
}

impl Iterator for WindowIter {
    type Item = TimeWindow;

    fn next(&mut self) -> Option<TimeWindow> {
        let start = self.next_start.filter(|start| *start <= self.end)?;
        let span_end = start
            .checked_add_days(Days::new(WINDOW_DAYS - 1))
            .unwrap_or(self.end)
            .min(self.end);
        self.next_start = span_end.succ_opt();
        Some(TimeWindow::new(start, span_end))
    }
}

/// Windows for `start..=end`. An inverted range yields nothing.
pub fn generate_windows(start: NaiveDate, end: NaiveDate) -> WindowIter {
    WindowIter {
        next_start: Some(start),
        end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(raw: &str) -> NaiveDate {
        parse_date(raw).unwrap()
    }

    #[test]
    fn windows_are_contiguous_and_cover_range() {
        let windows: Vec<_> = generate_windows(date("2023-04-22"), date("2023-06-06")).collect();
        assert_eq!(windows.first().unwrap().start_date, date("2023-04-22"));
        assert_eq!(windows.last().unwrap().end_date, date("2023-06-06"));
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end_date.succ_opt().unwrap(), pair[1].start_date);
        }
        for window in &windows {
            let span = (window.end_date - window.start_date).num_days() + 1;
            assert!((1..=WINDOW_DAYS as i64).contains(&span));
            assert!(window.start_timestamp < window.end_timestamp);
        }
    }

    #[test]
    fn last_window_is_truncated() {
        let windows: Vec<_> = generate_windows(date("2023-01-01"), date("2023-01-10")).collect();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].label(), "2023-01-01_2023-01-07");
        assert_eq!(windows[1].label(), "2023-01-08_2023-01-10");
    }

    #[test]
    fn single_day_and_inverted_ranges() {
        let single: Vec<_> = generate_windows(date("2024-02-29"), date("2024-02-29")).collect();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].start_date, single[0].end_date);

        assert_eq!(generate_windows(date("2024-03-02"), date("2024-03-01")).count(), 0);
    }

    #[test]
    fn iterator_is_restartable() {
        let iter = generate_windows(date("2023-01-01"), date("2023-02-01"));
        let first: Vec<_> = iter.clone().collect();
        let second: Vec<_> = iter.collect();
        assert_eq!(first, second);
    }

    #[test]
    fn contains_uses_inclusive_bounds() {
        let window = TimeWindow::new(date("2023-01-01"), date("2023-01-07"));
        assert!(window.contains(window.start_timestamp));
        assert!(window.contains(window.end_timestamp));
        assert!(!window.contains(window.end_timestamp + 1));
        assert!(!window.contains(window.start_timestamp - 1));
    }

    #[test]
    fn parse_date_rejects_garbage() {
        assert!(parse_date("2023-13-01").is_err());
        assert!(parse_date("yesterday").is_err());
        assert_eq!(parse_date(" 2023-05-01 ").unwrap(), date("2023-05-01"));
    }
}

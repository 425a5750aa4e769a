use chrono::{DateTime, Datelike, NaiveDate, Utc};

use crate::error::{Error, Result};

/// First day of the month containing `d`.
pub fn truncate_to_month(d: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(d.year(), d.month(), 1).unwrap()
}

/// First day of the month `offset` months before the month containing `base`.
/// An offset of 0 is the month of `base` itself. Rolls over year boundaries.
pub fn month_start(base: NaiveDate, offset: u32) -> NaiveDate {
    let mut year = base.year();
    let mut month = base.month() as i32 - offset as i32;
    while month <= 0 {
        month += 12;
        year -= 1;
    }
    NaiveDate::from_ymd_opt(year, month as u32, 1).unwrap()
}

/// First day of the month after the month containing `d`.
pub fn next_month(d: NaiveDate) -> NaiveDate {
    let year = d.year() + (d.month() / 12) as i32;
    let month = d.month() % 12 + 1;
    NaiveDate::from_ymd_opt(year, month, 1).unwrap()
}

/// Ordered first-of-month dates from the month of `start` through the month
/// of `end`, inclusive. Empty when `start` is in a later month than `end`.
pub fn month_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut current = truncate_to_month(start);
    let last = truncate_to_month(end);
    let mut months = Vec::new();
    while current <= last {
        months.push(current);
        current = next_month(current);
    }
    months
}

/// Display label for a month bucket, e.g. "Jan 2024".
pub fn month_label(d: NaiveDate) -> String {
    d.format("%b %Y").to_string()
}

/// Parse an ISO calendar date (YYYY-MM-DD).
pub fn parse_iso_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| Error::InvalidDate(s.to_string()))
}

/// Storage format for timestamps, matching SQLite's `datetime('now')` so
/// lexical comparisons in SQL line up with chronological order.
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

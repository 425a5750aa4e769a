use chrono::NaiveDate;

use crate::date_util::{month_range, month_start, parse_iso_date, truncate_to_month};
use crate::error::{Error, Result};

/// Bounds on a rolling trend window, in months.
pub const MIN_WINDOW_MONTHS: u32 = 1;
pub const MAX_WINDOW_MONTHS: u32 = 36;

/// An ordered list of calendar-month buckets, oldest first.
///
/// Built either from an explicit date range or as a rolling window ending at
/// the current month. Every date in the list is a first-of-month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthBuckets {
    months: Vec<NaiveDate>,
}

impl MonthBuckets {
    /// Buckets spanning month(start)..=month(end).
    ///
    /// Fails with `InvalidDate` when either input is not an ISO calendar
    /// date, and `InvalidRange` when start is after end.
    pub fn explicit(date_from: &str, date_to: &str) -> Result<Self> {
        let start = parse_iso_date(date_from)?;
        let end = parse_iso_date(date_to)?;
        if start > end {
            return Err(Error::InvalidRange(
                "date_from must be before date_to".to_string(),
            ));
        }
        Ok(MonthBuckets { months: month_range(start, end) })
    }

    /// The `months` most recent month buckets ending at the month of
    /// `today`, oldest first. `months` is clamped to [1, 36].
    pub fn rolling(months: u32, today: NaiveDate) -> Self {
        let months = months.clamp(MIN_WINDOW_MONTHS, MAX_WINDOW_MONTHS);
        let base = truncate_to_month(today);
        let starts = (0..months).rev().map(|offset| month_start(base, offset)).collect();
        MonthBuckets { months: starts }
    }

    pub fn earliest(&self) -> Option<NaiveDate> {
        self.months.first().copied()
    }

    pub fn contains(&self, month: NaiveDate) -> bool {
        self.months.binary_search(&month).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.months.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.months.len()
    }

    pub fn is_empty(&self) -> bool {
        self.months.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_explicit_inclusive_of_both_endpoints() {
        let buckets = MonthBuckets::explicit("2024-01-15", "2024-03-02").unwrap();
        let months: Vec<_> = buckets.iter().collect();
        assert_eq!(months, vec![d(2024, 1, 1), d(2024, 2, 1), d(2024, 3, 1)]);
    }

    #[test]
    fn test_explicit_single_month() {
        let buckets = MonthBuckets::explicit("2024-01-01", "2024-01-31").unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets.earliest(), Some(d(2024, 1, 1)));
    }

    #[test]
    fn test_explicit_unparseable_date() {
        assert!(matches!(
            MonthBuckets::explicit("not-a-date", "2024-01-31"),
            Err(Error::InvalidDate(_))
        ));
        assert!(matches!(
            MonthBuckets::explicit("2024-01-01", "2024-13-01"),
            Err(Error::InvalidDate(_))
        ));
    }

    #[test]
    fn test_explicit_inverted_range() {
        assert!(matches!(
            MonthBuckets::explicit("2024-02-01", "2024-01-01"),
            Err(Error::InvalidRange(_))
        ));
    }

    #[test]
    fn test_rolling_window_of_twelve() {
        let buckets = MonthBuckets::rolling(12, d(2024, 6, 17));
        assert_eq!(buckets.len(), 12);
        let months: Vec<_> = buckets.iter().collect();
        assert_eq!(months[0], d(2023, 7, 1));
        assert_eq!(*months.last().unwrap(), d(2024, 6, 1));
        assert!(months.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_rolling_clamps_window() {
        assert_eq!(MonthBuckets::rolling(0, d(2024, 6, 1)).len(), 1);
        assert_eq!(MonthBuckets::rolling(500, d(2024, 6, 1)).len(), 36);
    }

    #[test]
    fn test_rolling_spans_year_boundary() {
        let buckets = MonthBuckets::rolling(3, d(2024, 1, 20));
        let months: Vec<_> = buckets.iter().collect();
        assert_eq!(months, vec![d(2023, 11, 1), d(2023, 12, 1), d(2024, 1, 1)]);
    }

    #[test]
    fn test_contains() {
        let buckets = MonthBuckets::rolling(2, d(2024, 3, 10));
        assert!(buckets.contains(d(2024, 2, 1)));
        assert!(buckets.contains(d(2024, 3, 1)));
        assert!(!buckets.contains(d(2024, 1, 1)));
        assert!(!buckets.contains(d(2024, 3, 10)));
    }
}

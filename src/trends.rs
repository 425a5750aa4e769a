use std::collections::HashMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::access::AccessPolicy;
use crate::date_util::{month_label, parse_iso_date, truncate_to_month};
use crate::error::Result;
use crate::query::{AggregateFilter, MonthBuckets};
use crate::query::filter::AggregateRow;
use crate::storage::{repository, Database};
use crate::value::extract_total;

pub const DEFAULT_WINDOW_MONTHS: u32 = 12;

/// One month bucket of a trend series.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrendPoint {
    pub month: String,
    pub value: f64,
    pub target: i64,
}

/// A single-indicator monthly series. The trend label is a constant and the
/// forecast is the last bucket's value, a placeholder contract the portal
/// frontend relies on, not real statistics.
#[derive(Debug, Clone, Serialize)]
pub struct TrendSeries {
    pub data: Vec<TrendPoint>,
    pub trend: String,
    pub forecast: f64,
}

/// One entry of a bulk trend response.
#[derive(Debug, Clone, Serialize)]
pub struct IndicatorSeries {
    pub indicator_id: i64,
    pub indicator_name: String,
    pub data: Vec<TrendPoint>,
}

/// Per-indicator summary over the scoped record set.
#[derive(Debug, Clone, Serialize)]
pub struct IndicatorSummary {
    pub indicator_id: i64,
    pub indicator_name: String,
    pub total_value: f64,
    pub period_count: u64,
    pub trend: String,
}

/// Optional filters shared by the trend endpoints.
#[derive(Debug, Clone)]
pub struct TrendOptions {
    pub months: u32,
    pub organization: Option<i64>,
    pub project: Option<i64>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
}

impl Default for TrendOptions {
    fn default() -> Self {
        TrendOptions {
            months: DEFAULT_WINDOW_MONTHS,
            organization: None,
            project: None,
            date_from: None,
            date_to: None,
        }
    }
}

impl TrendOptions {
    /// Bucket list for these options: an explicit range when both dates are
    /// present (validated), otherwise a rolling window ending at `today`.
    fn buckets(&self, today: NaiveDate) -> Result<MonthBuckets> {
        match (&self.date_from, &self.date_to) {
            (Some(from), Some(to)) => MonthBuckets::explicit(from, to),
            _ => Ok(MonthBuckets::rolling(self.months, today)),
        }
    }

    /// Record filter for these options under the caller's policy. Date
    /// bounds apply individually even when only one is present.
    fn filter(&self, policy: &AccessPolicy) -> AggregateFilter {
        let mut filter = AggregateFilter::new().scoped(policy);
        if let Some(org) = self.organization {
            filter = filter.organization(org);
        }
        if let Some(project) = self.project {
            filter = filter.project(project);
        }
        if let Some(ref from) = self.date_from {
            filter = filter.period_start_gte(from);
        }
        if let Some(ref to) = self.date_to {
            filter = filter.period_end_lte(to);
        }
        filter
    }
}

/// Parse a delimited indicator id list, silently dropping entries that are
/// not plain digit strings.
pub fn parse_indicator_ids(param: &str) -> Vec<i64> {
    param
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
        .filter_map(|s| s.parse().ok())
        .collect()
}

/// Fold rows into per-bucket totals. A row lands in the bucket of its
/// period_start truncated to the first of the month; rows outside the bucket
/// list (or with an unparseable start date) are skipped.
fn fold_rows(buckets: &MonthBuckets, rows: &[AggregateRow]) -> Vec<TrendPoint> {
    let mut totals: HashMap<NaiveDate, f64> = buckets.iter().map(|m| (m, 0.0)).collect();
    for row in rows {
        let Ok(start) = parse_iso_date(&row.period_start) else {
            continue;
        };
        let month = truncate_to_month(start);
        if let Some(total) = totals.get_mut(&month) {
            *total += extract_total(&row.value);
        }
    }
    buckets
        .iter()
        .map(|month| TrendPoint {
            month: month_label(month),
            value: totals[&month],
            target: 0,
        })
        .collect()
}

fn series_from_points(data: Vec<TrendPoint>) -> TrendSeries {
    let forecast = data.last().map_or(0.0, |point| point.value);
    TrendSeries {
        data,
        trend: "stable".to_string(),
        forecast,
    }
}

/// Monthly totals for one indicator under the caller's access scope.
pub async fn indicator_trend(
    db: &Database,
    indicator_id: i64,
    options: &TrendOptions,
    policy: &AccessPolicy,
) -> Result<TrendSeries> {
    indicator_trend_as_of(db, indicator_id, options, policy, today()).await
}

pub async fn indicator_trend_as_of(
    db: &Database,
    indicator_id: i64,
    options: &TrendOptions,
    policy: &AccessPolicy,
    today: NaiveDate,
) -> Result<TrendSeries> {
    let buckets = options.buckets(today)?;
    let mut filter = options.filter(policy).indicator(indicator_id);
    if let Some(earliest) = buckets.earliest() {
        filter = filter.period_start_floor(&earliest.format("%Y-%m-%d").to_string());
    }
    let rows = filter.fetch(db).await?;
    Ok(series_from_points(fold_rows(&buckets, &rows)))
}

/// Monthly totals for a set of indicators, one independent bucket map per
/// indicator over one shared bucket list. Ids that don't resolve to a known
/// indicator still produce a series, under a placeholder name.
pub async fn indicator_trends_bulk(
    db: &Database,
    indicator_ids: &[i64],
    options: &TrendOptions,
    policy: &AccessPolicy,
) -> Result<Vec<IndicatorSeries>> {
    indicator_trends_bulk_as_of(db, indicator_ids, options, policy, today()).await
}

pub async fn indicator_trends_bulk_as_of(
    db: &Database,
    indicator_ids: &[i64],
    options: &TrendOptions,
    policy: &AccessPolicy,
    today: NaiveDate,
) -> Result<Vec<IndicatorSeries>> {
    if indicator_ids.is_empty() {
        return Ok(Vec::new());
    }

    let buckets = options.buckets(today)?;
    let mut filter = options.filter(policy).indicators(indicator_ids);
    if let Some(earliest) = buckets.earliest() {
        filter = filter.period_start_floor(&earliest.format("%Y-%m-%d").to_string());
    }
    let rows = filter.fetch(db).await?;

    let bucket_months: Vec<NaiveDate> = buckets.iter().collect();
    let mut totals_by_indicator: HashMap<i64, HashMap<NaiveDate, f64>> = indicator_ids
        .iter()
        .map(|id| (*id, bucket_months.iter().map(|m| (*m, 0.0)).collect()))
        .collect();

    for row in &rows {
        let Ok(start) = parse_iso_date(&row.period_start) else {
            continue;
        };
        let month = truncate_to_month(start);
        if let Some(totals) = totals_by_indicator.get_mut(&row.indicator_id) {
            if let Some(total) = totals.get_mut(&month) {
                *total += extract_total(&row.value);
            }
        }
    }

    let ids = indicator_ids.to_vec();
    let names = db
        .reader()
        .call(move |conn| repository::indicator_names(conn, &ids))
        .await?;

    let series = indicator_ids
        .iter()
        .map(|id| {
            let totals = &totals_by_indicator[id];
            let data = bucket_months
                .iter()
                .map(|month| TrendPoint {
                    month: month_label(*month),
                    value: totals[month],
                    target: 0,
                })
                .collect();
            IndicatorSeries {
                indicator_id: *id,
                indicator_name: names
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| format!("Indicator {id}")),
                data,
            }
        })
        .collect();

    Ok(series)
}

/// By-indicator totals and record counts over the scoped record set,
/// optionally date-bounded. Rows come back in indicator id order.
pub async fn indicator_summary(
    db: &Database,
    options: &TrendOptions,
    policy: &AccessPolicy,
) -> Result<Vec<IndicatorSummary>> {
    let rows = options.filter(policy).fetch(db).await?;

    let mut totals: HashMap<i64, (String, f64, u64)> = HashMap::new();
    for row in &rows {
        let entry = totals
            .entry(row.indicator_id)
            .or_insert_with(|| (row.indicator_name.clone(), 0.0, 0));
        entry.1 += extract_total(&row.value);
        entry.2 += 1;
    }

    let mut summaries: Vec<IndicatorSummary> = totals
        .into_iter()
        .map(|(id, (name, total_value, period_count))| IndicatorSummary {
            indicator_id: id,
            indicator_name: name,
            total_value,
            period_count,
            trend: "stable".to_string(),
        })
        .collect();
    summaries.sort_by_key(|s| s.indicator_id);
    Ok(summaries)
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

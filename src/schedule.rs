use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::date_util::format_timestamp;
use crate::error::{Error, Result};
use crate::storage::{repository, Database};

/// Recurrence of a scheduled report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
}

impl Frequency {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(Frequency::Daily),
            "weekly" => Some(Frequency::Weekly),
            "monthly" => Some(Frequency::Monthly),
            "quarterly" => Some(Frequency::Quarterly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Quarterly => "quarterly",
        }
    }

    /// Fixed day offsets: a "month" is 30 days and a "quarter" 90, not
    /// calendar-aware. The portal has always scheduled this way.
    fn offset_days(&self) -> i64 {
        match self {
            Frequency::Daily => 1,
            Frequency::Weekly => 7,
            Frequency::Monthly => 30,
            Frequency::Quarterly => 90,
        }
    }
}

/// Next run time for a frequency tag. Unrecognized tags get the weekly
/// offset.
pub fn next_run_for(frequency: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let frequency = Frequency::parse(frequency).unwrap_or(Frequency::Weekly);
    now + Duration::days(frequency.offset_days())
}

/// A stored scheduled report definition.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledReport {
    pub schedule_id: i64,
    pub report_name: String,
    pub report_type: String,
    pub parameters: Value,
    pub frequency: String,
    pub recipients: Value,
    pub is_active: bool,
    pub next_run: String,
    pub last_run: Option<String>,
    pub created_by: Option<String>,
}

/// Fields for creating a schedule. When `next_run` is not supplied it is
/// derived from the frequency.
#[derive(Debug, Clone)]
pub struct NewScheduledReport {
    pub report_name: String,
    pub report_type: String,
    pub parameters: Value,
    pub frequency: String,
    pub recipients: Value,
    pub next_run: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
}

pub async fn create(db: &Database, new: NewScheduledReport) -> Result<ScheduledReport> {
    if new.report_name.trim().is_empty() {
        return Err(Error::Validation("report_name required".to_string()));
    }
    if Frequency::parse(&new.frequency).is_none() {
        return Err(Error::Validation(format!(
            "unknown frequency: {}",
            new.frequency
        )));
    }
    let next_run = new.next_run.unwrap_or_else(|| next_run_for(&new.frequency, Utc::now()));
    let next_run = format_timestamp(next_run);

    let schedule_id = db
        .writer()
        .call(move |conn| {
            repository::insert_scheduled_report(
                conn,
                &new.report_name,
                &new.report_type,
                &new.parameters,
                &new.frequency,
                &new.recipients,
                &next_run,
                new.created_by.as_deref(),
            )
        })
        .await?;

    db.reader()
        .call(move |conn| repository::get_scheduled_report(conn, schedule_id))
        .await?
        .ok_or_else(|| Error::NotFound(format!("scheduled report {schedule_id}")))
}

pub async fn list(db: &Database) -> Result<Vec<ScheduledReport>> {
    db.reader()
        .call(|conn| repository::list_scheduled_reports(conn))
        .await
        .map_err(|e| Error::Database(e.to_string()))
}

/// Active schedules due at or before `now`, soonest first.
pub async fn due(db: &Database, now: DateTime<Utc>) -> Result<Vec<ScheduledReport>> {
    let now = format_timestamp(now);
    db.reader()
        .call(move |conn| repository::due_scheduled_reports(conn, &now))
        .await
        .map_err(|e| Error::Database(e.to_string()))
}

/// Record a completed run: stamp `last_run` and advance `next_run` by the
/// schedule's frequency offset.
pub async fn mark_run(db: &Database, schedule_id: i64, now: DateTime<Utc>) -> Result<ScheduledReport> {
    let schedule = db
        .reader()
        .call(move |conn| repository::get_scheduled_report(conn, schedule_id))
        .await?
        .ok_or_else(|| Error::NotFound(format!("scheduled report {schedule_id}")))?;

    let last_run = format_timestamp(now);
    let next_run = format_timestamp(next_run_for(&schedule.frequency, now));
    db.writer()
        .call(move |conn| repository::mark_scheduled_run(conn, schedule_id, &last_run, &next_run))
        .await?;

    db.reader()
        .call(move |conn| repository::get_scheduled_report(conn, schedule_id))
        .await?
        .ok_or_else(|| Error::NotFound(format!("scheduled report {schedule_id}")))
}

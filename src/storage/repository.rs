use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::reports::Report;
use crate::schedule::ScheduledReport;

// ── Organizations ──────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize)]
pub struct OrgRow {
    pub org_id: i64,
    pub name: String,
    pub code: String,
    pub org_type: String,
    pub parent_id: Option<i64>,
    pub is_active: bool,
}

pub fn upsert_organization(
    conn: &Connection,
    name: &str,
    code: &str,
    org_type: &str,
    parent_id: Option<i64>,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO organizations (name, code, org_type, parent_id)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(code) DO UPDATE SET
           name=excluded.name, org_type=excluded.org_type, parent_id=excluded.parent_id",
        params![name, code, org_type, parent_id],
    )?;
    conn.query_row(
        "SELECT org_id FROM organizations WHERE code = ?1",
        params![code],
        |row| row.get(0),
    )
}

/// (org_id, parent_id) pairs for every organization; feeds the hierarchy.
pub fn org_adjacency(conn: &Connection) -> Result<Vec<(i64, Option<i64>)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT org_id, parent_id FROM organizations")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

pub fn list_organizations(
    conn: &Connection,
    visible_ids: Option<&[i64]>,
) -> Result<Vec<OrgRow>, rusqlite::Error> {
    let mut out = Vec::new();
    let mut stmt = conn.prepare(
        "SELECT org_id, name, code, org_type, parent_id, is_active
         FROM organizations ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(OrgRow {
            org_id: row.get(0)?,
            name: row.get(1)?,
            code: row.get(2)?,
            org_type: row.get(3)?,
            parent_id: row.get(4)?,
            is_active: row.get::<_, i64>(5)? != 0,
        })
    })?;
    for row in rows {
        let row = row?;
        if let Some(ids) = visible_ids {
            if !ids.contains(&row.org_id) {
                continue;
            }
        }
        out.push(row);
    }
    Ok(out)
}

// ── Indicators / projects ──────────────────────────────────────────

pub fn upsert_indicator(
    conn: &Connection,
    name: &str,
    code: &str,
    indicator_type: &str,
    unit: &str,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO indicators (name, code, indicator_type, unit)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(code) DO UPDATE SET
           name=excluded.name, indicator_type=excluded.indicator_type, unit=excluded.unit",
        params![name, code, indicator_type, unit],
    )?;
    conn.query_row(
        "SELECT indicator_id FROM indicators WHERE code = ?1",
        params![code],
        |row| row.get(0),
    )
}

pub fn upsert_project(
    conn: &Connection,
    name: &str,
    code: &str,
    status: &str,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO projects (name, code, status)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(code) DO UPDATE SET
           name=excluded.name, status=excluded.status",
        params![name, code, status],
    )?;
    conn.query_row(
        "SELECT project_id FROM projects WHERE code = ?1",
        params![code],
        |row| row.get(0),
    )
}

/// Names for a set of indicator ids. Missing ids simply don't appear.
pub fn indicator_names(
    conn: &Connection,
    ids: &[i64],
) -> Result<std::collections::HashMap<i64, String>, rusqlite::Error> {
    let mut names = std::collections::HashMap::new();
    if ids.is_empty() {
        return Ok(names);
    }
    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT indicator_id, name FROM indicators WHERE indicator_id IN ({})",
        placeholders.join(",")
    );
    let mut stmt = conn.prepare(&sql)?;
    for (i, id) in ids.iter().enumerate() {
        stmt.raw_bind_parameter(i + 1, id)?;
    }
    let mut rows = stmt.raw_query();
    while let Some(row) = rows.next()? {
        names.insert(row.get(0)?, row.get(1)?);
    }
    Ok(names)
}

// ── Aggregates ─────────────────────────────────────────────────────

/// A fully-specified new measurement record.
#[derive(Debug, Clone)]
pub struct NewAggregate {
    pub indicator_id: i64,
    pub project_id: i64,
    pub org_id: i64,
    pub period_start: String,
    pub period_end: String,
    pub value: Value,
    pub notes: String,
    pub created_by: Option<String>,
}

pub fn insert_aggregate(conn: &Connection, agg: &NewAggregate) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO aggregates (
            indicator_id, project_id, org_id, period_start, period_end,
            value, notes, created_by
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            agg.indicator_id,
            agg.project_id,
            agg.org_id,
            agg.period_start,
            agg.period_end,
            agg.value.to_string(),
            agg.notes,
            agg.created_by,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Insert a batch of records in one transaction. The first failure rolls the
/// whole batch back; either every record commits or none does.
pub fn bulk_insert_aggregates(
    conn: &mut Connection,
    aggs: &[NewAggregate],
) -> Result<Vec<i64>, rusqlite::Error> {
    let tx = conn.transaction()?;
    let mut ids = Vec::with_capacity(aggs.len());
    for agg in aggs {
        ids.push(insert_aggregate(&tx, agg)?);
    }
    tx.commit()?;
    Ok(ids)
}

// ── Reports ────────────────────────────────────────────────────────

fn report_from_row(row: &rusqlite::Row) -> rusqlite::Result<Report> {
    let parameters: String = row.get(4)?;
    let cached_data: String = row.get(5)?;
    Ok(Report {
        report_id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        report_type: row.get(3)?,
        parameters: serde_json::from_str(&parameters).unwrap_or(Value::Null),
        cached_data: serde_json::from_str(&cached_data).unwrap_or(Value::Null),
        last_generated: row.get(6)?,
        organization_id: row.get(7)?,
        is_public: row.get::<_, i64>(8)? != 0,
        created_by: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

const REPORT_COLUMNS: &str = "report_id, name, description, report_type, parameters,
    cached_data, last_generated, org_id, is_public, created_by, created_at, updated_at";

pub fn get_report(conn: &Connection, report_id: i64) -> Result<Option<Report>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {REPORT_COLUMNS} FROM reports WHERE report_id = ?1"),
        params![report_id],
        report_from_row,
    )
    .optional()
}

#[allow(clippy::too_many_arguments)]
pub fn insert_report(
    conn: &Connection,
    name: &str,
    description: &str,
    report_type: &str,
    parameters: &Value,
    org_id: Option<i64>,
    is_public: bool,
    created_by: Option<&str>,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO reports (name, description, report_type, parameters, org_id, is_public, created_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            name,
            description,
            report_type,
            parameters.to_string(),
            org_id,
            is_public as i64,
            created_by,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Reports visible to a caller: admins see all; everyone else sees reports
/// of their own organization, public reports, and reports they created.
pub fn list_reports_visible(
    conn: &Connection,
    admin: bool,
    org_id: Option<i64>,
    username: Option<&str>,
) -> Result<Vec<Report>, rusqlite::Error> {
    let sql = if admin {
        format!("SELECT {REPORT_COLUMNS} FROM reports ORDER BY created_at DESC")
    } else {
        format!(
            "SELECT {REPORT_COLUMNS} FROM reports
             WHERE (org_id IS NOT NULL AND org_id = ?1)
                OR is_public = 1
                OR (created_by IS NOT NULL AND created_by = ?2)
             ORDER BY created_at DESC"
        )
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = if admin {
        stmt.query_map([], report_from_row)?
    } else {
        stmt.query_map(params![org_id, username], report_from_row)?
    };
    rows.collect()
}

/// Overwrite a report's snapshot. The previous cached data is discarded;
/// there is no snapshot history, and concurrent writers race last-write-wins.
pub fn update_report_snapshot(
    conn: &Connection,
    report_id: i64,
    cached_data: &Value,
    generated_at: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE reports
         SET cached_data = ?1, last_generated = ?2, updated_at = datetime('now')
         WHERE report_id = ?3",
        params![cached_data.to_string(), generated_at, report_id],
    )?;
    Ok(())
}

// ── Scheduled reports ──────────────────────────────────────────────

fn schedule_from_row(row: &rusqlite::Row) -> rusqlite::Result<ScheduledReport> {
    let parameters: String = row.get(3)?;
    let recipients: String = row.get(5)?;
    Ok(ScheduledReport {
        schedule_id: row.get(0)?,
        report_name: row.get(1)?,
        report_type: row.get(2)?,
        parameters: serde_json::from_str(&parameters).unwrap_or(Value::Null),
        frequency: row.get(4)?,
        recipients: serde_json::from_str(&recipients).unwrap_or(Value::Null),
        is_active: row.get::<_, i64>(6)? != 0,
        next_run: row.get(7)?,
        last_run: row.get(8)?,
        created_by: row.get(9)?,
    })
}

const SCHEDULE_COLUMNS: &str = "schedule_id, report_name, report_type, parameters,
    frequency, recipients, is_active, next_run, last_run, created_by";

#[allow(clippy::too_many_arguments)]
pub fn insert_scheduled_report(
    conn: &Connection,
    report_name: &str,
    report_type: &str,
    parameters: &Value,
    frequency: &str,
    recipients: &Value,
    next_run: &str,
    created_by: Option<&str>,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO scheduled_reports
            (report_name, report_type, parameters, frequency, recipients, next_run, created_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            report_name,
            report_type,
            parameters.to_string(),
            frequency,
            recipients.to_string(),
            next_run,
            created_by,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_scheduled_report(
    conn: &Connection,
    schedule_id: i64,
) -> Result<Option<ScheduledReport>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {SCHEDULE_COLUMNS} FROM scheduled_reports WHERE schedule_id = ?1"),
        params![schedule_id],
        schedule_from_row,
    )
    .optional()
}

pub fn list_scheduled_reports(
    conn: &Connection,
) -> Result<Vec<ScheduledReport>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SCHEDULE_COLUMNS} FROM scheduled_reports ORDER BY created_at DESC"
    ))?;
    let rows = stmt.query_map([], schedule_from_row)?;
    rows.collect()
}

/// Active schedules whose next_run is at or before `now`.
pub fn due_scheduled_reports(
    conn: &Connection,
    now: &str,
) -> Result<Vec<ScheduledReport>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SCHEDULE_COLUMNS} FROM scheduled_reports
         WHERE is_active = 1 AND next_run <= ?1
         ORDER BY next_run"
    ))?;
    let rows = stmt.query_map(params![now], schedule_from_row)?;
    rows.collect()
}

pub fn mark_scheduled_run(
    conn: &Connection,
    schedule_id: i64,
    last_run: &str,
    next_run: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE scheduled_reports
         SET last_run = ?1, next_run = ?2, updated_at = datetime('now')
         WHERE schedule_id = ?3",
        params![last_run, next_run, schedule_id],
    )?;
    Ok(())
}

// ── Status ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize)]
pub struct WarehouseStatus {
    pub aggregates: i64,
    pub organizations: i64,
    pub indicators: i64,
    pub projects: i64,
    pub reports: i64,
    pub scheduled_reports: i64,
    pub last_generated: Option<String>,
}

pub fn warehouse_status(conn: &Connection) -> Result<WarehouseStatus, rusqlite::Error> {
    let count = |table: &str| -> Result<i64, rusqlite::Error> {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
    };
    let last_generated: Option<String> = conn
        .query_row(
            "SELECT MAX(last_generated) FROM reports WHERE last_generated IS NOT NULL",
            [],
            |row| row.get(0),
        )
        .ok()
        .flatten();
    Ok(WarehouseStatus {
        aggregates: count("aggregates")?,
        organizations: count("organizations")?,
        indicators: count("indicators")?,
        projects: count("projects")?,
        reports: count("reports")?,
        scheduled_reports: count("scheduled_reports")?,
        last_generated,
    })
}

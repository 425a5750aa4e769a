use serde::Serialize;
use serde_json::Value;

use crate::access::AccessPolicy;
use crate::date_util::format_timestamp;
use crate::error::{Error, Result};
use crate::export::{self, ExportFormat, ReportExport};
use crate::query::filter::{AggregateFilter, AggregateRow};
use crate::storage::{repository, Database};
use crate::value::extract_total;

/// A persisted report definition with its single current snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub report_id: i64,
    pub name: String,
    pub description: String,
    pub report_type: String,
    pub parameters: Value,
    pub cached_data: Value,
    pub last_generated: Option<String>,
    pub organization_id: Option<i64>,
    pub is_public: bool,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Filters resolved from a report's stored parameters. Both `*_id` and
/// bare-name keys are accepted; the bare name only applies when the `*_id`
/// key is absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportParameters {
    pub project_id: Option<i64>,
    pub organization_id: Option<i64>,
    pub indicator_ids: Vec<i64>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub format: Option<String>,
}

impl ReportParameters {
    pub fn from_value(params: &Value) -> Self {
        let get = |key: &str| params.get(key);
        ReportParameters {
            project_id: id_param(get("project_id")).or_else(|| id_param(get("project"))),
            organization_id: id_param(get("organization_id"))
                .or_else(|| id_param(get("organization"))),
            indicator_ids: id_list_param(get("indicator_ids"))
                .or_else(|| id_list_param(get("indicators")))
                .unwrap_or_default(),
            date_from: str_param(get("date_from")),
            date_to: str_param(get("date_to")),
            format: str_param(get("format")),
        }
    }

    fn filter(&self, policy: &AccessPolicy) -> AggregateFilter {
        let mut filter = AggregateFilter::new().scoped(policy);
        if let Some(id) = self.project_id {
            filter = filter.project(id);
        }
        if let Some(id) = self.organization_id {
            filter = filter.organization(id);
        }
        if !self.indicator_ids.is_empty() {
            filter = filter.indicators(&self.indicator_ids);
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

fn id_param(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn id_list_param(value: Option<&Value>) -> Option<Vec<i64>> {
    let items = value?.as_array()?;
    if items.is_empty() {
        return None;
    }
    Some(items.iter().filter_map(|v| id_param(Some(v))).collect())
}

fn str_param(value: Option<&Value>) -> Option<String> {
    value.and_then(|v| v.as_str()).map(|s| s.to_string())
}

#[derive(Debug, Clone, Serialize)]
struct IndicatorReportRow {
    indicator_id: i64,
    indicator_code: String,
    indicator_name: String,
    total_value: f64,
    entries: u64,
}

#[derive(Debug, Clone, Serialize)]
struct ProjectReportRow {
    project_id: i64,
    project_name: String,
    total_value: f64,
    entries: u64,
}

#[derive(Debug, Clone, Serialize)]
struct CustomReportRow {
    indicator_id: i64,
    indicator_code: String,
    indicator_name: String,
    project_id: i64,
    project_name: String,
    organization_id: i64,
    organization_name: String,
    period_start: String,
    period_end: String,
    value: f64,
}

/// Compute the snapshot rows for a report type over the matching records.
///
/// `indicator` and `project` reports group and sum, sorted by total
/// descending (ties keep first-seen order); every other type is a raw
/// denormalized export, one row per record, unsorted.
fn snapshot_rows(report_type: &str, rows: &[AggregateRow]) -> Value {
    match report_type {
        "indicator" => {
            let mut grouped: Vec<IndicatorReportRow> = Vec::new();
            let mut index: std::collections::HashMap<i64, usize> = std::collections::HashMap::new();
            for row in rows {
                let slot = *index.entry(row.indicator_id).or_insert_with(|| {
                    grouped.push(IndicatorReportRow {
                        indicator_id: row.indicator_id,
                        indicator_code: row.indicator_code.clone(),
                        indicator_name: row.indicator_name.clone(),
                        total_value: 0.0,
                        entries: 0,
                    });
                    grouped.len() - 1
                });
                grouped[slot].total_value += extract_total(&row.value);
                grouped[slot].entries += 1;
            }
            grouped.sort_by(|a, b| b.total_value.total_cmp(&a.total_value));
            serde_json::to_value(grouped).unwrap_or(Value::Null)
        }
        "project" => {
            let mut grouped: Vec<ProjectReportRow> = Vec::new();
            let mut index: std::collections::HashMap<i64, usize> = std::collections::HashMap::new();
            for row in rows {
                let slot = *index.entry(row.project_id).or_insert_with(|| {
                    grouped.push(ProjectReportRow {
                        project_id: row.project_id,
                        project_name: row.project_name.clone(),
                        total_value: 0.0,
                        entries: 0,
                    });
                    grouped.len() - 1
                });
                grouped[slot].total_value += extract_total(&row.value);
                grouped[slot].entries += 1;
            }
            grouped.sort_by(|a, b| b.total_value.total_cmp(&a.total_value));
            serde_json::to_value(grouped).unwrap_or(Value::Null)
        }
        _ => {
            let flat: Vec<CustomReportRow> = rows
                .iter()
                .map(|row| CustomReportRow {
                    indicator_id: row.indicator_id,
                    indicator_code: row.indicator_code.clone(),
                    indicator_name: row.indicator_name.clone(),
                    project_id: row.project_id,
                    project_name: row.project_name.clone(),
                    organization_id: row.organization_id,
                    organization_name: row.organization_name.clone(),
                    period_start: row.period_start.clone(),
                    period_end: row.period_end.clone(),
                    value: extract_total(&row.value),
                })
                .collect();
            serde_json::to_value(flat).unwrap_or(Value::Null)
        }
    }
}

/// Recompute a report's snapshot from its stored parameters under the
/// caller's access scope, overwrite the cached data, and return the updated
/// report. Repeated calls over unchanged data are idempotent; concurrent
/// calls race last-write-wins.
pub async fn generate(db: &Database, report_id: i64, policy: &AccessPolicy) -> Result<Report> {
    let report = db
        .reader()
        .call(move |conn| repository::get_report(conn, report_id))
        .await?
        .ok_or_else(|| Error::NotFound(format!("report {report_id}")))?;

    let params = ReportParameters::from_value(&report.parameters);
    let rows = params.filter(policy).fetch(db).await?;
    let cached = snapshot_rows(&report.report_type, &rows);
    let generated_at = format_timestamp(chrono::Utc::now());

    db.writer()
        .call({
            let cached = cached.clone();
            let generated_at = generated_at.clone();
            move |conn| repository::update_report_snapshot(conn, report_id, &cached, &generated_at)
        })
        .await?;

    db.reader()
        .call(move |conn| repository::get_report(conn, report_id))
        .await?
        .ok_or_else(|| Error::NotFound(format!("report {report_id}")))
}

/// Render a report's cached snapshot as a file download. No recomputation:
/// what was last generated is what downloads. The format selector falls back
/// to the report's stored `format` parameter, then CSV.
pub async fn download(
    db: &Database,
    report_id: i64,
    format: Option<&str>,
) -> Result<ReportExport> {
    let report = db
        .reader()
        .call(move |conn| repository::get_report(conn, report_id))
        .await?
        .ok_or_else(|| Error::NotFound(format!("report {report_id}")))?;

    let params = ReportParameters::from_value(&report.parameters);
    let selector = format
        .map(|s| s.to_string())
        .or(params.format)
        .unwrap_or_else(|| "csv".to_string());
    let format = ExportFormat::parse(&selector).effective();

    let safe_name = {
        let slug = export::slugify(&report.name);
        if slug.is_empty() {
            format!("report-{report_id}")
        } else {
            slug
        }
    };

    let rows = export::cached_rows(&report.cached_data);
    let content = export::render_csv(&rows);

    Ok(ReportExport {
        filename: format!("{safe_name}.{}", format.extension()),
        content_type: format.content_type(),
        content,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::repository::NewAggregate;
    use serde_json::json;

    #[test]
    fn test_parameters_id_key_precedence() {
        let params = ReportParameters::from_value(&json!({
            "project_id": 1,
            "project": 2,
            "organization": 5,
            "indicators": [3, "4", "x"],
            "date_from": "2024-01-01"
        }));
        assert_eq!(params.project_id, Some(1));
        assert_eq!(params.organization_id, Some(5));
        assert_eq!(params.indicator_ids, vec![3, 4]);
        assert_eq!(params.date_from.as_deref(), Some("2024-01-01"));
        assert_eq!(params.date_to, None);
    }

    #[test]
    fn test_parameters_bare_name_only_without_id_key() {
        let params = ReportParameters::from_value(&json!({
            "organization_id": 9,
            "organization": 2
        }));
        assert_eq!(params.organization_id, Some(9));
    }

    #[test]
    fn test_parameters_empty_or_missing() {
        let params = ReportParameters::from_value(&json!({}));
        assert_eq!(params, ReportParameters::default());
        let params = ReportParameters::from_value(&Value::Null);
        assert_eq!(params, ReportParameters::default());
    }

    fn row(indicator: i64, project: i64, value: serde_json::Value) -> AggregateRow {
        AggregateRow {
            aggregate_id: 0,
            indicator_id: indicator,
            indicator_code: format!("IND-{indicator}"),
            indicator_name: format!("Indicator {indicator}"),
            project_id: project,
            project_name: format!("Project {project}"),
            organization_id: 1,
            organization_name: "Org".to_string(),
            period_start: "2024-01-01".to_string(),
            period_end: "2024-01-31".to_string(),
            value,
            notes: String::new(),
        }
    }

    #[test]
    fn test_snapshot_rows_indicator_grouping_sorted_desc() {
        let rows = vec![
            row(1, 1, json!(2)),
            row(2, 1, json!(10)),
            row(1, 1, json!({"total": 3})),
        ];
        let cached = snapshot_rows("indicator", &rows);
        let cached = cached.as_array().unwrap();
        assert_eq!(cached.len(), 2);
        assert_eq!(cached[0]["indicator_id"], json!(2));
        assert_eq!(cached[0]["total_value"], json!(10.0));
        assert_eq!(cached[0]["entries"], json!(1));
        assert_eq!(cached[1]["indicator_id"], json!(1));
        assert_eq!(cached[1]["total_value"], json!(5.0));
        assert_eq!(cached[1]["entries"], json!(2));
    }

    #[test]
    fn test_snapshot_rows_project_grouping() {
        let rows = vec![row(1, 7, json!(4)), row(2, 7, json!(1)), row(1, 8, json!(9))];
        let cached = snapshot_rows("project", &rows);
        let cached = cached.as_array().unwrap();
        assert_eq!(cached.len(), 2);
        assert_eq!(cached[0]["project_id"], json!(8));
        assert_eq!(cached[1]["project_id"], json!(7));
        assert_eq!(cached[1]["total_value"], json!(5.0));
    }

    #[test]
    fn test_snapshot_rows_custom_is_flat() {
        let rows = vec![row(1, 1, json!({"male": 2, "female": 3}))];
        let cached = snapshot_rows("custom", &rows);
        let cached = cached.as_array().unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0]["value"], json!(5.0));
        assert_eq!(cached[0]["organization_name"], json!("Org"));
        assert_eq!(cached[0]["period_start"], json!("2024-01-01"));
    }

    async fn seed_report(db: &Database, report_type: &str, parameters: Value) -> i64 {
        let report_type = report_type.to_string();
        db.writer()
            .call(move |conn| {
                repository::upsert_organization(conn, "Org A", "ORG-A", "district", None)?;
                repository::upsert_organization(conn, "Org B", "ORG-B", "district", None)?;
                repository::upsert_indicator(conn, "People reached", "IND-X", "number", "people")?;
                repository::upsert_indicator(conn, "Sessions held", "IND-Y", "number", "sessions")?;
                repository::upsert_project(conn, "Outreach", "PRJ-1", "active")?;
                for (indicator, org, value) in
                    [(1, 1, json!(5)), (2, 1, json!(8)), (1, 2, json!({"total": 2}))]
                {
                    repository::insert_aggregate(
                        conn,
                        &NewAggregate {
                            indicator_id: indicator,
                            project_id: 1,
                            org_id: org,
                            period_start: "2024-02-01".to_string(),
                            period_end: "2024-02-29".to_string(),
                            value,
                            notes: String::new(),
                            created_by: None,
                        },
                    )?;
                }
                repository::insert_report(
                    conn,
                    "Quarterly Outreach",
                    "",
                    &report_type,
                    &parameters,
                    None,
                    false,
                    Some("analyst"),
                )
            })
            .await
            .map_err(crate::error::Error::from)
            .unwrap()
    }

    #[tokio::test]
    async fn test_generate_indicator_report() {
        let db = Database::open_memory().await.unwrap();
        let id = seed_report(&db, "indicator", json!({})).await;

        let report = generate(&db, id, &AccessPolicy::Admin).await.unwrap();
        assert!(report.last_generated.is_some());
        let rows = report.cached_data.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        // Indicator 2 (total 8) sorts above indicator 1 (5 + 2 = 7).
        assert_eq!(rows[0]["indicator_id"], json!(2));
        assert_eq!(rows[1]["total_value"], json!(7.0));
    }

    #[tokio::test]
    async fn test_generate_respects_scope() {
        let db = Database::open_memory().await.unwrap();
        let id = seed_report(&db, "indicator", json!({})).await;

        let report = generate(&db, id, &AccessPolicy::ScopedToOrg(2)).await.unwrap();
        let rows = report.cached_data.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["indicator_id"], json!(1));
        assert_eq!(rows[0]["total_value"], json!(2.0));
    }

    #[tokio::test]
    async fn test_generate_overwrites_previous_snapshot() {
        let db = Database::open_memory().await.unwrap();
        let id = seed_report(&db, "indicator", json!({})).await;

        let wide = generate(&db, id, &AccessPolicy::Admin).await.unwrap();
        assert_eq!(wide.cached_data.as_array().unwrap().len(), 2);
        let narrow = generate(&db, id, &AccessPolicy::ScopedToOrg(2)).await.unwrap();
        assert_eq!(narrow.cached_data.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_generate_applies_parameter_filters() {
        let db = Database::open_memory().await.unwrap();
        let id = seed_report(&db, "custom", json!({"organization": 1, "indicator_ids": [1]})).await;

        let report = generate(&db, id, &AccessPolicy::Admin).await.unwrap();
        let rows = report.cached_data.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["value"], json!(5.0));
    }

    #[tokio::test]
    async fn test_generate_missing_report() {
        let db = Database::open_memory().await.unwrap();
        let err = generate(&db, 42, &AccessPolicy::Admin).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_download_uses_cached_rows_without_recompute() {
        let db = Database::open_memory().await.unwrap();
        let id = seed_report(&db, "indicator", json!({})).await;

        // Nothing generated yet: cached_data is an object, so no rows.
        let export = download(&db, id, None).await.unwrap();
        assert_eq!(export.filename, "quarterly-outreach.csv");
        assert_eq!(export.content, "No data\n");

        generate(&db, id, &AccessPolicy::Admin).await.unwrap();
        let export = download(&db, id, None).await.unwrap();
        assert!(export.content.starts_with(
            "indicator_id,indicator_code,indicator_name,total_value,entries\n"
        ));
        assert!(export.content.contains("2,IND-Y,Sessions held,8.0,1\n"));
    }

    #[tokio::test]
    async fn test_download_xlsx_falls_back_to_csv() {
        let db = Database::open_memory().await.unwrap();
        let id = seed_report(&db, "indicator", json!({})).await;
        let export = download(&db, id, Some("xlsx")).await.unwrap();
        assert_eq!(export.filename, "quarterly-outreach.csv");
        assert_eq!(export.content_type, "text/csv");
    }
}

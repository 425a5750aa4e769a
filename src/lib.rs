pub mod access;
pub mod date_util;
pub mod error;
pub mod export;
pub mod hierarchy;
pub mod query;
pub mod reports;
pub mod schedule;
pub mod storage;
pub mod trends;
pub mod value;

pub use access::{AccessPolicy, Caller, Role};
pub use error::{Error, Result};
pub use export::{ExportFormat, ReportExport};
pub use hierarchy::OrgHierarchy;
pub use query::{AggregateFilter, MonthBuckets};
pub use reports::{Report, ReportParameters};
pub use schedule::{Frequency, NewScheduledReport, ScheduledReport};
pub use storage::Database;
pub use trends::{IndicatorSeries, IndicatorSummary, TrendOptions, TrendSeries};
pub use value::{extract_total, MeasureValue};

// Re-export repository types needed by the binary crate, but not the module itself
pub use storage::repository::{NewAggregate, OrgRow, WarehouseStatus};

use serde::Deserialize;
use serde_json::Value;
use storage::repository;

/// One item of a bulk ingestion request. Identifier fields are optional at
/// the wire level so validation can report what's missing.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkItem {
    pub indicator: Option<i64>,
    pub value: Value,
    #[serde(default)]
    pub notes: Option<String>,
}

/// A bulk ingestion request: shared project/organization/period, one value
/// per indicator.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkIngest {
    pub project: Option<i64>,
    pub organization: Option<i64>,
    pub period_start: Option<String>,
    pub period_end: Option<String>,
    #[serde(default)]
    pub data: Vec<BulkItem>,
}

/// Main entry point for the aggregate data warehouse.
pub struct AggDW {
    db: Database,
}

impl AggDW {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    // ── Trends ─────────────────────────────────────────────────────

    pub async fn indicator_trend(
        &self,
        indicator_id: i64,
        options: &TrendOptions,
        caller: &Caller,
    ) -> Result<TrendSeries> {
        let policy = AccessPolicy::for_caller(caller);
        trends::indicator_trend(&self.db, indicator_id, options, &policy).await
    }

    /// Bulk trends from a delimited id list. Non-numeric entries are dropped;
    /// an empty remainder returns an empty series list.
    pub async fn indicator_trends_bulk(
        &self,
        ids_param: &str,
        options: &TrendOptions,
        caller: &Caller,
    ) -> Result<Vec<IndicatorSeries>> {
        let ids = trends::parse_indicator_ids(ids_param);
        let policy = AccessPolicy::for_caller(caller);
        trends::indicator_trends_bulk(&self.db, &ids, options, &policy).await
    }

    pub async fn indicator_summary(
        &self,
        options: &TrendOptions,
        caller: &Caller,
    ) -> Result<Vec<IndicatorSummary>> {
        let policy = AccessPolicy::for_caller(caller);
        trends::indicator_summary(&self.db, options, &policy).await
    }

    // ── Reports ────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_report(
        &self,
        name: &str,
        description: &str,
        report_type: &str,
        parameters: Value,
        org_id: Option<i64>,
        is_public: bool,
        created_by: Option<&str>,
    ) -> Result<Report> {
        let name = name.to_string();
        let description = description.to_string();
        let report_type = report_type.to_string();
        let created_by = created_by.map(|s| s.to_string());
        let report_id = self
            .db
            .writer()
            .call(move |conn| {
                repository::insert_report(
                    conn,
                    &name,
                    &description,
                    &report_type,
                    &parameters,
                    org_id,
                    is_public,
                    created_by.as_deref(),
                )
            })
            .await?;
        self.db
            .reader()
            .call(move |conn| repository::get_report(conn, report_id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("report {report_id}")))
    }

    /// Recompute and cache a report's snapshot under the caller's scope.
    pub async fn generate_report(&self, report_id: i64, caller: &Caller) -> Result<Report> {
        let policy = AccessPolicy::for_caller(caller);
        reports::generate(&self.db, report_id, &policy).await
    }

    /// Render the cached snapshot as a file download. No recomputation.
    pub async fn download_report(
        &self,
        report_id: i64,
        format: Option<&str>,
    ) -> Result<ReportExport> {
        reports::download(&self.db, report_id, format).await
    }

    /// Reports the caller may see: all for admins, otherwise own-org,
    /// public, and self-created ones.
    pub async fn list_reports(
        &self,
        caller: &Caller,
        username: Option<&str>,
    ) -> Result<Vec<Report>> {
        let admin = caller.role == Role::Admin;
        let org_id = caller.organization_id;
        let username = username.map(|s| s.to_string());
        self.db
            .reader()
            .call(move |conn| {
                repository::list_reports_visible(conn, admin, org_id, username.as_deref())
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    // ── Scheduled reports ──────────────────────────────────────────

    pub async fn create_scheduled_report(
        &self,
        new: NewScheduledReport,
    ) -> Result<ScheduledReport> {
        schedule::create(&self.db, new).await
    }

    pub async fn list_scheduled_reports(&self) -> Result<Vec<ScheduledReport>> {
        schedule::list(&self.db).await
    }

    pub async fn due_scheduled_reports(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<ScheduledReport>> {
        schedule::due(&self.db, now).await
    }

    pub async fn mark_scheduled_run(
        &self,
        schedule_id: i64,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<ScheduledReport> {
        schedule::mark_run(&self.db, schedule_id, now).await
    }

    // ── Ingestion ──────────────────────────────────────────────────

    /// Insert one measurement record.
    pub async fn ingest_one(&self, agg: NewAggregate) -> Result<i64> {
        validate_period(&agg.period_start, &agg.period_end)?;
        self.db
            .writer()
            .call(move |conn| repository::insert_aggregate(conn, &agg))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    /// Bulk ingestion: all identifiers validated up front, then every record
    /// commits in one transaction or none does.
    pub async fn ingest_bulk(
        &self,
        request: BulkIngest,
        created_by: Option<&str>,
    ) -> Result<Vec<i64>> {
        let project_id = request
            .project
            .ok_or_else(|| Error::Validation("project required".to_string()))?;
        let org_id = request
            .organization
            .ok_or_else(|| Error::Validation("organization required".to_string()))?;
        let period_start = request
            .period_start
            .ok_or_else(|| Error::Validation("period_start required".to_string()))?;
        let period_end = request
            .period_end
            .ok_or_else(|| Error::Validation("period_end required".to_string()))?;
        if request.data.is_empty() {
            return Err(Error::Validation("data list required".to_string()));
        }
        validate_period(&period_start, &period_end)?;

        let created_by = created_by.map(|s| s.to_string());
        let mut aggs = Vec::with_capacity(request.data.len());
        for item in &request.data {
            let indicator_id = item
                .indicator
                .ok_or_else(|| Error::Validation("indicator required for every item".to_string()))?;
            aggs.push(NewAggregate {
                indicator_id,
                project_id,
                org_id,
                period_start: period_start.clone(),
                period_end: period_end.clone(),
                value: item.value.clone(),
                notes: item.notes.clone().unwrap_or_default(),
                created_by: created_by.clone(),
            });
        }

        self.db
            .writer()
            .call(move |conn| repository::bulk_insert_aggregates(conn, &aggs))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    // ── Organizations ──────────────────────────────────────────────

    pub async fn org_hierarchy(&self) -> Result<OrgHierarchy> {
        let rows = self
            .db
            .reader()
            .call(|conn| repository::org_adjacency(conn))
            .await?;
        Ok(OrgHierarchy::from_rows(rows))
    }

    /// Organization listing under the management visibility rule: admins see
    /// all; a scoped caller sees their org, its descendants, and its
    /// ancestors; an unassigned caller sees nothing.
    pub async fn visible_organizations(&self, caller: &Caller) -> Result<Vec<OrgRow>> {
        if caller.role == Role::Admin {
            return self
                .db
                .reader()
                .call(|conn| repository::list_organizations(conn, None))
                .await
                .map_err(|e| Error::Database(e.to_string()));
        }
        let Some(org_id) = caller.organization_id else {
            return Ok(Vec::new());
        };
        let hierarchy = self.org_hierarchy().await?;
        let visible = hierarchy.visible_set(org_id);
        self.db
            .reader()
            .call(move |conn| repository::list_organizations(conn, Some(visible.as_slice())))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn org_descendants(&self, org_id: i64) -> Result<Vec<OrgRow>> {
        let hierarchy = self.org_hierarchy().await?;
        let ids = hierarchy.descendants(org_id);
        self.db
            .reader()
            .call(move |conn| repository::list_organizations(conn, Some(ids.as_slice())))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    // ── Export / status ────────────────────────────────────────────

    /// Scoped raw-record CSV export.
    pub async fn export_aggregates(
        &self,
        options: &TrendOptions,
        caller: &Caller,
    ) -> Result<String> {
        let policy = AccessPolicy::for_caller(caller);
        let mut filter = AggregateFilter::new().scoped(&policy);
        if let Some(org) = options.organization {
            filter = filter.organization(org);
        }
        if let Some(project) = options.project {
            filter = filter.project(project);
        }
        if let Some(ref from) = options.date_from {
            filter = filter.period_start_gte(from);
        }
        if let Some(ref to) = options.date_to {
            filter = filter.period_end_lte(to);
        }
        let rows = filter.fetch(&self.db).await?;
        Ok(export::render_aggregates_csv(&rows))
    }

    pub async fn status(&self) -> Result<WarehouseStatus> {
        self.db
            .reader()
            .call(|conn| repository::warehouse_status(conn))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}

fn validate_period(period_start: &str, period_end: &str) -> Result<()> {
    let start = date_util::parse_iso_date(period_start)?;
    let end = date_util::parse_iso_date(period_end)?;
    if start > end {
        return Err(Error::InvalidRange(
            "period_start must be before period_end".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seed_dimensions(db: &Database) {
        db.writer()
            .call(|conn| {
                let hq = repository::upsert_organization(conn, "HQ", "HQ", "headquarters", None)?;
                let region =
                    repository::upsert_organization(conn, "North Region", "NR", "regional", Some(hq))?;
                repository::upsert_organization(conn, "North District", "ND", "district", Some(region))?;
                repository::upsert_organization(conn, "Partner", "PT", "partner", None)?;
                repository::upsert_indicator(conn, "People reached", "IND-X", "number", "people")?;
                repository::upsert_project(conn, "Outreach", "PRJ-1", "active")?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    fn bulk_request(items: Vec<BulkItem>) -> BulkIngest {
        BulkIngest {
            project: Some(1),
            organization: Some(1),
            period_start: Some("2024-01-01".to_string()),
            period_end: Some("2024-01-31".to_string()),
            data: items,
        }
    }

    fn item(indicator: Option<i64>, value: Value) -> BulkItem {
        BulkItem { indicator, value, notes: None }
    }

    #[tokio::test]
    async fn test_ingest_bulk_commits_all() {
        let dw = AggDW::new(Database::open_memory().await.unwrap());
        seed_dimensions(dw.db()).await;

        let ids = dw
            .ingest_bulk(bulk_request(vec![item(Some(1), json!(5))]), Some("officer"))
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(dw.status().await.unwrap().aggregates, 1);
    }

    #[tokio::test]
    async fn test_ingest_bulk_missing_identifiers_fail_before_writes() {
        let dw = AggDW::new(Database::open_memory().await.unwrap());
        seed_dimensions(dw.db()).await;

        let mut request = bulk_request(vec![item(Some(1), json!(5))]);
        request.organization = None;
        assert!(matches!(
            dw.ingest_bulk(request, None).await.unwrap_err(),
            Error::Validation(_)
        ));

        let request = bulk_request(vec![item(Some(1), json!(5)), item(None, json!(2))]);
        assert!(matches!(
            dw.ingest_bulk(request, None).await.unwrap_err(),
            Error::Validation(_)
        ));
        assert_eq!(dw.status().await.unwrap().aggregates, 0);
    }

    #[tokio::test]
    async fn test_ingest_bulk_rolls_back_on_constraint_violation() {
        let dw = AggDW::new(Database::open_memory().await.unwrap());
        seed_dimensions(dw.db()).await;

        // Two items for the same indicator in the same period hit the
        // uniqueness tuple; the whole batch must vanish.
        let request = bulk_request(vec![item(Some(1), json!(5)), item(Some(1), json!(9))]);
        assert!(dw.ingest_bulk(request, None).await.is_err());
        assert_eq!(dw.status().await.unwrap().aggregates, 0);
    }

    #[tokio::test]
    async fn test_ingest_one_validates_period_order() {
        let dw = AggDW::new(Database::open_memory().await.unwrap());
        seed_dimensions(dw.db()).await;

        let agg = NewAggregate {
            indicator_id: 1,
            project_id: 1,
            org_id: 1,
            period_start: "2024-02-01".to_string(),
            period_end: "2024-01-01".to_string(),
            value: json!(1),
            notes: String::new(),
            created_by: None,
        };
        assert!(matches!(
            dw.ingest_one(agg).await.unwrap_err(),
            Error::InvalidRange(_)
        ));
    }

    #[tokio::test]
    async fn test_visible_organizations_by_role() {
        let dw = AggDW::new(Database::open_memory().await.unwrap());
        seed_dimensions(dw.db()).await;

        let all = dw.visible_organizations(&Caller::admin()).await.unwrap();
        assert_eq!(all.len(), 4);

        // Region caller sees itself, its district, and HQ, but not the partner.
        let region_caller = Caller::scoped(Role::Manager, 2);
        let visible = dw.visible_organizations(&region_caller).await.unwrap();
        let codes: Vec<&str> = visible.iter().map(|o| o.code.as_str()).collect();
        assert_eq!(codes, vec!["HQ", "ND", "NR"]);

        let unassigned = Caller { role: Role::Officer, organization_id: None };
        assert!(dw.visible_organizations(&unassigned).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_org_descendants() {
        let dw = AggDW::new(Database::open_memory().await.unwrap());
        seed_dimensions(dw.db()).await;

        let descendants = dw.org_descendants(1).await.unwrap();
        let codes: Vec<&str> = descendants.iter().map(|o| o.code.as_str()).collect();
        assert_eq!(codes, vec!["ND", "NR"]);
    }

    #[tokio::test]
    async fn test_export_aggregates_scoped() {
        let dw = AggDW::new(Database::open_memory().await.unwrap());
        seed_dimensions(dw.db()).await;
        dw.ingest_bulk(bulk_request(vec![item(Some(1), json!(5))]), None)
            .await
            .unwrap();

        let csv = dw
            .export_aggregates(&TrendOptions::default(), &Caller::admin())
            .await
            .unwrap();
        assert!(csv.starts_with("indicator,indicator_code,project,organization,"));
        assert!(csv.contains("People reached,IND-X,Outreach,HQ,2024-01-01,2024-01-31,5,"));

        let outsider = Caller::scoped(Role::Officer, 4);
        let csv = dw
            .export_aggregates(&TrendOptions::default(), &outsider)
            .await
            .unwrap();
        assert_eq!(csv.lines().count(), 1); // header only
    }

    #[tokio::test]
    async fn test_report_visibility_listing() {
        let dw = AggDW::new(Database::open_memory().await.unwrap());
        seed_dimensions(dw.db()).await;

        dw.create_report("Org report", "", "indicator", json!({}), Some(2), false, Some("a"))
            .await
            .unwrap();
        dw.create_report("Public report", "", "custom", json!({}), None, true, Some("b"))
            .await
            .unwrap();
        dw.create_report("Private report", "", "custom", json!({}), None, false, Some("c"))
            .await
            .unwrap();

        let admin_sees = dw.list_reports(&Caller::admin(), None).await.unwrap();
        assert_eq!(admin_sees.len(), 3);

        let caller = Caller::scoped(Role::Officer, 2);
        let visible = dw.list_reports(&caller, Some("c")).await.unwrap();
        let names: Vec<&str> = visible.iter().map(|r| r.name.as_str()).collect();
        assert!(names.contains(&"Org report"));
        assert!(names.contains(&"Public report"));
        assert!(names.contains(&"Private report"));

        let visible = dw.list_reports(&caller, None).await.unwrap();
        assert_eq!(visible.len(), 2);
    }
}

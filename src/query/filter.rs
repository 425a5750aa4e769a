use serde::Serialize;
use serde_json::Value;

use crate::access::AccessPolicy;
use crate::error::Result;
use crate::storage::Database;

/// A measurement record as fetched from the store, with its indicator,
/// project, and organization linkage resolved to names.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateRow {
    pub aggregate_id: i64,
    pub indicator_id: i64,
    pub indicator_code: String,
    pub indicator_name: String,
    pub project_id: i64,
    pub project_name: String,
    pub organization_id: i64,
    pub organization_name: String,
    pub period_start: String,
    pub period_end: String,
    pub value: Value,
    pub notes: String,
}

/// Builder for record queries: any combination of indicator (or indicator
/// set), project, organization, period bounds, and the caller's access
/// clause. The access clause is kept separate from an explicit organization
/// filter so both apply: a scoped caller filtering on another org gets the
/// empty intersection, not an override.
#[derive(Debug, Clone, Default)]
pub struct AggregateFilter {
    indicator_id: Option<i64>,
    indicator_ids: Option<Vec<i64>>,
    project_id: Option<i64>,
    organization_id: Option<i64>,
    scope_org_id: Option<i64>,
    period_start_gte: Option<String>,
    period_end_lte: Option<String>,
    period_start_floor: Option<String>,
    deny_all: bool,
}

impl AggregateFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn indicator(mut self, id: i64) -> Self {
        self.indicator_id = Some(id);
        self
    }

    pub fn indicators(mut self, ids: &[i64]) -> Self {
        self.indicator_ids = Some(ids.to_vec());
        self
    }

    pub fn project(mut self, id: i64) -> Self {
        self.project_id = Some(id);
        self
    }

    pub fn organization(mut self, id: i64) -> Self {
        self.organization_id = Some(id);
        self
    }

    /// Records starting on or after this date (caller-supplied bound).
    pub fn period_start_gte(mut self, date: &str) -> Self {
        self.period_start_gte = Some(date.to_string());
        self
    }

    /// Records ending on or before this date (caller-supplied bound).
    pub fn period_end_lte(mut self, date: &str) -> Self {
        self.period_end_lte = Some(date.to_string());
        self
    }

    /// Additional floor on period_start, used to discard records older than
    /// the earliest bucket. Applies alongside any caller-supplied bound.
    pub fn period_start_floor(mut self, date: &str) -> Self {
        self.period_start_floor = Some(date.to_string());
        self
    }

    /// Narrow the query to what the caller's access policy admits.
    pub fn scoped(mut self, policy: &AccessPolicy) -> Self {
        match policy {
            AccessPolicy::Admin => {}
            AccessPolicy::ScopedToOrg(org_id) => self.scope_org_id = Some(*org_id),
            AccessPolicy::NoAccess => self.deny_all = true,
        }
        self
    }

    /// Fetch matching rows, ordered by period_start then id for determinism.
    /// A `NoAccess` scope returns the empty set without touching the store.
    pub async fn fetch(self, db: &Database) -> Result<Vec<AggregateRow>> {
        if self.deny_all {
            return Ok(Vec::new());
        }
        let filter = self;
        db.reader()
            .call(move |conn| filter.fetch_sync(conn))
            .await
            .map_err(|e| crate::error::Error::Database(e.to_string()))
    }

    pub(crate) fn fetch_sync(
        &self,
        conn: &rusqlite::Connection,
    ) -> std::result::Result<Vec<AggregateRow>, rusqlite::Error> {
        if self.deny_all {
            return Ok(Vec::new());
        }
        let (sql, params) = self.build_sql();
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            let raw: String = row.get(10)?;
            Ok(AggregateRow {
                aggregate_id: row.get(0)?,
                indicator_id: row.get(1)?,
                indicator_code: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                indicator_name: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                project_id: row.get(4)?,
                project_name: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                organization_id: row.get(6)?,
                organization_name: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
                period_start: row.get(8)?,
                period_end: row.get(9)?,
                value: serde_json::from_str(&raw).unwrap_or(Value::Null),
                notes: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
            })
        })?;
        rows.collect()
    }

    fn build_sql(&self) -> (String, Vec<Box<dyn rusqlite::types::ToSql>>) {
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        let mut wheres: Vec<String> = Vec::new();
        let mut param_idx = 1;

        let select = "SELECT a.aggregate_id, a.indicator_id, i.code, i.name,
                a.project_id, p.name, a.org_id, o.name,
                a.period_start, a.period_end, a.value, a.notes
            FROM aggregates a
            LEFT JOIN indicators i ON i.indicator_id = a.indicator_id
            LEFT JOIN projects p ON p.project_id = a.project_id
            LEFT JOIN organizations o ON o.org_id = a.org_id";

        if let Some(id) = self.indicator_id {
            wheres.push(format!("a.indicator_id = ?{param_idx}"));
            params.push(Box::new(id));
            param_idx += 1;
        }

        if let Some(ref ids) = self.indicator_ids {
            // Empty set matches nothing, same as an IN () that can't be expressed.
            if ids.is_empty() {
                wheres.push("1 = 0".to_string());
            } else {
                let placeholders: Vec<String> = (0..ids.len())
                    .map(|offset| format!("?{}", param_idx + offset))
                    .collect();
                wheres.push(format!("a.indicator_id IN ({})", placeholders.join(",")));
                for id in ids {
                    params.push(Box::new(*id));
                }
                param_idx += ids.len();
            }
        }

        if let Some(id) = self.project_id {
            wheres.push(format!("a.project_id = ?{param_idx}"));
            params.push(Box::new(id));
            param_idx += 1;
        }

        if let Some(id) = self.organization_id {
            wheres.push(format!("a.org_id = ?{param_idx}"));
            params.push(Box::new(id));
            param_idx += 1;
        }

        if let Some(id) = self.scope_org_id {
            wheres.push(format!("a.org_id = ?{param_idx}"));
            params.push(Box::new(id));
            param_idx += 1;
        }

        if let Some(ref date) = self.period_start_gte {
            wheres.push(format!("a.period_start >= ?{param_idx}"));
            params.push(Box::new(date.clone()));
            param_idx += 1;
        }

        if let Some(ref date) = self.period_end_lte {
            wheres.push(format!("a.period_end <= ?{param_idx}"));
            params.push(Box::new(date.clone()));
            param_idx += 1;
        }

        if let Some(ref date) = self.period_start_floor {
            wheres.push(format!("a.period_start >= ?{param_idx}"));
            params.push(Box::new(date.clone()));
            // param_idx += 1; // last clause
        }

        let mut sql = select.to_string();
        if !wheres.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&wheres.join(" AND "));
        }
        sql.push_str(" ORDER BY a.period_start, a.aggregate_id");

        (sql, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_sql_default() {
        let (sql, params) = AggregateFilter::new().build_sql();
        assert!(sql.contains("FROM aggregates a"));
        assert!(!sql.contains("WHERE"));
        assert!(sql.contains("ORDER BY a.period_start"));
        assert!(params.is_empty());
    }

    #[test]
    fn test_build_sql_with_filters() {
        let (sql, params) = AggregateFilter::new()
            .indicator(3)
            .project(1)
            .period_start_gte("2024-01-01")
            .build_sql();
        assert!(sql.contains("a.indicator_id = ?1"));
        assert!(sql.contains("a.project_id = ?2"));
        assert!(sql.contains("a.period_start >= ?3"));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_build_sql_indicator_set() {
        let (sql, params) = AggregateFilter::new().indicators(&[1, 2, 3]).build_sql();
        assert!(sql.contains("a.indicator_id IN (?1,?2,?3)"));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_build_sql_empty_indicator_set_matches_nothing() {
        let (sql, params) = AggregateFilter::new().indicators(&[]).build_sql();
        assert!(sql.contains("1 = 0"));
        assert!(params.is_empty());
    }

    #[test]
    fn test_scope_adds_clause_alongside_org_filter() {
        let (sql, params) = AggregateFilter::new()
            .organization(5)
            .scoped(&AccessPolicy::ScopedToOrg(9))
            .build_sql();
        assert!(sql.contains("a.org_id = ?1"));
        assert!(sql.contains("a.org_id = ?2"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_admin_scope_adds_nothing() {
        let (sql, _) = AggregateFilter::new().scoped(&AccessPolicy::Admin).build_sql();
        assert!(!sql.contains("WHERE"));
    }

    #[test]
    fn test_floor_and_user_bound_both_apply() {
        let (sql, params) = AggregateFilter::new()
            .period_start_gte("2024-03-01")
            .period_start_floor("2024-01-01")
            .build_sql();
        assert!(sql.contains("a.period_start >= ?1"));
        assert!(sql.contains("a.period_start >= ?2"));
        assert_eq!(params.len(), 2);
    }
}

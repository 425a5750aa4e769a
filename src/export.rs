use serde_json::Value;

use crate::query::filter::AggregateRow;

/// Requested download format. Only CSV has a compiled-in writer; spreadsheet
/// requests resolve to CSV the way the reference deployment falls back when
/// its optional spreadsheet library is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Xlsx,
}

impl ExportFormat {
    /// Anything other than a recognized spreadsheet selector is CSV.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "xlsx" | "excel" => ExportFormat::Xlsx,
            _ => ExportFormat::Csv,
        }
    }

    /// The format actually produced.
    pub fn effective(self) -> Self {
        match self {
            ExportFormat::Xlsx => {
                log::warn!("xlsx export not available; falling back to csv");
                ExportFormat::Csv
            }
            other => other,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Xlsx => "xlsx",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Xlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
        }
    }
}

/// A rendered file download.
#[derive(Debug, Clone)]
pub struct ReportExport {
    pub filename: String,
    pub content_type: &'static str,
    pub content: String,
}

/// Lowercase, alphanumeric runs joined by single hyphens.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_hyphen = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    slug
}

/// Interpret cached report data as a sequence of uniform rows. Anything that
/// is not an array of objects renders as no rows.
pub fn cached_rows(cached_data: &Value) -> Vec<&serde_json::Map<String, Value>> {
    match cached_data {
        Value::Array(items) => items.iter().filter_map(|item| item.as_object()).collect(),
        _ => Vec::new(),
    }
}

/// Render uniform rows to CSV. Headers come from the first row's keys, in
/// stored order; missing keys in later rows render empty.
pub fn render_csv(rows: &[&serde_json::Map<String, Value>]) -> String {
    let mut out = String::new();
    let Some(first) = rows.first() else {
        out.push_str("No data\n");
        return out;
    };
    let headers: Vec<&String> = first.keys().collect();
    out.push_str(
        &headers
            .iter()
            .map(|h| csv_escape(h))
            .collect::<Vec<_>>()
            .join(","),
    );
    out.push('\n');
    for row in rows {
        let line = headers
            .iter()
            .map(|key| csv_escape(&cell_text(row.get(key.as_str()))))
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// Render raw measurement records to CSV, names denormalized and the stored
/// value passed through as JSON.
pub fn render_aggregates_csv(rows: &[AggregateRow]) -> String {
    let mut out = String::new();
    out.push_str("indicator,indicator_code,project,organization,period_start,period_end,value,notes\n");
    for row in rows {
        out.push_str(&format!(
            "{},{},{},{},{},{},{},{}\n",
            csv_escape(&row.indicator_name),
            csv_escape(&row.indicator_code),
            csv_escape(&row.project_name),
            csv_escape(&row.organization_name),
            csv_escape(&row.period_start),
            csv_escape(&row.period_end),
            csv_escape(&row.value.to_string()),
            csv_escape(&row.notes),
        ));
    }
    out
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_format() {
        assert_eq!(ExportFormat::parse("csv"), ExportFormat::Csv);
        assert_eq!(ExportFormat::parse("XLSX"), ExportFormat::Xlsx);
        assert_eq!(ExportFormat::parse("excel"), ExportFormat::Xlsx);
        assert_eq!(ExportFormat::parse("pdf"), ExportFormat::Csv);
    }

    #[test]
    fn test_xlsx_falls_back_to_csv() {
        assert_eq!(ExportFormat::Xlsx.effective(), ExportFormat::Csv);
        assert_eq!(ExportFormat::Csv.effective(), ExportFormat::Csv);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Quarterly Outreach Report"), "quarterly-outreach-report");
        assert_eq!(slugify("  HIV/AIDS -- 2024  "), "hiv-aids-2024");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn test_cached_rows_non_list_is_empty() {
        assert!(cached_rows(&json!({"a": 1})).is_empty());
        assert!(cached_rows(&json!(null)).is_empty());
        assert_eq!(cached_rows(&json!([{"a": 1}, {"a": 2}])).len(), 2);
        // Non-object entries are dropped rather than erroring.
        assert_eq!(cached_rows(&json!([{"a": 1}, 7])).len(), 1);
    }

    #[test]
    fn test_render_csv_headers_from_first_row() {
        let data = json!([
            {"name": "A", "total": 3.0},
            {"name": "B, Inc", "total": null}
        ]);
        let rows = cached_rows(&data);
        let csv = render_csv(&rows);
        assert_eq!(csv, "name,total\nA,3.0\n\"B, Inc\",\n");
    }

    #[test]
    fn test_render_csv_empty() {
        assert_eq!(render_csv(&[]), "No data\n");
    }

    #[test]
    fn test_csv_escape() {
        assert_eq!(csv_escape("hello"), "hello");
        assert_eq!(csv_escape("hello,world"), "\"hello,world\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}

use clap::{Parser, Subcommand};

use aggdw::{AggDW, BulkIngest, Caller, NewScheduledReport, Role, TrendOptions};

#[derive(Parser)]
#[command(name = "aggdw", about = "Aggregate data warehouse CLI")]
struct Cli {
    /// Database path (default: ~/.aggdw/aggdw.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Acting role: admin, manager, officer, client
    #[arg(long, default_value = "admin")]
    role: String,

    /// Acting caller's organization id (required for scoped roles to see data)
    #[arg(long)]
    caller_org: Option<i64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Monthly trend series for one indicator
    Trends {
        /// Indicator id
        indicator_id: i64,
        /// Rolling window size in months (ignored when both dates given)
        #[arg(long, default_value = "12")]
        months: u32,
        /// Filter by organization id
        #[arg(long)]
        organization: Option<i64>,
        /// Filter by project id
        #[arg(long)]
        project: Option<i64>,
        /// Range start (YYYY-MM-DD)
        #[arg(long)]
        date_from: Option<String>,
        /// Range end (YYYY-MM-DD)
        #[arg(long)]
        date_to: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Monthly trend series for a comma-separated indicator id list
    TrendsBulk {
        /// Indicator ids, e.g. "1,2,3" (non-numeric entries are dropped)
        indicator_ids: String,
        #[arg(long, default_value = "12")]
        months: u32,
        #[arg(long)]
        organization: Option<i64>,
        #[arg(long)]
        project: Option<i64>,
        #[arg(long)]
        date_from: Option<String>,
        #[arg(long)]
        date_to: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Per-indicator totals over the visible record set
    Summary {
        #[arg(long)]
        date_from: Option<String>,
        #[arg(long)]
        date_to: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Export visible measurement records as CSV to stdout
    Export {
        #[arg(long)]
        organization: Option<i64>,
        #[arg(long)]
        project: Option<i64>,
        #[arg(long)]
        date_from: Option<String>,
        #[arg(long)]
        date_to: Option<String>,
    },
    /// Ingest measurement records from a bulk JSON file
    Ingest {
        /// JSON file: {"project": 1, "organization": 2, "period_start": ...,
        /// "period_end": ..., "data": [{"indicator": 3, "value": ...}, ...]}
        file: String,
        /// Recorded as created_by
        #[arg(long)]
        user: Option<String>,
    },
    /// Manage report definitions and snapshots
    Report {
        #[command(subcommand)]
        action: ReportAction,
    },
    /// Manage scheduled reports
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Manage organizations, indicators, and projects
    Dim {
        #[command(subcommand)]
        action: DimAction,
    },
    /// Show organization tree (visibility-scoped for non-admin callers)
    Orgs {
        #[arg(long)]
        json: bool,
    },
    /// Show warehouse status
    Status,
}

#[derive(Subcommand)]
enum ReportAction {
    /// Create a report definition
    Create {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Report type: indicator, project, or custom
        #[arg(long = "type", default_value = "custom")]
        report_type: String,
        /// Filter parameters as a JSON object
        #[arg(long, default_value = "{}")]
        parameters: String,
        #[arg(long)]
        organization: Option<i64>,
        #[arg(long)]
        public: bool,
        #[arg(long)]
        user: Option<String>,
    },
    /// Recompute and cache a report's snapshot
    Generate {
        report_id: i64,
        #[arg(long)]
        json: bool,
    },
    /// Write the cached snapshot to a file (or stdout)
    Download {
        report_id: i64,
        /// csv (default) or xlsx/excel (falls back to csv)
        #[arg(long)]
        format: Option<String>,
        /// Output path; defaults to the report's own filename
        #[arg(long)]
        out: Option<String>,
    },
    /// List visible reports
    List {
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Create a scheduled report
    Create {
        name: String,
        /// daily, weekly, monthly, or quarterly
        #[arg(long)]
        frequency: String,
        #[arg(long = "type", default_value = "custom")]
        report_type: String,
        #[arg(long, default_value = "{}")]
        parameters: String,
        /// Explicit first run (YYYY-MM-DD HH:MM:SS UTC); derived from the
        /// frequency when omitted
        #[arg(long)]
        next_run: Option<String>,
        #[arg(long)]
        user: Option<String>,
    },
    /// List all scheduled reports
    List {
        #[arg(long)]
        json: bool,
    },
    /// List schedules due now
    Due,
    /// Mark a schedule as run, advancing next_run
    MarkRun { schedule_id: i64 },
}

#[derive(Subcommand)]
enum DimAction {
    /// Add or update an organization
    OrgAdd {
        name: String,
        code: String,
        #[arg(long = "type", default_value = "district")]
        org_type: String,
        /// Parent organization id
        #[arg(long)]
        parent: Option<i64>,
    },
    /// Add or update an indicator
    IndicatorAdd {
        name: String,
        code: String,
        #[arg(long = "type", default_value = "number")]
        indicator_type: String,
        #[arg(long, default_value = "")]
        unit: String,
    },
    /// Add or update a project
    ProjectAdd {
        name: String,
        code: String,
        #[arg(long, default_value = "draft")]
        status: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => aggdw::Database::open_at(path).await?,
        None => aggdw::Database::open().await?,
    };
    let dw = AggDW::new(db);

    let role = Role::parse(&cli.role)
        .ok_or_else(|| anyhow::anyhow!("unknown role: {}", cli.role))?;
    let caller = Caller { role, organization_id: cli.caller_org };

    match cli.command {
        Commands::Status => {
            print_status(&dw).await?;
        }
        Commands::Trends {
            indicator_id,
            months,
            organization,
            project,
            date_from,
            date_to,
            json,
        } => {
            let options = TrendOptions { months, organization, project, date_from, date_to };
            let series = dw.indicator_trend(indicator_id, &options, &caller).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&series)?);
            } else {
                for point in &series.data {
                    println!("{:<10} {:>12.1}", point.month, point.value);
                }
                println!("trend: {}  forecast: {:.1}", series.trend, series.forecast);
            }
        }
        Commands::TrendsBulk {
            indicator_ids,
            months,
            organization,
            project,
            date_from,
            date_to,
            json,
        } => {
            let options = TrendOptions { months, organization, project, date_from, date_to };
            let series = dw
                .indicator_trends_bulk(&indicator_ids, &options, &caller)
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&series)?);
            } else if series.is_empty() {
                println!("No valid indicator ids.");
            } else {
                for entry in &series {
                    println!("{} ({})", entry.indicator_name, entry.indicator_id);
                    for point in &entry.data {
                        println!("  {:<10} {:>12.1}", point.month, point.value);
                    }
                }
            }
        }
        Commands::Summary { date_from, date_to, json } => {
            let options = TrendOptions { date_from, date_to, ..Default::default() };
            let summaries = dw.indicator_summary(&options, &caller).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else if summaries.is_empty() {
                println!("No visible records.");
            } else {
                for row in &summaries {
                    println!(
                        "{:<40} total {:>12.1} over {} periods",
                        row.indicator_name, row.total_value, row.period_count
                    );
                }
            }
        }
        Commands::Export { organization, project, date_from, date_to } => {
            let options = TrendOptions {
                organization,
                project,
                date_from,
                date_to,
                ..Default::default()
            };
            print!("{}", dw.export_aggregates(&options, &caller).await?);
        }
        Commands::Ingest { file, user } => {
            let raw = std::fs::read_to_string(&file)?;
            let request: BulkIngest = serde_json::from_str(&raw)?;
            let ids = dw.ingest_bulk(request, user.as_deref()).await?;
            println!("Ingested {} records.", ids.len());
        }
        Commands::Report { action } => {
            handle_report(&dw, &caller, action).await?;
        }
        Commands::Schedule { action } => {
            handle_schedule(&dw, action).await?;
        }
        Commands::Dim { action } => {
            handle_dim(&dw, action).await?;
        }
        Commands::Orgs { json } => {
            let orgs = dw.visible_organizations(&caller).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&orgs)?);
            } else if orgs.is_empty() {
                println!("No visible organizations.");
            } else {
                for org in &orgs {
                    let parent = org
                        .parent_id
                        .map(|p| format!(" (parent {p})"))
                        .unwrap_or_default();
                    println!("{:>4}  {:<30} {} [{}]{}", org.org_id, org.name, org.code, org.org_type, parent);
                }
            }
        }
    }

    Ok(())
}

async fn handle_report(dw: &AggDW, caller: &Caller, action: ReportAction) -> anyhow::Result<()> {
    match action {
        ReportAction::Create {
            name,
            description,
            report_type,
            parameters,
            organization,
            public,
            user,
        } => {
            let parameters: serde_json::Value = serde_json::from_str(&parameters)?;
            let report = dw
                .create_report(
                    &name,
                    &description,
                    &report_type,
                    parameters,
                    organization,
                    public,
                    user.as_deref(),
                )
                .await?;
            println!("Created report {} ({}).", report.report_id, report.report_type);
        }
        ReportAction::Generate { report_id, json } => {
            let report = dw.generate_report(report_id, caller).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let rows = report.cached_data.as_array().map_or(0, |a| a.len());
                println!(
                    "Generated report {} ({} rows) at {}.",
                    report.report_id,
                    rows,
                    report.last_generated.as_deref().unwrap_or("-")
                );
            }
        }
        ReportAction::Download { report_id, format, out } => {
            let export = dw.download_report(report_id, format.as_deref()).await?;
            match out {
                Some(path) => {
                    std::fs::write(&path, &export.content)?;
                    println!("Wrote {} ({}).", path, export.filename);
                }
                None => print!("{}", export.content),
            }
        }
        ReportAction::List { user, json } => {
            let reports = dw.list_reports(caller, user.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else if reports.is_empty() {
                println!("No visible reports.");
            } else {
                for report in &reports {
                    println!(
                        "{:>4}  {:<30} [{}] last generated {}",
                        report.report_id,
                        report.name,
                        report.report_type,
                        report.last_generated.as_deref().unwrap_or("never")
                    );
                }
            }
        }
    }
    Ok(())
}

async fn handle_schedule(dw: &AggDW, action: ScheduleAction) -> anyhow::Result<()> {
    match action {
        ScheduleAction::Create {
            name,
            frequency,
            report_type,
            parameters,
            next_run,
            user,
        } => {
            let parameters: serde_json::Value = serde_json::from_str(&parameters)?;
            let next_run = next_run
                .map(|s| {
                    chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                        .map(|dt| dt.and_utc())
                        .map_err(|e| anyhow::anyhow!("invalid next_run: {e}"))
                })
                .transpose()?;
            let schedule = dw
                .create_scheduled_report(NewScheduledReport {
                    report_name: name,
                    report_type,
                    parameters,
                    frequency,
                    recipients: serde_json::json!([]),
                    next_run,
                    created_by: user,
                })
                .await?;
            println!(
                "Scheduled {} ({}), next run {}.",
                schedule.report_name, schedule.frequency, schedule.next_run
            );
        }
        ScheduleAction::List { json } => {
            let schedules = dw.list_scheduled_reports().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&schedules)?);
            } else if schedules.is_empty() {
                println!("No scheduled reports.");
            } else {
                for s in &schedules {
                    let active = if s.is_active { "" } else { " (inactive)" };
                    println!(
                        "{:>4}  {:<30} {:<10} next {} last {}{}",
                        s.schedule_id,
                        s.report_name,
                        s.frequency,
                        s.next_run,
                        s.last_run.as_deref().unwrap_or("never"),
                        active
                    );
                }
            }
        }
        ScheduleAction::Due => {
            let due = dw.due_scheduled_reports(chrono::Utc::now()).await?;
            if due.is_empty() {
                println!("Nothing due.");
            } else {
                for s in &due {
                    println!("{:>4}  {:<30} due since {}", s.schedule_id, s.report_name, s.next_run);
                }
            }
        }
        ScheduleAction::MarkRun { schedule_id } => {
            let schedule = dw.mark_scheduled_run(schedule_id, chrono::Utc::now()).await?;
            println!("Marked run; next run {}.", schedule.next_run);
        }
    }
    Ok(())
}

async fn handle_dim(dw: &AggDW, action: DimAction) -> anyhow::Result<()> {
    use aggdw::storage::repository;

    match action {
        DimAction::OrgAdd { name, code, org_type, parent } => {
            let id = dw
                .db()
                .writer()
                .call(move |conn| {
                    repository::upsert_organization(conn, &name, &code, &org_type, parent)
                })
                .await?;
            println!("Organization {id}.");
        }
        DimAction::IndicatorAdd { name, code, indicator_type, unit } => {
            let id = dw
                .db()
                .writer()
                .call(move |conn| {
                    repository::upsert_indicator(conn, &name, &code, &indicator_type, &unit)
                })
                .await?;
            println!("Indicator {id}.");
        }
        DimAction::ProjectAdd { name, code, status } => {
            let id = dw
                .db()
                .writer()
                .call(move |conn| repository::upsert_project(conn, &name, &code, &status))
                .await?;
            println!("Project {id}.");
        }
    }
    Ok(())
}

async fn print_status(dw: &AggDW) -> anyhow::Result<()> {
    let status = dw.status().await?;
    println!("Warehouse Status");
    println!("  Aggregates:        {}", status.aggregates);
    println!("  Organizations:     {}", status.organizations);
    println!("  Indicators:        {}", status.indicators);
    println!("  Projects:          {}", status.projects);
    println!("  Reports:           {}", status.reports);
    println!("  Scheduled reports: {}", status.scheduled_reports);
    println!(
        "  Last generated:    {}",
        status.last_generated.unwrap_or_else(|| "never".to_string())
    );
    Ok(())
}

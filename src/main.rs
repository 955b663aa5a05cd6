use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::Value;
use sqlx::PgPool;

use spark_reports::config::AppConfig;
use spark_reports::db::{self, PgJobStore, PgRepository, PgScheduleStore};
use spark_reports::delivery::{DeliveryDispatcher, OutboxMailer};
use spark_reports::error::ApiError;
use spark_reports::fixtures;
use spark_reports::job::JobStatus;
use spark_reports::logging::init_logging;
use spark_reports::pipeline::ReportPipeline;
use spark_reports::source::SourceRegistry;
use spark_reports::store::{
    FsArtifactStore, JobListQuery, MemoryJobStore, MemoryScheduleStore, DEFAULT_PER_PAGE,
};
use spark_reports::ReportService;

#[derive(Parser)]
#[command(name = "spark-reports")]
#[command(about = "Report and export generation for Spark", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load demo schools, programs, users and bookings
    Seed {
        #[arg(long, default_value_t = 120)]
        bookings: usize,
    },
    /// Import bookings from a CSV file
    ImportBookings {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Run a data export. `--request` is inline JSON or `@file.json`
    Export {
        #[arg(long)]
        request: String,
    },
    /// Generate an analytics report, optionally scheduling it
    Generate {
        #[arg(long)]
        request: String,
    },
    /// Register a recurring report
    Schedule {
        #[arg(long)]
        request: String,
    },
    /// List report jobs, newest first
    List {
        #[arg(long = "type")]
        report_type: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = DEFAULT_PER_PAGE)]
        per_page: usize,
    },
    /// Execute every schedule that is due now
    RunDue,
    /// Poll for due schedules until interrupted
    ServeScheduler,
    /// Run an export, a report and a schedule against in-memory demo data
    Demo,
}

fn read_request(request: &str) -> anyhow::Result<Value> {
    let text = match request.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?,
        None => request.to_string(),
    };
    serde_json::from_str(&text).context("request is not valid JSON")
}

fn print_outcome(outcome: Result<Value, ApiError>) -> anyhow::Result<()> {
    match outcome {
        Ok(body) => {
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        Err(err) => {
            eprintln!("{}", serde_json::to_string_pretty(&err.to_json())?);
            anyhow::bail!("request failed with status {}", err.status_code())
        }
    }
}

async fn connect(config: &AppConfig) -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;
    db::connect(&database_url, config.max_connections).await
}

fn dispatcher(config: &AppConfig) -> Arc<DeliveryDispatcher> {
    Arc::new(DeliveryDispatcher::new(
        Arc::new(OutboxMailer::new(&config.outbox_dir)),
        config.storage_root.join("delivered"),
        config.download_ttl(),
        config.delivery_timeout(),
    ))
}

async fn pg_service(pool: &PgPool, config: &AppConfig) -> anyhow::Result<ReportService> {
    let catalog = db::load_catalog(pool).await?;
    let pipeline = ReportPipeline::new(
        SourceRegistry::from_repository(Arc::new(PgRepository::new(pool.clone()))),
        Arc::new(FsArtifactStore::new(&config.storage_root)),
        config.pipeline_settings(),
    );
    Ok(ReportService::new(
        Arc::new(PgJobStore::new(pool.clone())),
        Arc::new(PgScheduleStore::new(pool.clone())),
        Arc::new(catalog),
        Arc::new(pipeline),
        dispatcher(config),
        config.service_settings(),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = AppConfig::load().context("invalid configuration")?;

    match cli.command {
        Commands::InitDb => {
            let pool = connect(&config).await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed { bookings } => {
            let pool = connect(&config).await?;
            let today = Utc::now().with_timezone(&config.app_timezone).date_naive();
            let inserted = db::seed(&pool, today, bookings).await?;
            println!("Seed data inserted ({inserted} new bookings).");
        }
        Commands::ImportBookings { csv } => {
            let pool = connect(&config).await?;
            let inserted = db::import_bookings(&pool, &csv).await?;
            println!("Inserted {inserted} bookings from {}.", csv.display());
        }
        Commands::Export { request } => {
            let pool = connect(&config).await?;
            let service = pg_service(&pool, &config).await?;
            print_outcome(service.submit_export(&read_request(&request)?, Utc::now()).await)?;
        }
        Commands::Generate { request } => {
            let pool = connect(&config).await?;
            let service = pg_service(&pool, &config).await?;
            print_outcome(service.submit_report(&read_request(&request)?, Utc::now()).await)?;
        }
        Commands::Schedule { request } => {
            let pool = connect(&config).await?;
            let service = pg_service(&pool, &config).await?;
            print_outcome(service.submit_schedule(&read_request(&request)?, Utc::now()).await)?;
        }
        Commands::List {
            report_type,
            status,
            page,
            per_page,
        } => {
            let status = match status.as_deref() {
                Some(value) => Some(
                    JobStatus::parse(value)
                        .with_context(|| format!("unknown status {value}"))?,
                ),
                None => None,
            };
            let pool = connect(&config).await?;
            let service = pg_service(&pool, &config).await?;
            let query = JobListQuery {
                report_type,
                status,
                page: page.max(1),
                per_page: per_page.max(1),
            };
            let listing = service.list_reports(&query).await?;
            if listing.data.is_empty() {
                println!("No reports found.");
                return Ok(());
            }
            println!(
                "Page {} of {} ({} reports):",
                listing.current_page, listing.last_page, listing.total
            );
            for job in &listing.data {
                println!(
                    "- {} {} [{}] {} {}",
                    job.id,
                    job.title,
                    job.report_type,
                    job.format,
                    job.status
                );
            }
        }
        Commands::RunDue => {
            let pool = connect(&config).await?;
            let service = pg_service(&pool, &config).await?;
            let outcomes = service.run_due(Utc::now()).await?;
            println!("Executed {} due schedules.", outcomes.len());
            for outcome in outcomes {
                println!("- {outcome:?}");
            }
        }
        Commands::ServeScheduler => {
            let pool = connect(&config).await?;
            let service = pg_service(&pool, &config).await?;
            let scheduler = service.scheduler();
            tokio::select! {
                _ = scheduler.serve(config.scheduler_poll()) => {}
                _ = tokio::signal::ctrl_c() => {
                    scheduler.stop();
                    println!("Scheduler stopped.");
                }
            }
        }
        Commands::Demo => run_demo(&config).await?,
    }

    Ok(())
}

async fn run_demo(config: &AppConfig) -> anyhow::Result<()> {
    let now = Utc::now();
    let today = now.with_timezone(&config.app_timezone).date_naive();
    let repo = Arc::new(fixtures::demo_repository(today, 120));
    let pipeline = ReportPipeline::new(
        SourceRegistry::from_repository(repo.clone()),
        Arc::new(FsArtifactStore::new(config.storage_root.join("demo"))),
        config.pipeline_settings(),
    );
    let service = ReportService::new(
        Arc::new(MemoryJobStore::new()),
        Arc::new(MemoryScheduleStore::new()),
        Arc::new(repo.catalog()),
        Arc::new(pipeline),
        dispatcher(config),
        config.service_settings(),
    );

    let start = (today - chrono::Duration::days(60)).format("%Y-%m-%d").to_string();
    let end = today.format("%Y-%m-%d").to_string();

    println!("Bookings export:");
    print_outcome(
        service
            .submit_export(
                &serde_json::json!({
                    "data_type": "bookings",
                    "format": "csv",
                    "filters": {"start_date": start, "end_date": end, "include_cancelled": false},
                    "sort_by": "total_cost",
                    "export_options": {"compress": true}
                }),
                now,
            )
            .await,
    )?;

    println!("Booking summary report:");
    print_outcome(
        service
            .submit_report(
                &serde_json::json!({
                    "report_type": "booking_summary",
                    "title": "Quarterly Booking Summary",
                    "filters": {"date_range": "quarter"},
                    "group_by": "month",
                    "format": "pdf"
                }),
                now,
            )
            .await,
    )?;

    println!("Weekly compliance schedule:");
    print_outcome(
        service
            .submit_schedule(
                &serde_json::json!({
                    "title": "Weekly Permission Slip Compliance",
                    "report_type": "permission_slip_compliance",
                    "frequency": "weekly",
                    "day_of_week": 1,
                    "time": "08:00",
                    "recipients": ["coordinator@spark.test"],
                    "filters": {"date_range_type": "relative", "relative_period": "last_week"}
                }),
                now,
            )
            .await,
    )?;

    let later = now + chrono::Duration::days(8);
    let outcomes = service.run_due(later).await?;
    println!("Scheduler run at {}: {} executions.", later.format("%Y-%m-%d %H:%M"), outcomes.len());
    for outcome in outcomes {
        println!("- {outcome:?}");
    }
    println!(
        "Artifacts under {}, emails under {}.",
        config.storage_root.join("demo").display(),
        config.outbox_dir.display()
    );
    Ok(())
}

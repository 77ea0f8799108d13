//! carbonmeter: operator and scheduler front end for the metrics engine.

use carbonmeter::{
    Db, Granularity, MetricsService, PageView, RetentionManager, Scope, Settings, SystemClock,
    spawn_maintenance_loop, telemetry,
};

use anyhow::Context as _;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "carbonmeter")]
#[command(about = "Per-page carbon, energy and performance metrics", long_about = None)]
#[command(version)]
struct Cli {
    /// Settings file (TOML). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the database path from the settings file.
    #[arg(long)]
    database: Option<PathBuf>,

    /// Debug logging. `RUST_LOG` takes precedence.
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record one page view.
    Record {
        #[arg(long)]
        page_id: i64,
        /// Bytes transferred.
        #[arg(long)]
        bytes: i64,
        /// Load time in seconds.
        #[arg(long)]
        load_time: f64,
        #[arg(long, default_value_t = 0)]
        requests: i64,
    },
    /// Aggregate figures for a page id or `all`.
    Stats {
        scope: Scope,
        #[arg(long)]
        force: bool,
    },
    /// Date-bucketed series across all pages.
    Series {
        /// First day (YYYY-MM-DD). Defaults to six days before `end`.
        #[arg(long)]
        start: Option<NaiveDate>,
        /// Last day (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        end: Option<NaiveDate>,
        #[arg(long, default_value = "daily")]
        granularity: Granularity,
        #[arg(long)]
        force: bool,
    },
    /// List stored rollups.
    Periods {
        #[arg(long)]
        page_id: Option<i64>,
        #[arg(long, default_value = "daily")]
        granularity: Granularity,
    },
    /// Run aggregation and retention once.
    Maintain,
    /// Show the last maintenance report.
    LastRun,
    /// Run maintenance on the configured interval until interrupted.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.debug);

    let mut settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(database) = cli.database {
        settings.database_path = database;
    }

    let db = Db::connect(&settings.database_path).await?;
    let settings = Arc::new(settings);
    let service = Arc::new(MetricsService::new(
        db.clone(),
        settings.clone(),
        Arc::new(SystemClock),
    ));

    let result = run_command(cli.command, &settings, service).await;
    db.close().await;
    result
}

async fn run_command(
    command: Command,
    settings: &Settings,
    service: Arc<MetricsService>,
) -> anyhow::Result<()> {
    match command {
        Command::Record {
            page_id,
            bytes,
            load_time,
            requests,
        } => {
            let id = service
                .record_page_view(PageView {
                    page_id,
                    data_transfer: bytes,
                    load_time,
                    requests,
                })
                .await?;
            tracing::info!(id, page_id, "page view recorded");
        }
        Command::Stats { scope, force } => {
            print_json(&service.get_stats(scope, force).await?)?;
        }
        Command::Series {
            start,
            end,
            granularity,
            force,
        } => {
            let series = service
                .get_metrics_by_date_range(start, end, granularity, force)
                .await?;
            print_json(&series)?;
        }
        Command::Periods {
            page_id,
            granularity,
        } => {
            print_json(&service.get_aggregated_periods(page_id, granularity).await?)?;
        }
        Command::Maintain => {
            let report = RetentionManager::new(service).run_scheduled_maintenance().await;
            print_json(&report)?;
            if report.error_flag {
                anyhow::bail!("maintenance finished with {} error(s)", report.errors.len());
            }
        }
        Command::LastRun => match RetentionManager::new(service).last_report().await? {
            Some(report) => print_json(&report)?,
            None => println!("no maintenance run recorded"),
        },
        Command::Run => {
            let manager = Arc::new(RetentionManager::new(service));
            let handle = spawn_maintenance_loop(
                manager,
                Duration::from_secs(settings.maintenance_interval_secs),
            );
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            tracing::info!("shutting down maintenance loop");
            handle.abort();
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

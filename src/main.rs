//! CLI entry point for the ride downtime engine.
//!
//! Every subcommand is an idempotent trigger: loading collector output,
//! attempting aggregation for a timezone/date, the periodic `tick`, gated
//! cleanup, publishing and the operations report.

use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use ride_downtime::analyzers::publish::publish_day;
use ride_downtime::analyzers::rollup::rollup_for_date;
use ride_downtime::analyzers::writetos3::{LocalDirSink, ObjectSink, S3Sink};
use ride_downtime::archive::archive_raw;
use ride_downtime::classifier::{DowntimeRules, StandardRules};
use ride_downtime::config::EngineConfig;
use ride_downtime::health::health_report;
use ride_downtime::ingest::{Catalog, ingest_catalog, ingest_snapshot_files};
use ride_downtime::period::{Granularity, Period};
use ride_downtime::scheduler::{AttemptOutcome, RunStatus, attempt_aggregation, cleanup_raw, tick};
use ride_downtime::storage::Store;
use ride_downtime::trends::trends_for;
use serde::Serialize;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    filter::Directive,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "ride_downtime")]
#[command(about = "Aggregates theme park ride downtime into permanent statistics", long_about = None)]
struct Cli {
    /// JSON engine configuration; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<String>,

    /// SQLite database path (overrides DOWNTIME_DB)
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load parks, rides and tiers from a catalog JSON file
    IngestCatalog {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
    /// Load collector snapshot CSVs
    Ingest {
        /// Ride snapshot CSV
        #[arg(value_name = "RIDES_CSV")]
        rides: PathBuf,

        /// Optional park activity CSV; missing cycles are derived from rides
        #[arg(long)]
        activity: Option<PathBuf>,
    },
    /// Attempt aggregation for one timezone group and local date
    Aggregate {
        /// IANA timezone of the group, e.g. "America/New_York"
        timezone: String,

        /// Local date, YYYY-MM-DD
        date: NaiveDate,

        /// Recompute even if the date already succeeded or ran out of attempts
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Run every attempt due now; safe to call from any timer
    Tick {
        /// Clean up raw snapshots of dates that succeeded in this tick
        #[arg(long, default_value_t = false)]
        cleanup: bool,

        /// Archive raw snapshots to this S3 bucket before cleanup
        #[arg(long)]
        archive_bucket: Option<String>,
    },
    /// Rebuild weekly, monthly and yearly rows containing a date
    Rollup {
        timezone: String,
        date: NaiveDate,
    },
    /// Print improved and declined parks and rides
    Trends {
        /// hourly, daily, weekly, monthly or yearly
        #[arg(short, long, default_value = "daily")]
        granularity: Granularity,

        /// Any local date inside the period
        date: NaiveDate,
    },
    /// Delete raw snapshots of a successfully aggregated timezone/date
    Cleanup {
        timezone: String,
        date: NaiveDate,

        /// Archive to this S3 bucket first; a failed upload aborts cleanup
        #[arg(long)]
        archive_bucket: Option<String>,

        /// Archive to this local directory first
        #[arg(long, conflicts_with = "archive_bucket")]
        archive_dir: Option<PathBuf>,
    },
    /// Publish a date's daily statistics and trends as JSON
    Publish {
        date: NaiveDate,

        /// S3 bucket to upload to (e.g., "my-bucket")
        #[arg(long)]
        s3_bucket: Option<String>,

        /// Local directory to write to instead of S3
        #[arg(short, long, conflicts_with = "s3_bucket")]
        output_dir: Option<PathBuf>,
    },
    /// Print run status, terminal failures and stale parks as JSON
    Health {
        /// Local dates to look back over
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    let cli = Cli::parse();
    let config = EngineConfig::load_or_default(cli.config.as_deref()).context("loading config")?;
    let _file_guard = init_logging(&config)?;

    let db_path = cli
        .db
        .or_else(|| std::env::var("DOWNTIME_DB").ok())
        .unwrap_or_else(|| "data/downtime.db".to_string());
    let store = Arc::new(Store::open(&db_path).with_context(|| format!("opening {db_path}"))?);
    let rules: Arc<dyn DowntimeRules> = Arc::new(StandardRules);

    match cli.command {
        Commands::IngestCatalog { path } => {
            let catalog = Catalog::load(&path)?;
            let summary = ingest_catalog(&store, &catalog)?;
            print_json(&summary)?;
        }
        Commands::Ingest { rides, activity } => {
            let summary = ingest_snapshot_files(&store, &rides, activity.as_deref(), &config)?;
            print_json(&summary)?;
        }
        Commands::Aggregate {
            timezone,
            date,
            force,
        } => {
            let outcome =
                attempt_aggregation(store.clone(), &timezone, date, Utc::now(), &config, rules, force)
                    .await?;
            print_json(&outcome)?;
            if matches!(outcome, AttemptOutcome::Cleaned) {
                bail!("raw snapshots for {timezone} {date} are gone; stored statistics were kept");
            }
            if let AttemptOutcome::Ran(summary) = &outcome {
                if summary.status != RunStatus::Success {
                    bail!("aggregation for {timezone} {date} ended {}", summary.status);
                }
            }
        }
        Commands::Tick {
            cleanup,
            archive_bucket,
        } => {
            let results = tick(store.clone(), Utc::now(), &config, rules).await?;
            info!(attempts = results.len(), "Tick complete");

            if cleanup {
                let sink = match archive_bucket {
                    Some(bucket) => Some(S3Sink::from_env(bucket).await),
                    None => None,
                };
                for result in &results {
                    let AttemptOutcome::Ran(summary) = &result.outcome else {
                        continue;
                    };
                    if summary.status != RunStatus::Success {
                        continue;
                    }
                    let archive = sink.as_ref().map(|s| s as &dyn ObjectSink);
                    if let Err(e) = archive_then_cleanup(&store, archive, &result.timezone, result.local_date).await {
                        error!(timezone = %result.timezone, date = %result.local_date, error = %e, "Cleanup failed");
                    }
                }
            }
            print_json(&results)?;
        }
        Commands::Rollup { timezone, date } => {
            let parks: Vec<i64> = store
                .parks_in_timezone(&timezone)?
                .iter()
                .map(|p| p.park_id)
                .collect();
            if parks.is_empty() {
                warn!(timezone = %timezone, "No parks in timezone group");
            }
            let report = rollup_for_date(&store, &parks, date)?;
            info!(
                ride_rows = report.ride_rows,
                park_rows = report.park_rows,
                failures = report.failures.len(),
                "Rollups rebuilt"
            );
        }
        Commands::Trends { granularity, date } => {
            let period = Period::containing(granularity, date);
            let report = trends_for(&store, period, config.trend_threshold_points)?;
            print_json(&report)?;
        }
        Commands::Cleanup {
            timezone,
            date,
            archive_bucket,
            archive_dir,
        } => {
            let sink: Option<Box<dyn ObjectSink>> = match (archive_bucket, archive_dir) {
                (Some(bucket), _) => Some(Box::new(S3Sink::from_env(bucket).await)),
                (None, Some(dir)) => Some(Box::new(LocalDirSink::new(dir))),
                (None, None) => None,
            };
            archive_then_cleanup(&store, sink.as_deref(), &timezone, date).await?;
        }
        Commands::Publish {
            date,
            s3_bucket,
            output_dir,
        } => {
            let sink: Box<dyn ObjectSink> = match (s3_bucket, output_dir) {
                (Some(bucket), _) => Box::new(S3Sink::from_env(bucket).await),
                (None, Some(dir)) => Box::new(LocalDirSink::new(dir)),
                (None, None) => bail!("publish needs --s3-bucket or --output-dir"),
            };
            let index = publish_day(&store, sink.as_ref(), date, config.trend_threshold_points, Utc::now()).await?;
            print_json(&index)?;
        }
        Commands::Health { days } => {
            let report = health_report(&store, Utc::now(), days, &config)?;
            print_json(&report)?;
        }
    }

    Ok(())
}

/// Colored stderr plus a daily-rolling JSON file. The returned guard must
/// live until exit or buffered file lines are lost.
fn init_logging(config: &EngineConfig) -> Result<WorkerGuard> {
    let log_file_path = std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| config.log_file.clone());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("ride_downtime.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let level: Directive = config
        .log_level
        .parse()
        .with_context(|| format!("invalid log_level '{}'", config.log_level))?;
    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive(level));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse::<Directive>()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    Ok(file_guard)
}

/// Archives (when a sink is given) and then deletes a date's raw snapshots.
/// Nothing is uploaded or deleted unless the latest run succeeded.
#[tracing::instrument(skip(store, archive), fields(timezone = %timezone, date = %date))]
async fn archive_then_cleanup(
    store: &Store,
    archive: Option<&dyn ObjectSink>,
    timezone: &str,
    date: NaiveDate,
) -> Result<()> {
    let status = store.latest_run(timezone, date)?.map(|r| r.status);
    if status != Some(RunStatus::Success) {
        bail!(
            "refusing cleanup of {timezone} {date}: latest run is {}",
            status.map_or("NONE".to_string(), |s| s.to_string())
        );
    }

    if let Some(sink) = archive {
        archive_raw(store, sink, timezone, date).await?;
    }
    let (ride_rows, park_rows) = cleanup_raw(store, timezone, date)?;
    info!(ride_rows, park_rows, "Cleanup complete");
    Ok(())
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

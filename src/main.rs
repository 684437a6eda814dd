use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::BufReader;

use quota_cycle_tracker_lib::commands::{
    get_billing_rollup, get_cycle_history, get_quota_insights, get_quota_status,
};
use quota_cycle_tracker_lib::quota::rate::before;
use quota_cycle_tracker_lib::quota::{
    run_maintenance_once, start_background_maintenance, CycleStore, QuotaKey,
};
use quota_cycle_tracker_lib::{ingest_jsonl, App};

#[derive(Parser, Debug)]
#[command(
    name = "quota-cycle-tracker",
    version,
    about = "Track reset cycles and burn rate of polled API quotas"
)]
struct Cli {
    /// Data directory (defaults: $QUOTA_TRACKER_DIR, then the local data dir)
    #[arg(long, global = true)]
    data_dir: Option<String>,

    /// Config file (defaults: $QUOTA_TRACKER_CONFIG, then <data dir>/config.json)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Evaluate reports at this RFC 3339 instant instead of now
    #[arg(long, global = true)]
    now: Option<DateTime<Utc>>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest JSON-lines samples from a file or stdin
    Ingest {
        /// Input file; stdin when omitted
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Current usage, rate and forecast
    Status {
        /// Quota key (provider/quota); all known quotas when omitted
        #[arg(long)]
        quota: Option<QuotaKey>,
    },
    /// Insight cards for a quota
    Insights {
        #[arg(long)]
        quota: QuotaKey,
    },
    /// Completed cycles, newest first
    History {
        #[arg(long)]
        quota: QuotaKey,
        /// Maximum number of cycles (default from config)
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Billing periods and totals
    Rollup {
        #[arg(long)]
        quota: QuotaKey,
        /// Days of history to group
        #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(i64).range(0..=MAX_DAYS))]
        since_days: i64,
        /// Days covered by the windowed sum
        #[arg(long, default_value_t = 7, value_parser = clap::value_parser!(i64).range(0..=MAX_DAYS))]
        window_days: i64,
    },
    /// Prune raw samples past the retention period
    Maintain,
}

/// Upper bound for day-count arguments
const MAX_DAYS: i64 = 36_500;

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", json);
    Ok(())
}

/// All quotas worth reporting on: configured ones plus any with stored data
fn known_quotas(app: &App) -> Result<Vec<QuotaKey>, String> {
    let mut keys = app.tracker.registered_keys().map_err(|e| e.to_string())?;
    keys.extend(app.store.list_quota_keys().map_err(|e| e.to_string())?);
    keys.sort();
    keys.dedup();
    Ok(keys)
}

async fn run(cli: Cli) -> Result<(), String> {
    let app = App::open(cli.data_dir.as_deref(), cli.config.as_deref()).map_err(|e| e.to_string())?;
    let now = cli.now.unwrap_or_else(Utc::now);

    match cli.command {
        Command::Ingest { file } => {
            let maintenance = start_background_maintenance(
                app.tracker.store(),
                app.config.retention_days,
                app.config.maintenance_interval_seconds,
            );

            let summary = match file {
                Some(path) => {
                    let file = tokio::fs::File::open(&path)
                        .await
                        .map_err(|e| format!("{}: {}", path.display(), e))?;
                    ingest_jsonl(&app.tracker, BufReader::new(file)).await
                }
                None => ingest_jsonl(&app.tracker, BufReader::new(tokio::io::stdin())).await,
            };
            maintenance.abort();

            let summary = summary.map_err(|e| e.to_string())?;
            log::info!(
                "Ingested {} lines: {} resets, {} ignored, {} rejected",
                summary.lines,
                summary.resets,
                summary.ignored,
                summary.rejected
            );
            if app.tracker.ignored_out_of_order() > 0 {
                log::info!(
                    "{} out-of-order samples ignored",
                    app.tracker.ignored_out_of_order()
                );
            }
            print_json(&summary)
        }
        Command::Status { quota } => {
            let keys = match quota {
                Some(key) => vec![key],
                None => known_quotas(&app)?,
            };
            let statuses = keys
                .iter()
                .map(|key| get_quota_status(&app.tracker, key, now))
                .collect::<Result<Vec<_>, _>>()?;
            print_json(&statuses)
        }
        Command::Insights { quota } => print_json(&get_quota_insights(&app.tracker, &quota, now)?),
        Command::History { quota, limit } => {
            let limit = limit.unwrap_or(app.config.history_limit);
            print_json(&get_cycle_history(&app.tracker, &quota, limit)?)
        }
        Command::Rollup {
            quota,
            since_days,
            window_days,
        } => {
            let view = get_billing_rollup(
                &app.tracker,
                &quota,
                before(now, Duration::days(since_days)),
                before(now, Duration::days(window_days)),
                now,
            )?;
            print_json(&view)
        }
        Command::Maintain => {
            let deleted = run_maintenance_once(app.store.as_ref(), app.config.retention_days, now)
                .map_err(|e| e.to_string())?;
            let (cycles, samples) = app.store.get_counts().map_err(|e| e.to_string())?;
            print_json(&serde_json::json!({
                "deletedSamples": deleted,
                "cycles": cycles,
                "samples": samples,
            }))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

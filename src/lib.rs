//! Quota Cycle Tracker - reset detection and burn-rate forecasting for polled API quotas

pub mod commands;
pub mod quota;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use quota::config::{get_config_path, get_data_dir, get_db_path, load_config};
use quota::{
    ConfigError, IngestOutcome, QuotaSample, QuotaTracker, SqliteCycleStore, StoreError,
    TrackerConfig, TrackerError,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Application state: loaded config plus the tracker over the on-disk store
pub struct App {
    pub config: TrackerConfig,
    pub data_dir: PathBuf,
    pub store: Arc<SqliteCycleStore>,
    pub tracker: QuotaTracker,
}

impl App {
    /// Resolve directories, load config, open the store and register configured quotas
    pub fn open(data_dir: Option<&str>, config_path: Option<&str>) -> Result<Self, AppError> {
        let explicit_dir =
            data_dir.is_some() || std::env::var(quota::config::DATA_DIR_ENV).is_ok();
        let mut data_dir = get_data_dir(data_dir);
        let config_path = get_config_path(config_path, &data_dir);
        let config = load_config(&config_path)?;

        // The config file's dataDir only applies when no directory was given explicitly
        if let (false, Some(dir)) = (explicit_dir, config.data_dir.as_deref()) {
            data_dir = PathBuf::from(dir);
        }

        let db_path = get_db_path(&data_dir);
        log::info!("Using database at {}", db_path.display());

        let store = Arc::new(SqliteCycleStore::new(&db_path)?);
        let tracker = QuotaTracker::new(store.clone())
            .with_lookback(Duration::days(i64::from(config.lookback_days)));

        for quota in &config.quotas {
            tracker.register(quota.key.clone(), quota.spec.clone())?;
        }

        Ok(Self {
            config,
            data_dir,
            store,
            tracker,
        })
    }
}

/// Counters from one ingest run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    pub lines: usize,
    pub opened: usize,
    pub continued: usize,
    pub resets: usize,
    pub ignored: usize,
    pub rejected: usize,
}

/// Feed JSON-lines samples into the tracker.
///
/// Malformed lines and rejected samples are logged and skipped; store
/// failures abort the run.
pub async fn ingest_jsonl<R>(tracker: &QuotaTracker, reader: R) -> Result<IngestSummary, AppError>
where
    R: AsyncBufRead + Unpin,
{
    let mut summary = IngestSummary::default();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        summary.lines += 1;

        let sample: QuotaSample = match serde_json::from_str(line) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("Skipping malformed line {}: {}", summary.lines, e);
                summary.rejected += 1;
                continue;
            }
        };

        match tracker.ingest(&sample) {
            Ok(IngestOutcome::Opened(_)) => summary.opened += 1,
            Ok(IngestOutcome::Continued { .. }) => summary.continued += 1,
            Ok(IngestOutcome::Reset { .. }) => summary.resets += 1,
            Ok(IngestOutcome::Ignored { .. }) => summary.ignored += 1,
            Err(TrackerError::Normalize(_)) => summary.rejected += 1,
            Err(TrackerError::UnknownQuota(key)) => {
                log::warn!("Skipping sample for unregistered quota {}", key);
                summary.rejected += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(summary)
}

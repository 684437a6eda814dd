//! Background maintenance task for the raw sample log

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::quota::rate::before;
use crate::quota::store::{CycleStore, StoreError};

/// Delete samples older than the retention period. Returns the number removed.
pub fn run_maintenance_once(
    store: &dyn CycleStore,
    retention_days: u32,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let cutoff = before(now, chrono::Duration::days(i64::from(retention_days)));
    let deleted = store.prune_samples_before(cutoff)?;

    if deleted > 0 {
        log::info!("Pruned {} samples older than {}", deleted, cutoff);
    } else {
        log::debug!("No samples older than {}", cutoff);
    }

    Ok(deleted)
}

/// Start the background maintenance task. Cycle state is never touched.
pub fn start_background_maintenance(
    store: Arc<dyn CycleStore>,
    retention_days: u32,
    interval_secs: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));

        // Skip the first tick (immediate)
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if let Err(e) = run_maintenance_once(store.as_ref(), retention_days, Utc::now()) {
                log::warn!("Background maintenance failed: {}", e);
            }
        }
    })
}

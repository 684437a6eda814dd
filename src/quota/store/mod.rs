//! Persistence contract for cycles and the raw sample log

mod memory;
mod sqlite;

pub use memory::MemoryCycleStore;
pub use sqlite::SqliteCycleStore;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::quota::models::{Cycle, CycleUpdate, QuotaKey, WindowPoint};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Lock error")]
    Lock,
    #[error("cycle {0} not found")]
    CycleNotFound(i64),
    #[error("cycle {0} is already closed")]
    CycleClosed(i64),
    #[error("quota {0} already has an active cycle")]
    ActiveCycleExists(String),
    #[error("invalid quota key in store: {0}")]
    InvalidKey(String),
    #[error("invalid stored timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("timestamp out of storable range: {0}")]
    TimestampOutOfRange(DateTime<Utc>),
}

/// One persisted raw observation, already normalized
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleRecord {
    pub timestamp: DateTime<Utc>,
    pub consumed: f64,
    pub limit: Option<f64>,
}

impl SampleRecord {
    pub fn point(&self) -> WindowPoint {
        WindowPoint::new(self.timestamp, self.consumed)
    }
}

/// Cycle change caused by one sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CycleWrite {
    Open {
        start: DateTime<Utc>,
        initial_peak: f64,
        resets_at: Option<DateTime<Utc>>,
    },
    Update {
        id: i64,
        update: CycleUpdate,
    },
    RollOver {
        closing_id: i64,
        end: DateTime<Utc>,
        start: DateTime<Utc>,
        initial_peak: f64,
        resets_at: Option<DateTime<Utc>>,
    },
}

/// Ordered store of cycles and samples.
///
/// Implementations must keep at most one active cycle per key and must apply
/// `roll_over_cycle` and `apply_sample` atomically.
pub trait CycleStore: Send + Sync {
    fn get_active_cycle(&self, key: &QuotaKey) -> Result<Option<Cycle>, StoreError>;

    /// Open a cycle whose `start_consumed` and `peak` are `initial_peak`
    fn create_cycle(
        &self,
        key: &QuotaKey,
        start: DateTime<Utc>,
        initial_peak: f64,
        resets_at: Option<DateTime<Utc>>,
    ) -> Result<Cycle, StoreError>;

    fn update_cycle(&self, id: i64, update: &CycleUpdate) -> Result<(), StoreError>;

    fn close_cycle(&self, id: i64, end: DateTime<Utc>) -> Result<(), StoreError>;

    /// Close `closing_id` at `end` and open the next cycle in one step
    fn roll_over_cycle(
        &self,
        closing_id: i64,
        end: DateTime<Utc>,
        key: &QuotaKey,
        start: DateTime<Utc>,
        initial_peak: f64,
        resets_at: Option<DateTime<Utc>>,
    ) -> Result<Cycle, StoreError>;

    /// Cycles started at or after `since`, newest first, active cycle included
    fn list_cycles_since(
        &self,
        key: &QuotaKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<Cycle>, StoreError>;

    /// Completed cycles, newest first
    fn list_cycle_history(&self, key: &QuotaKey, limit: usize) -> Result<Vec<Cycle>, StoreError>;

    /// Persist `write` and append `sample` to the log as one unit. On error
    /// neither is stored. Returns the active cycle after the write.
    fn apply_sample(
        &self,
        key: &QuotaKey,
        write: &CycleWrite,
        sample: &SampleRecord,
    ) -> Result<Cycle, StoreError>;

    fn record_sample(
        &self,
        key: &QuotaKey,
        point: &WindowPoint,
        limit: Option<f64>,
    ) -> Result<(), StoreError>;

    /// Samples at or after `since`, oldest first
    fn list_samples_since(
        &self,
        key: &QuotaKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<SampleRecord>, StoreError>;

    fn latest_sample(&self, key: &QuotaKey) -> Result<Option<SampleRecord>, StoreError>;

    /// Delete samples older than `cutoff`. Cycles are never deleted.
    fn prune_samples_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    fn list_quota_keys(&self) -> Result<Vec<QuotaKey>, StoreError>;
}

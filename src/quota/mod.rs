//! Quota cycle tracking: reset detection, billing periods and burn-rate forecasts

pub mod background;
pub mod config;
pub mod detector;
pub mod insights;
pub mod models;
pub mod normalizer;
pub mod periods;
pub mod rate;
pub mod store;
pub mod tracker;
pub mod window;

pub use background::{run_maintenance_once, start_background_maintenance};
pub use config::{get_data_dir, get_db_path, load_config, ConfigError, QuotaDefinition, TrackerConfig};
pub use detector::{detect, ResetReason, Transition};
pub use models::*;
pub use normalizer::{normalize, NormalizeError};
pub use periods::{group_billing_periods, sum_since, BillingRollup};
pub use store::{CycleStore, CycleWrite, MemoryCycleStore, SampleRecord, SqliteCycleStore, StoreError};
pub use tracker::{IngestOutcome, QuotaTracker, ResetEvent, TrackerError};
pub use window::TrackerWindow;

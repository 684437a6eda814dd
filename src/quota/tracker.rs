//! Quota tracker: per-key registry that applies samples to the cycle store
//!
//! Ingestion for one key is serialized by that key's mutex; different keys
//! proceed in parallel. The store is shared and synchronous.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use thiserror::Error;

use crate::quota::detector::{detect, Reading, ResetReason, Transition};
use crate::quota::models::{
    usage_percent, BillingPeriod, CounterSpec, Cycle, Forecast, Projection, QuotaKey,
    QuotaSample, RateEstimate, WindowPoint,
};
use crate::quota::normalizer::{normalize, NormalizeError};
use crate::quota::periods::group_billing_periods;
use crate::quota::rate::{
    before, cycle_average_rate, hours, min_rate_span, project, window_rate,
};
use crate::quota::store::{CycleStore, CycleWrite, SampleRecord, StoreError};
use crate::quota::window::{TrackerWindow, WINDOW_SPAN_MINUTES};

/// Default history span for cycle-average rates
pub const DEFAULT_LOOKBACK_DAYS: i64 = 30;

/// Exhaustion estimates beyond this are not turned into a timestamp
const MAX_EXHAUSTION_HOURS: f64 = 1_000_000.0;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("sample rejected: {0}")]
    Normalize(#[from] NormalizeError),
    #[error("quota {0} is not registered")]
    UnknownQuota(String),
    #[error("Lock error")]
    Lock,
}

/// Result of applying one sample
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// First cycle for the key
    Opened(Cycle),
    Continued { cycle_id: i64, peak: f64 },
    Reset {
        closed_id: i64,
        reason: ResetReason,
        opened: Cycle,
    },
    /// Sample was not newer than the last applied one
    Ignored { last_seen: DateTime<Utc> },
}

/// Passed to the reset hook after a reset has been persisted
#[derive(Debug, Clone, PartialEq)]
pub struct ResetEvent {
    pub quota_key: QuotaKey,
    pub closed_id: i64,
    pub end: DateTime<Utc>,
    pub reason: ResetReason,
    pub opened: Cycle,
}

pub type ResetCallback = Box<dyn Fn(&ResetEvent) + Send + Sync>;

struct KeyState {
    spec: CounterSpec,
    window: TrackerWindow,
    hydrated: bool,
}

impl KeyState {
    fn new(spec: CounterSpec) -> Self {
        Self {
            spec,
            window: TrackerWindow::new(),
            hydrated: false,
        }
    }
}

/// Registry of tracked quota keys backed by a `CycleStore`
pub struct QuotaTracker {
    store: Arc<dyn CycleStore>,
    states: RwLock<HashMap<QuotaKey, Arc<Mutex<KeyState>>>>,
    on_reset: RwLock<Option<ResetCallback>>,
    ignored_out_of_order: AtomicU64,
    lookback: Duration,
}

impl QuotaTracker {
    pub fn new(store: Arc<dyn CycleStore>) -> Self {
        Self {
            store,
            states: RwLock::new(HashMap::new()),
            on_reset: RwLock::new(None),
            ignored_out_of_order: AtomicU64::new(0),
            lookback: Duration::days(DEFAULT_LOOKBACK_DAYS),
        }
    }

    /// History span used for the cycle-average rate
    pub fn with_lookback(mut self, lookback: Duration) -> Self {
        self.lookback = lookback;
        self
    }

    pub fn lookback(&self) -> Duration {
        self.lookback
    }

    pub fn store(&self) -> Arc<dyn CycleStore> {
        Arc::clone(&self.store)
    }

    /// Declare how samples for `key` are normalized. Re-registering replaces the spec.
    pub fn register(&self, key: QuotaKey, spec: CounterSpec) -> Result<(), TrackerError> {
        let mut states = self.states.write().map_err(|_| TrackerError::Lock)?;
        match states.get(&key) {
            Some(state) => {
                state.lock().map_err(|_| TrackerError::Lock)?.spec = spec;
            }
            None => {
                debug!("Registered quota {} ({})", key, spec.kind);
                states.insert(key, Arc::new(Mutex::new(KeyState::new(spec))));
            }
        }
        Ok(())
    }

    pub fn registered_keys(&self) -> Result<Vec<QuotaKey>, TrackerError> {
        let states = self.states.read().map_err(|_| TrackerError::Lock)?;
        let mut keys: Vec<QuotaKey> = states.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    /// Hook invoked after every detected reset
    pub fn set_on_reset<F>(&self, callback: F) -> Result<(), TrackerError>
    where
        F: Fn(&ResetEvent) + Send + Sync + 'static,
    {
        let mut slot = self.on_reset.write().map_err(|_| TrackerError::Lock)?;
        *slot = Some(Box::new(callback));
        Ok(())
    }

    /// Number of samples dropped because they were not newer than the last one
    pub fn ignored_out_of_order(&self) -> u64 {
        self.ignored_out_of_order.load(Ordering::Relaxed)
    }

    fn state(&self, key: &QuotaKey) -> Result<Option<Arc<Mutex<KeyState>>>, TrackerError> {
        let states = self.states.read().map_err(|_| TrackerError::Lock)?;
        Ok(states.get(key).cloned())
    }

    /// Window contents for the active cycle, rebuilt from the sample log
    fn load_window(
        &self,
        key: &QuotaKey,
        active: Option<&Cycle>,
    ) -> Result<TrackerWindow, TrackerError> {
        let mut window = TrackerWindow::new();
        if let Some(cycle) = active {
            let since = cycle
                .start
                .max(before(cycle.last_seen, Duration::minutes(WINDOW_SPAN_MINUTES)));
            let samples = self.store.list_samples_since(key, since)?;
            window.replace(samples.iter().map(|s| s.point()));
        }
        Ok(window)
    }

    /// Apply one polled sample: normalize, detect, persist.
    pub fn ingest(&self, sample: &QuotaSample) -> Result<IngestOutcome, TrackerError> {
        let key = &sample.quota_key;
        let state = self
            .state(key)?
            .ok_or_else(|| TrackerError::UnknownQuota(key.to_string()))?;

        let (outcome, event) = {
            let mut state = state.lock().map_err(|_| TrackerError::Lock)?;

            let normalized = normalize(&state.spec, sample).map_err(|e| {
                warn!("Discarding sample for {} at {}: {}", key, sample.timestamp, e);
                e
            })?;

            let active = self.store.get_active_cycle(key)?;
            if !state.hydrated {
                state.window = self.load_window(key, active.as_ref())?;
                state.hydrated = true;
            }

            let reading = Reading {
                at: sample.timestamp,
                consumed: normalized.consumed,
                resets_at: sample.resets_at,
            };

            let transition = detect(active.as_ref(), &reading, state.spec.reset_hints);
            let write = match transition {
                Transition::OutOfOrder { last_seen } => {
                    self.ignored_out_of_order.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Ignoring out-of-order sample for {} at {} (last seen {})",
                        key, sample.timestamp, last_seen
                    );
                    return Ok(IngestOutcome::Ignored { last_seen });
                }
                Transition::Open {
                    start,
                    peak,
                    resets_at,
                } => CycleWrite::Open {
                    start,
                    initial_peak: peak,
                    resets_at,
                },
                Transition::Continue { cycle_id, update } => CycleWrite::Update {
                    id: cycle_id,
                    update,
                },
                Transition::Reset {
                    closing_id,
                    end,
                    start,
                    peak,
                    resets_at,
                    ..
                } => CycleWrite::RollOver {
                    closing_id,
                    end,
                    start,
                    initial_peak: peak,
                    resets_at,
                },
            };

            // Cycle and sample are committed together so a failed ingest can be retried
            let record = SampleRecord {
                timestamp: reading.at,
                consumed: reading.consumed,
                limit: normalized.limit,
            };
            let cycle = self.store.apply_sample(key, &write, &record)?;

            let (outcome, event) = match transition {
                Transition::Reset {
                    closing_id,
                    end,
                    reason,
                    ..
                } => {
                    let closed_peak = active.as_ref().map(|c| c.peak).unwrap_or_default();
                    info!(
                        "Reset detected for {} ({}): closed cycle {} at {} with peak {:.2}, opened cycle {}",
                        key, reason, closing_id, end, closed_peak, cycle.id
                    );
                    state.window.clear();
                    let event = ResetEvent {
                        quota_key: key.clone(),
                        closed_id: closing_id,
                        end,
                        reason,
                        opened: cycle.clone(),
                    };
                    (
                        IngestOutcome::Reset {
                            closed_id: closing_id,
                            reason,
                            opened: cycle,
                        },
                        Some(event),
                    )
                }
                Transition::Continue { cycle_id, update } => (
                    IngestOutcome::Continued {
                        cycle_id,
                        peak: update.peak,
                    },
                    None,
                ),
                _ => {
                    info!(
                        "Opened cycle {} for {} at {} (consumed {:.2})",
                        cycle.id, key, cycle.start, cycle.peak
                    );
                    state.window.clear();
                    (IngestOutcome::Opened(cycle), None)
                }
            };
            state.window.push(record.point());

            (outcome, event)
        };

        if let Some(event) = event {
            let hook = self.on_reset.read().map_err(|_| TrackerError::Lock)?;
            if let Some(callback) = &*hook {
                callback(&event);
            }
        }

        Ok(outcome)
    }

    /// Window points within the rate span of `now`
    fn recent_points(
        &self,
        key: &QuotaKey,
        active: Option<&Cycle>,
        now: DateTime<Utc>,
    ) -> Result<Vec<WindowPoint>, TrackerError> {
        let since = before(now, Duration::minutes(WINDOW_SPAN_MINUTES));

        if let Some(state) = self.state(key)? {
            let state = state.lock().map_err(|_| TrackerError::Lock)?;
            if state.hydrated {
                return Ok(state.window.points_since(since));
            }
        }

        let window = self.load_window(key, active)?;
        Ok(window.points_since(since))
    }

    fn rate_with_active(
        &self,
        key: &QuotaKey,
        active: Option<&Cycle>,
        now: DateTime<Utc>,
    ) -> Result<Option<RateEstimate>, TrackerError> {
        let points = self.recent_points(key, active, now)?;
        if let Some(rate) = window_rate(&points, min_rate_span()) {
            return Ok(Some(rate));
        }

        let cycles = self.store.list_cycles_since(key, before(now, self.lookback))?;
        Ok(cycle_average_rate(&cycles, now))
    }

    /// Consumption rate, preferring the short window over the cycle average
    pub fn rate(
        &self,
        key: &QuotaKey,
        now: DateTime<Utc>,
    ) -> Result<Option<RateEstimate>, TrackerError> {
        let active = self.store.get_active_cycle(key)?;
        self.rate_with_active(key, active.as_ref(), now)
    }

    /// Current reading, rate and forecast for `key`. Undefined values are `None`.
    pub fn projection(
        &self,
        key: &QuotaKey,
        now: DateTime<Utc>,
    ) -> Result<Projection, TrackerError> {
        let active = self.store.get_active_cycle(key)?;
        let latest = self.store.latest_sample(key)?;

        let current = latest.map(|s| s.consumed);
        let limit = latest.and_then(|s| s.limit);
        let rate = self.rate_with_active(key, active.as_ref(), now)?;

        let resets_at = active.as_ref().and_then(|c| c.resets_at);
        let hours_until_reset = resets_at.map(|r| hours(r - now)).filter(|h| *h > 0.0);

        let forecast = match (current, rate) {
            (Some(current), Some(rate)) => project(current, limit, rate.per_hour, hours_until_reset),
            _ => Forecast::default(),
        };

        let exhausts_at = forecast
            .exhaustion_hours
            .filter(|h| *h < MAX_EXHAUSTION_HOURS)
            .map(|h| now + Duration::milliseconds((h * 3_600_000.0).round() as i64));

        Ok(Projection {
            quota_key: key.clone(),
            as_of: now,
            current,
            limit,
            percent: current.and_then(|c| usage_percent(c, limit)),
            rate,
            resets_at,
            hours_until_reset,
            projected: forecast.projected,
            projected_percent: forecast.projected.and_then(|p| usage_percent(p, limit)),
            exhaustion_hours: forecast.exhaustion_hours,
            exhausts_at,
            exhausts_first: forecast.exhausts_first,
        })
    }

    /// Billing periods for cycles started at or after `since`, oldest first
    pub fn billing_periods(
        &self,
        key: &QuotaKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<BillingPeriod>, TrackerError> {
        let cycles = self.store.list_cycles_since(key, since)?;
        Ok(group_billing_periods(&cycles))
    }

    pub fn cycles_since(
        &self,
        key: &QuotaKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<Cycle>, TrackerError> {
        Ok(self.store.list_cycles_since(key, since)?)
    }

    /// Completed cycles, newest first
    pub fn cycle_history(&self, key: &QuotaKey, limit: usize) -> Result<Vec<Cycle>, TrackerError> {
        Ok(self.store.list_cycle_history(key, limit)?)
    }

    pub fn active_cycle(&self, key: &QuotaKey) -> Result<Option<Cycle>, TrackerError> {
        Ok(self.store.get_active_cycle(key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::detector::DROP_RATIO;
    use crate::quota::models::RateSource;
    use crate::quota::store::{MemoryCycleStore, SqliteCycleStore};
    use chrono::TimeZone;
    use crate::quota::models::CycleUpdate;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn key() -> QuotaKey {
        QuotaKey::new("synthetic", "subscription")
    }

    fn tracker() -> QuotaTracker {
        let tracker = QuotaTracker::new(Arc::new(MemoryCycleStore::new()));
        tracker
            .register(key(), CounterSpec::increasing("requests").with_limit_field("limit"))
            .unwrap();
        tracker
    }

    fn sample(minute: i64, requests: f64) -> QuotaSample {
        QuotaSample::new(key(), at(minute))
            .with_field("requests", requests)
            .with_field("limit", 1000)
    }

    fn active_count(tracker: &QuotaTracker, key: &QuotaKey) -> usize {
        tracker
            .cycles_since(key, at(-10_000))
            .unwrap()
            .iter()
            .filter(|c| c.is_active())
            .count()
    }

    #[test]
    fn test_reset_sequence_produces_two_cycles() {
        let tracker = tracker();
        for (i, value) in [10.0, 40.0, 90.0, 95.0, 5.0, 30.0].iter().enumerate() {
            tracker.ingest(&sample(i as i64 * 10, *value)).unwrap();
        }

        let cycles = tracker.cycles_since(&key(), at(0)).unwrap();
        assert_eq!(cycles.len(), 2);

        let (newest, oldest) = (&cycles[0], &cycles[1]);
        assert_eq!(oldest.peak, 95.0);
        assert_eq!(oldest.end, Some(at(30)));
        assert_eq!(oldest.total_delta, 85.0);
        assert!(newest.is_active());
        assert_eq!(newest.start, at(40));
        assert_eq!(newest.peak, 30.0);
        assert_eq!(newest.total_delta, 25.0);
    }

    #[test]
    fn test_drop_threshold() {
        let tracker = tracker();
        tracker.ingest(&sample(0, 100.0)).unwrap();

        let outcome = tracker.ingest(&sample(5, 60.0)).unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::Continued {
                cycle_id: 1,
                peak: 100.0
            }
        );

        let outcome = tracker.ingest(&sample(10, 100.0 * DROP_RATIO - 10.0)).unwrap();
        match outcome {
            IngestOutcome::Reset {
                closed_id, reason, ..
            } => {
                assert_eq!(closed_id, 1);
                assert_eq!(reason, ResetReason::Drop);
            }
            other => panic!("expected reset, got {:?}", other),
        }
    }

    #[test]
    fn test_single_active_cycle_and_monotonic_peak() {
        let tracker = tracker();
        let values = [3.0, 8.0, 2.0, 12.0, 30.0, 14.0, 9.0, 50.0, 51.0, 20.0, 80.0, 1.0];

        let mut last_peak = 0.0;
        for (i, value) in values.iter().enumerate() {
            let outcome = tracker.ingest(&sample(i as i64, *value)).unwrap();
            assert_eq!(active_count(&tracker, &key()), 1);

            let active = tracker.active_cycle(&key()).unwrap().unwrap();
            if let IngestOutcome::Continued { .. } = outcome {
                assert!(active.peak >= last_peak);
            }
            assert_eq!(active.total_delta, (active.peak - active.start_consumed).max(0.0));
            last_peak = active.peak;
        }
    }

    #[test]
    fn test_out_of_order_samples_are_ignored() {
        let tracker = tracker();
        tracker.ingest(&sample(10, 20.0)).unwrap();

        let outcome = tracker.ingest(&sample(5, 1.0)).unwrap();
        assert_eq!(outcome, IngestOutcome::Ignored { last_seen: at(10) });
        tracker.ingest(&sample(10, 1.0)).unwrap();

        assert_eq!(tracker.ignored_out_of_order(), 2);
        assert_eq!(tracker.cycles_since(&key(), at(0)).unwrap().len(), 1);
    }

    /// Delegates to a memory store but fails the next `apply_sample` on demand
    struct FlakyStore {
        inner: MemoryCycleStore,
        fail_next: AtomicBool,
    }

    impl CycleStore for FlakyStore {
        fn get_active_cycle(&self, key: &QuotaKey) -> Result<Option<Cycle>, StoreError> {
            self.inner.get_active_cycle(key)
        }

        fn create_cycle(
            &self,
            key: &QuotaKey,
            start: DateTime<Utc>,
            initial_peak: f64,
            resets_at: Option<DateTime<Utc>>,
        ) -> Result<Cycle, StoreError> {
            self.inner.create_cycle(key, start, initial_peak, resets_at)
        }

        fn update_cycle(&self, id: i64, update: &CycleUpdate) -> Result<(), StoreError> {
            self.inner.update_cycle(id, update)
        }

        fn close_cycle(&self, id: i64, end: DateTime<Utc>) -> Result<(), StoreError> {
            self.inner.close_cycle(id, end)
        }

        fn roll_over_cycle(
            &self,
            closing_id: i64,
            end: DateTime<Utc>,
            key: &QuotaKey,
            start: DateTime<Utc>,
            initial_peak: f64,
            resets_at: Option<DateTime<Utc>>,
        ) -> Result<Cycle, StoreError> {
            self.inner
                .roll_over_cycle(closing_id, end, key, start, initial_peak, resets_at)
        }

        fn list_cycles_since(
            &self,
            key: &QuotaKey,
            since: DateTime<Utc>,
        ) -> Result<Vec<Cycle>, StoreError> {
            self.inner.list_cycles_since(key, since)
        }

        fn list_cycle_history(
            &self,
            key: &QuotaKey,
            limit: usize,
        ) -> Result<Vec<Cycle>, StoreError> {
            self.inner.list_cycle_history(key, limit)
        }

        fn apply_sample(
            &self,
            key: &QuotaKey,
            write: &CycleWrite,
            sample: &SampleRecord,
        ) -> Result<Cycle, StoreError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Lock);
            }
            self.inner.apply_sample(key, write, sample)
        }

        fn record_sample(
            &self,
            key: &QuotaKey,
            point: &WindowPoint,
            limit: Option<f64>,
        ) -> Result<(), StoreError> {
            self.inner.record_sample(key, point, limit)
        }

        fn list_samples_since(
            &self,
            key: &QuotaKey,
            since: DateTime<Utc>,
        ) -> Result<Vec<SampleRecord>, StoreError> {
            self.inner.list_samples_since(key, since)
        }

        fn latest_sample(&self, key: &QuotaKey) -> Result<Option<SampleRecord>, StoreError> {
            self.inner.latest_sample(key)
        }

        fn prune_samples_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
            self.inner.prune_samples_before(cutoff)
        }

        fn list_quota_keys(&self) -> Result<Vec<QuotaKey>, StoreError> {
            self.inner.list_quota_keys()
        }
    }

    #[test]
    fn test_failed_store_write_leaves_sample_retryable() {
        let store = Arc::new(FlakyStore {
            inner: MemoryCycleStore::new(),
            fail_next: AtomicBool::new(false),
        });
        let tracker = QuotaTracker::new(store.clone());
        tracker
            .register(key(), CounterSpec::increasing("requests").with_limit_field("limit"))
            .unwrap();

        tracker.ingest(&sample(0, 100.0)).unwrap();

        store.fail_next.store(true, Ordering::SeqCst);
        assert!(matches!(
            tracker.ingest(&sample(10, 150.0)),
            Err(TrackerError::Store(StoreError::Lock))
        ));

        let active = tracker.active_cycle(&key()).unwrap().unwrap();
        assert_eq!(active.peak, 100.0);
        assert_eq!(active.last_seen, at(0));
        assert_eq!(store.latest_sample(&key()).unwrap().unwrap().consumed, 100.0);

        let retried = tracker.ingest(&sample(10, 150.0)).unwrap();
        assert_eq!(
            retried,
            IngestOutcome::Continued {
                cycle_id: active.id,
                peak: 150.0
            }
        );
        assert_eq!(tracker.ignored_out_of_order(), 0);
        assert_eq!(store.latest_sample(&key()).unwrap().unwrap().consumed, 150.0);
        assert_eq!(tracker.projection(&key(), at(10)).unwrap().current, Some(150.0));
    }

    #[test]
    fn test_failed_reset_write_keeps_old_cycle_open() {
        let store = Arc::new(FlakyStore {
            inner: MemoryCycleStore::new(),
            fail_next: AtomicBool::new(false),
        });
        let tracker = QuotaTracker::new(store.clone());
        tracker
            .register(key(), CounterSpec::increasing("requests").with_limit_field("limit"))
            .unwrap();
        let first = match tracker.ingest(&sample(0, 100.0)).unwrap() {
            IngestOutcome::Opened(cycle) => cycle,
            other => panic!("expected open, got {:?}", other),
        };

        store.fail_next.store(true, Ordering::SeqCst);
        assert!(tracker.ingest(&sample(10, 5.0)).is_err());
        assert_eq!(tracker.active_cycle(&key()).unwrap().unwrap().id, first.id);

        let retried = tracker.ingest(&sample(10, 5.0)).unwrap();
        assert!(matches!(retried, IngestOutcome::Reset { closed_id, .. } if closed_id == first.id));
        assert_eq!(active_count(&tracker, &key()), 1);
    }

    #[test]
    fn test_malformed_and_unknown_samples_leave_state_untouched() {
        let tracker = tracker();
        tracker.ingest(&sample(0, 20.0)).unwrap();

        let broken = QuotaSample::new(key(), at(5)).with_field("requests", "n/a");
        assert!(matches!(
            tracker.ingest(&broken),
            Err(TrackerError::Normalize(_))
        ));

        let unknown = QuotaSample::new(QuotaKey::new("other", "quota"), at(5));
        assert!(matches!(
            tracker.ingest(&unknown),
            Err(TrackerError::UnknownQuota(_))
        ));

        let active = tracker.active_cycle(&key()).unwrap().unwrap();
        assert_eq!(active.last_seen, at(0));
    }

    #[test]
    fn test_rate_and_exhaustion_forecast() {
        let tracker = tracker();
        tracker
            .ingest(&sample(0, 100.0).with_resets_at(at(600)))
            .unwrap();
        tracker.ingest(&sample(5, 125.0)).unwrap();
        tracker.ingest(&sample(10, 150.0)).unwrap();

        let projection = tracker.projection(&key(), at(10)).unwrap();
        let rate = projection.rate.unwrap();
        assert_eq!(rate.source, RateSource::Window);
        assert!((rate.per_hour - 300.0).abs() < 1e-9);

        assert_eq!(projection.current, Some(150.0));
        assert_eq!(projection.limit, Some(1000.0));
        assert!((projection.percent.unwrap() - 15.0).abs() < 1e-9);
        assert!((projection.exhaustion_hours.unwrap() - 2.8333).abs() < 1e-3);
        assert!(projection.exhausts_first);
        assert_eq!(projection.projected, Some(1000.0));
        assert!(projection.exhausts_at.is_some());
    }

    #[test]
    fn test_rate_falls_back_to_cycle_average() {
        let tracker = tracker();
        tracker.ingest(&sample(0, 0.0)).unwrap();
        tracker.ingest(&sample(60, 30.0)).unwrap();

        // Only the point at minute 60 is inside the window span at minute 120.
        let rate = tracker.rate(&key(), at(120)).unwrap().unwrap();
        assert_eq!(rate.source, RateSource::CycleAverage);
        assert!((rate.per_hour - 15.0).abs() < 1e-9);

        let empty = QuotaKey::new("synthetic", "empty");
        assert!(tracker.rate(&empty, at(120)).unwrap().is_none());
        let projection = tracker.projection(&empty, at(120)).unwrap();
        assert!(projection.current.is_none());
        assert!(projection.exhaustion_hours.is_none());
        assert!(!projection.exhausts_first);
    }

    #[test]
    fn test_reset_hook_is_called() {
        let tracker = tracker();
        let resets = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&resets);
        tracker
            .set_on_reset(move |event| {
                assert_eq!(event.quota_key, key());
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        for (i, value) in [50.0, 60.0, 10.0, 40.0, 2.0].iter().enumerate() {
            tracker.ingest(&sample(i as i64, *value)).unwrap();
        }
        assert_eq!(resets.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.db");

        {
            let store = Arc::new(SqliteCycleStore::new(&path).unwrap());
            let tracker = QuotaTracker::new(store);
            tracker
                .register(key(), CounterSpec::increasing("requests").with_limit_field("limit"))
                .unwrap();
            tracker.ingest(&sample(0, 100.0)).unwrap();
            tracker.ingest(&sample(5, 125.0)).unwrap();
        }

        let store = Arc::new(SqliteCycleStore::new(&path).unwrap());
        let tracker = QuotaTracker::new(store);
        tracker
            .register(key(), CounterSpec::increasing("requests").with_limit_field("limit"))
            .unwrap();

        assert!(matches!(
            tracker.ingest(&sample(5, 130.0)).unwrap(),
            IngestOutcome::Ignored { .. }
        ));

        tracker.ingest(&sample(10, 150.0)).unwrap();
        let rate = tracker.rate(&key(), at(10)).unwrap().unwrap();
        assert_eq!(rate.source, RateSource::Window);
        assert!((rate.per_hour - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_keys_ingest_concurrently() {
        let tracker = Arc::new(QuotaTracker::new(Arc::new(MemoryCycleStore::new())));
        let keys: Vec<QuotaKey> = (0..4)
            .map(|i| QuotaKey::new("synthetic", format!("q{}", i)))
            .collect();
        for k in &keys {
            tracker
                .register(k.clone(), CounterSpec::percent("utilization"))
                .unwrap();
        }

        std::thread::scope(|scope| {
            for k in &keys {
                let tracker = Arc::clone(&tracker);
                scope.spawn(move || {
                    for minute in 0..50 {
                        let value = (minute % 25) as f64 * 4.0;
                        let s = QuotaSample::new(k.clone(), at(minute))
                            .with_field("utilization", value);
                        tracker.ingest(&s).unwrap();
                    }
                });
            }
        });

        for k in &keys {
            assert_eq!(active_count(&tracker, k), 1);
            assert_eq!(tracker.cycles_since(k, at(0)).unwrap().len(), 2);
        }
    }
}

//! In-process cycle store for tests and ephemeral runs

use std::collections::BTreeSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::{CycleStore, CycleWrite, SampleRecord, StoreError};
use crate::quota::models::{Cycle, CycleUpdate, QuotaKey, WindowPoint};

#[derive(Default)]
struct Inner {
    cycles: Vec<Cycle>,
    samples: Vec<(QuotaKey, SampleRecord)>,
    next_id: i64,
}

impl Inner {
    fn insert(
        &mut self,
        key: &QuotaKey,
        start: DateTime<Utc>,
        initial_peak: f64,
        resets_at: Option<DateTime<Utc>>,
    ) -> Result<Cycle, StoreError> {
        if self.cycles.iter().any(|c| &c.quota_key == key && c.is_active()) {
            return Err(StoreError::ActiveCycleExists(key.to_string()));
        }

        self.next_id += 1;
        let cycle = Cycle {
            id: self.next_id,
            quota_key: key.clone(),
            start,
            end: None,
            peak: initial_peak,
            start_consumed: initial_peak,
            total_delta: 0.0,
            resets_at,
            last_seen: start,
        };
        self.cycles.push(cycle.clone());
        Ok(cycle)
    }

    /// Active cycle `id`, which must belong to `key`
    fn active_for(&mut self, id: i64, key: &QuotaKey) -> Result<&mut Cycle, StoreError> {
        let cycle = self.active_mut(id)?;
        if &cycle.quota_key != key {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(cycle)
    }

    fn apply_update(&mut self, id: i64, update: &CycleUpdate) -> Result<Cycle, StoreError> {
        let cycle = self.active_mut(id)?;
        cycle.peak = update.peak;
        cycle.total_delta = update.total_delta;
        cycle.last_seen = update.last_seen;
        cycle.resets_at = update.resets_at;
        Ok(cycle.clone())
    }

    fn active_mut(&mut self, id: i64) -> Result<&mut Cycle, StoreError> {
        let cycle = self
            .cycles
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(StoreError::CycleNotFound(id))?;
        if !cycle.is_active() {
            return Err(StoreError::CycleClosed(id));
        }
        Ok(cycle)
    }
}

/// Non-persistent `CycleStore` behind a single mutex
#[derive(Default)]
pub struct MemoryCycleStore {
    inner: Mutex<Inner>,
}

impl MemoryCycleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(mut cycles: Vec<Cycle>) -> Vec<Cycle> {
    cycles.sort_by(|a, b| b.start.cmp(&a.start).then(b.id.cmp(&a.id)));
    cycles
}

impl CycleStore for MemoryCycleStore {
    fn get_active_cycle(&self, key: &QuotaKey) -> Result<Option<Cycle>, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Lock)?;
        Ok(inner
            .cycles
            .iter()
            .find(|c| &c.quota_key == key && c.is_active())
            .cloned())
    }

    fn create_cycle(
        &self,
        key: &QuotaKey,
        start: DateTime<Utc>,
        initial_peak: f64,
        resets_at: Option<DateTime<Utc>>,
    ) -> Result<Cycle, StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Lock)?;
        inner.insert(key, start, initial_peak, resets_at)
    }

    fn update_cycle(&self, id: i64, update: &CycleUpdate) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Lock)?;
        inner.apply_update(id, update).map(|_| ())
    }

    fn close_cycle(&self, id: i64, end: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Lock)?;
        inner.active_mut(id)?.end = Some(end);
        Ok(())
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
        let mut inner = self.inner.lock().map_err(|_| StoreError::Lock)?;

        inner.active_for(closing_id, key)?.end = Some(end);
        inner.insert(key, start, initial_peak, resets_at)
    }

    fn list_cycles_since(
        &self,
        key: &QuotaKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<Cycle>, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Lock)?;
        Ok(newest_first(
            inner
                .cycles
                .iter()
                .filter(|c| &c.quota_key == key && c.start >= since)
                .cloned()
                .collect(),
        ))
    }

    fn list_cycle_history(&self, key: &QuotaKey, limit: usize) -> Result<Vec<Cycle>, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Lock)?;
        let mut history = newest_first(
            inner
                .cycles
                .iter()
                .filter(|c| &c.quota_key == key && !c.is_active())
                .cloned()
                .collect(),
        );
        history.truncate(limit);
        Ok(history)
    }

    fn apply_sample(
        &self,
        key: &QuotaKey,
        write: &CycleWrite,
        sample: &SampleRecord,
    ) -> Result<Cycle, StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Lock)?;

        // Every fallible check runs before the first mutation
        let cycle = match *write {
            CycleWrite::Open {
                start,
                initial_peak,
                resets_at,
            } => inner.insert(key, start, initial_peak, resets_at)?,
            CycleWrite::Update { id, ref update } => {
                inner.active_for(id, key)?;
                inner.apply_update(id, update)?
            }
            CycleWrite::RollOver {
                closing_id,
                end,
                start,
                initial_peak,
                resets_at,
            } => {
                inner.active_for(closing_id, key)?.end = Some(end);
                inner.insert(key, start, initial_peak, resets_at)?
            }
        };
        inner.samples.push((key.clone(), *sample));

        Ok(cycle)
    }

    fn record_sample(
        &self,
        key: &QuotaKey,
        point: &WindowPoint,
        limit: Option<f64>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Lock)?;
        inner.samples.push((
            key.clone(),
            SampleRecord {
                timestamp: point.timestamp,
                consumed: point.consumed,
                limit,
            },
        ));
        Ok(())
    }

    fn list_samples_since(
        &self,
        key: &QuotaKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<SampleRecord>, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Lock)?;
        let mut samples: Vec<SampleRecord> = inner
            .samples
            .iter()
            .filter(|(k, s)| k == key && s.timestamp >= since)
            .map(|(_, s)| *s)
            .collect();
        samples.sort_by_key(|s| s.timestamp);
        Ok(samples)
    }

    fn latest_sample(&self, key: &QuotaKey) -> Result<Option<SampleRecord>, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Lock)?;
        Ok(inner
            .samples
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, s)| *s)
            .max_by_key(|s| s.timestamp))
    }

    fn prune_samples_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Lock)?;
        let before = inner.samples.len();
        inner.samples.retain(|(_, s)| s.timestamp >= cutoff);
        Ok(before - inner.samples.len())
    }

    fn list_quota_keys(&self) -> Result<Vec<QuotaKey>, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Lock)?;
        let keys: BTreeSet<QuotaKey> = inner
            .cycles
            .iter()
            .map(|c| c.quota_key.clone())
            .chain(inner.samples.iter().map(|(k, _)| k.clone()))
            .collect();
        Ok(keys.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap() + Duration::minutes(minute)
    }

    #[test]
    fn test_memory_store_matches_contract() {
        let store = MemoryCycleStore::new();
        let key = QuotaKey::new("synthetic", "search");

        let first = store.create_cycle(&key, at(0), 5.0, None).unwrap();
        assert!(matches!(
            store.create_cycle(&key, at(1), 5.0, None),
            Err(StoreError::ActiveCycleExists(_))
        ));

        let second = store
            .roll_over_cycle(first.id, at(9), &key, at(10), 1.0, None)
            .unwrap();
        assert_eq!(store.get_active_cycle(&key).unwrap().unwrap().id, second.id);

        let all = store.list_cycles_since(&key, at(0)).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, second.id);

        let history = store.list_cycle_history(&key, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].end, Some(at(9)));

        assert!(matches!(
            store.update_cycle(
                first.id,
                &CycleUpdate {
                    peak: 1.0,
                    total_delta: 0.0,
                    last_seen: at(20),
                    resets_at: None
                }
            ),
            Err(StoreError::CycleClosed(_))
        ));
    }

    #[test]
    fn test_memory_store_samples() {
        let store = MemoryCycleStore::new();
        let key = QuotaKey::new("synthetic", "search");
        store.record_sample(&key, &WindowPoint::new(at(5), 2.0), None).unwrap();
        store.record_sample(&key, &WindowPoint::new(at(0), 1.0), None).unwrap();

        let samples = store.list_samples_since(&key, at(0)).unwrap();
        assert_eq!(samples[0].timestamp, at(0));
        assert_eq!(store.latest_sample(&key).unwrap().unwrap().consumed, 2.0);
        assert_eq!(store.prune_samples_before(at(1)).unwrap(), 1);
        assert_eq!(store.list_quota_keys().unwrap(), vec![key]);
    }
}

//! Billing-period aggregation
//!
//! Polling jitter can split one provider period into several detected cycles.
//! Adjacent cycles are merged until a cycle peaks well below the running
//! period maximum, which marks a genuine reset.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::quota::models::{BillingPeriod, Cycle};

/// A cycle peaking below `max_peak * PERIOD_DROP_RATIO` starts a new period
pub const PERIOD_DROP_RATIO: f64 = 0.5;

/// Group cycles (newest first, as the store returns them) into billing
/// periods, returned oldest first.
pub fn group_billing_periods(cycles_newest_first: &[Cycle]) -> Vec<BillingPeriod> {
    let mut periods = Vec::new();
    let mut current: Option<BillingPeriod> = None;

    for cycle in cycles_newest_first.iter().rev() {
        current = Some(match current {
            None => BillingPeriod {
                start: cycle.start,
                max_peak: cycle.peak,
                cycle_count: 1,
            },
            Some(period) if cycle.peak < period.max_peak * PERIOD_DROP_RATIO => {
                periods.push(period);
                BillingPeriod {
                    start: cycle.start,
                    max_peak: cycle.peak,
                    cycle_count: 1,
                }
            }
            Some(period) => BillingPeriod {
                max_peak: period.max_peak.max(cycle.peak),
                cycle_count: period.cycle_count + 1,
                ..period
            },
        });
    }

    periods.extend(current);
    periods
}

/// Summary statistics over a set of billing periods
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingRollup {
    pub count: usize,
    pub sum: f64,
    pub average: f64,
    pub max: f64,
}

impl BillingRollup {
    pub fn from_periods(periods: &[BillingPeriod]) -> Self {
        if periods.is_empty() {
            return Self::default();
        }

        let sum: f64 = periods.iter().map(|p| p.max_peak).sum();
        let max = periods.iter().map(|p| p.max_peak).fold(0.0, f64::max);

        Self {
            count: periods.len(),
            sum,
            average: sum / periods.len() as f64,
            max,
        }
    }
}

/// Sum of `max_peak` over periods that started at or after `since`
pub fn sum_since(periods: &[BillingPeriod], since: DateTime<Utc>) -> f64 {
    periods
        .iter()
        .filter(|p| p.start >= since)
        .map(|p| p.max_peak)
        .sum()
}

/// Average peak of the newest half of the periods and of the rest.
/// Periods must be oldest first. `None` with fewer than two periods.
pub fn recent_vs_older(periods: &[BillingPeriod]) -> Option<(f64, f64)> {
    if periods.len() < 2 {
        return None;
    }

    let recent_len = periods.len() / 2;
    let (older, recent) = periods.split_at(periods.len() - recent_len);

    Some((average_peak(recent), average_peak(older)))
}

fn average_peak(periods: &[BillingPeriod]) -> f64 {
    if periods.is_empty() {
        return 0.0;
    }
    periods.iter().map(|p| p.max_peak).sum::<f64>() / periods.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::models::QuotaKey;
    use chrono::{Duration, TimeZone};

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    /// Build cycles from chronological peaks, returned newest first
    fn cycles(peaks: &[f64]) -> Vec<Cycle> {
        let mut out: Vec<Cycle> = peaks
            .iter()
            .enumerate()
            .map(|(i, &peak)| Cycle {
                id: i as i64 + 1,
                quota_key: QuotaKey::new("zai", "tokens"),
                start: day(i as i64),
                end: Some(day(i as i64 + 1)),
                peak,
                start_consumed: 0.0,
                total_delta: peak,
                resets_at: None,
                last_seen: day(i as i64 + 1),
            })
            .collect();
        out.reverse();
        out
    }

    #[test]
    fn test_jitter_cycles_merge_into_periods() {
        let periods = group_billing_periods(&cycles(&[20.0, 22.0, 21.0, 3.0, 18.0, 19.0]));

        assert_eq!(periods.len(), 2);
        assert_eq!(periods[0].max_peak, 22.0);
        assert_eq!(periods[0].start, day(0));
        assert_eq!(periods[0].cycle_count, 3);
        assert_eq!(periods[1].max_peak, 19.0);
        assert_eq!(periods[1].start, day(3));
        assert_eq!(periods[1].cycle_count, 3);
    }

    #[test]
    fn test_grouping_is_idempotent() {
        let input = cycles(&[50.0, 10.0, 45.0, 48.0, 2.0]);
        let first = group_billing_periods(&input);
        let second = group_billing_periods(&input);
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_input() {
        assert!(group_billing_periods(&[]).is_empty());
        assert_eq!(BillingRollup::from_periods(&[]), BillingRollup::default());
    }

    #[test]
    fn test_rollup_and_sum_since() {
        let periods = group_billing_periods(&cycles(&[20.0, 22.0, 21.0, 3.0, 18.0, 19.0]));
        let rollup = BillingRollup::from_periods(&periods);

        assert_eq!(rollup.count, 2);
        assert_eq!(rollup.sum, 41.0);
        assert_eq!(rollup.average, 20.5);
        assert_eq!(rollup.max, 22.0);

        assert_eq!(sum_since(&periods, day(1)), 19.0);
        assert_eq!(sum_since(&periods, day(0)), 41.0);
        assert_eq!(sum_since(&periods, day(10)), 0.0);
    }

    #[test]
    fn test_recent_half_is_newest() {
        let periods: Vec<BillingPeriod> = [10.0, 10.0, 30.0, 30.0, 30.0]
            .iter()
            .enumerate()
            .map(|(i, &max_peak)| BillingPeriod {
                start: day(i as i64),
                max_peak,
                cycle_count: 1,
            })
            .collect();

        let (recent, older) = recent_vs_older(&periods).unwrap();
        assert_eq!(recent, 30.0);
        assert!((older - 50.0 / 3.0).abs() < 1e-9);
    }
}

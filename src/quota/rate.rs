//! Consumption rate estimation and forward projection

use chrono::{DateTime, Duration, Utc};

use crate::quota::models::{Cycle, Forecast, RateEstimate, RateSource, WindowPoint};

/// Minimum span between the oldest and newest points for a rate to be trusted
pub const MIN_RATE_SPAN_MINUTES: i64 = 5;

pub fn min_rate_span() -> Duration {
    Duration::minutes(MIN_RATE_SPAN_MINUTES)
}

/// Fractional hours in a duration
pub fn hours(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64 / 3_600_000.0
}

/// `t - span`, saturating at the earliest representable instant
pub fn before(t: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    t.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Rate from the oldest and newest points of the window.
///
/// A flat or falling window is idle (`0.0`); fewer than two points or a span
/// below `min_span` yields `None`.
pub fn window_rate(points: &[WindowPoint], min_span: Duration) -> Option<RateEstimate> {
    let (oldest, newest) = match (points.first(), points.last()) {
        (Some(o), Some(n)) if points.len() >= 2 => (o, n),
        _ => return None,
    };

    let elapsed = newest.timestamp - oldest.timestamp;
    if elapsed < min_span || elapsed <= Duration::zero() {
        return None;
    }

    let delta = newest.consumed - oldest.consumed;
    let per_hour = if delta <= 0.0 {
        0.0
    } else {
        delta / hours(elapsed)
    };

    per_hour.is_finite().then_some(RateEstimate {
        per_hour,
        source: RateSource::Window,
    })
}

/// Average rate over all tracked cycles, completed and active.
pub fn cycle_average_rate(cycles: &[Cycle], now: DateTime<Utc>) -> Option<RateEstimate> {
    let oldest_start = cycles.iter().map(|c| c.start).min()?;
    let total_tracked: f64 = cycles.iter().map(|c| c.total_delta).sum();

    let elapsed = now - oldest_start;
    if total_tracked <= 0.0 || elapsed < min_rate_span() {
        return None;
    }

    let per_hour = total_tracked / hours(elapsed);
    per_hour.is_finite().then_some(RateEstimate {
        per_hour,
        source: RateSource::CycleAverage,
    })
}

/// Project a rate forward against a limit and the time left until reset.
pub fn project(
    current: f64,
    limit: Option<f64>,
    rate: f64,
    hours_until_reset: Option<f64>,
) -> Forecast {
    let limit = limit.filter(|l| l.is_finite() && *l > 0.0);
    let rate = if rate.is_finite() { rate.max(0.0) } else { 0.0 };
    let hours_until_reset = hours_until_reset.filter(|h| h.is_finite() && *h > 0.0);

    let projected = hours_until_reset.map(|h| {
        let value = (current + rate * h).max(0.0);
        match limit {
            Some(l) => value.min(l),
            None => value,
        }
    });

    let exhaustion_hours = match limit {
        Some(l) if current >= l => Some(0.0),
        Some(l) if rate > 0.0 => Some(((l - current) / rate).max(0.0)),
        _ => None,
    };

    let exhausts_first = match (exhaustion_hours, hours_until_reset) {
        (Some(exhaustion), Some(until)) => exhaustion < until,
        _ => false,
    };

    Forecast {
        projected: projected.filter(|p| p.is_finite()),
        exhaustion_hours: exhaustion_hours.filter(|h| h.is_finite()),
        exhausts_first,
    }
}

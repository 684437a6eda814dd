//! Reset-cycle detection for a single quota key
//!
//! Providers do not emit reset events, so a reset is inferred when the
//! normalized counter falls below half of the peak seen in the open cycle.
//! Provider-reported reset times are advisory: they only confirm a reset when
//! they have clearly expired or moved by more than the jitter tolerance.

use std::fmt;

use chrono::{DateTime, Duration, Utc};

use crate::quota::models::{Cycle, CycleUpdate};

/// A sample below `peak * DROP_RATIO` means the quota was reset
pub const DROP_RATIO: f64 = 0.5;

/// Peaks at or below this floor are noise and never trigger a drop reset
pub const MIN_SIGNAL: f64 = 5.0;

/// Grace period after a stored reset time before it counts as expired
pub const RESET_GRACE_MINUTES: i64 = 2;

/// Reported reset times moving by less than this are provider jitter
pub const RESET_SHIFT_TOLERANCE_MINUTES: i64 = 10;

/// Why a reset was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// Consumption dropped below half of the cycle peak
    Drop,
    /// The stored reset time passed while the tracker was not looking
    Expired,
    /// The provider reported a different reset time
    Shifted,
}

impl ResetReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetReason::Drop => "consumption drop",
            ResetReason::Expired => "stored reset time passed",
            ResetReason::Shifted => "reported reset time changed",
        }
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized observation ready for detection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub at: DateTime<Utc>,
    pub consumed: f64,
    pub resets_at: Option<DateTime<Utc>>,
}

/// The state change a reading causes
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    /// No active cycle: open one at this reading
    Open {
        start: DateTime<Utc>,
        peak: f64,
        resets_at: Option<DateTime<Utc>>,
    },
    /// Same cycle: update bookkeeping on the active cycle
    Continue { cycle_id: i64, update: CycleUpdate },
    /// Close the active cycle at `end` and open a new one at this reading
    Reset {
        closing_id: i64,
        end: DateTime<Utc>,
        reason: ResetReason,
        start: DateTime<Utc>,
        peak: f64,
        resets_at: Option<DateTime<Utc>>,
    },
    /// Reading is not newer than the last sample applied to the cycle
    OutOfOrder { last_seen: DateTime<Utc> },
}

/// Decide what a reading does to the active cycle.
///
/// `use_reset_hints` enables the expired/shifted checks on provider reset
/// times; the drop rule always applies.
pub fn detect(active: Option<&Cycle>, reading: &Reading, use_reset_hints: bool) -> Transition {
    let cycle = match active {
        None => {
            return Transition::Open {
                start: reading.at,
                peak: reading.consumed,
                resets_at: future_reset(reading),
            }
        }
        Some(c) => c,
    };

    if reading.at <= cycle.last_seen {
        return Transition::OutOfOrder {
            last_seen: cycle.last_seen,
        };
    }

    let reason = if is_drop(cycle.peak, reading.consumed) {
        Some(ResetReason::Drop)
    } else if use_reset_hints {
        reset_hint(cycle, reading)
    } else {
        None
    };

    if let Some(reason) = reason {
        return Transition::Reset {
            closing_id: cycle.id,
            end: closing_boundary(cycle, reading, reason),
            reason,
            start: reading.at,
            peak: reading.consumed,
            resets_at: future_reset(reading),
        };
    }

    let peak = cycle.peak.max(reading.consumed);
    Transition::Continue {
        cycle_id: cycle.id,
        update: CycleUpdate {
            peak,
            total_delta: (peak - cycle.start_consumed).max(0.0),
            last_seen: reading.at,
            resets_at: cycle.resets_at.or_else(|| future_reset(reading)),
        },
    }
}

/// The drop rule shared by every counter kind
pub fn is_drop(peak: f64, consumed: f64) -> bool {
    peak > MIN_SIGNAL && consumed < peak * DROP_RATIO
}

fn reset_hint(cycle: &Cycle, reading: &Reading) -> Option<ResetReason> {
    let stored = cycle.resets_at?;
    let reported = reading.resets_at?;

    // A stale reported value still pointing at the stored time does not
    // confirm that the provider moved on.
    if reading.at > stored + Duration::minutes(RESET_GRACE_MINUTES) && reported > stored {
        return Some(ResetReason::Expired);
    }

    let shift = (reported - stored).num_seconds().abs();
    if shift > Duration::minutes(RESET_SHIFT_TOLERANCE_MINUTES).num_seconds() {
        return Some(ResetReason::Shifted);
    }

    None
}

/// The closed cycle ends at the previous sample. When the stored reset time
/// expired between the previous sample and this one, that time is the boundary.
fn closing_boundary(cycle: &Cycle, reading: &Reading, reason: ResetReason) -> DateTime<Utc> {
    match (reason, cycle.resets_at) {
        (ResetReason::Expired, Some(stored)) if stored > cycle.last_seen && stored < reading.at => {
            stored
        }
        _ => cycle.last_seen,
    }
}

/// Reset times already in the past are not worth storing
fn future_reset(reading: &Reading) -> Option<DateTime<Utc>> {
    reading.resets_at.filter(|r| *r > reading.at)
}

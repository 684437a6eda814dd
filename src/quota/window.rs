//! Short in-memory buffer of recent points for a quota key

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use crate::quota::models::WindowPoint;
use crate::quota::rate::before;

/// Points older than this, relative to the newest point, are dropped
pub const WINDOW_SPAN_MINUTES: i64 = 30;

/// Ordered `(timestamp, consumed)` points for the open cycle
#[derive(Debug, Clone, Default)]
pub struct TrackerWindow {
    points: VecDeque<WindowPoint>,
}

impl TrackerWindow {
    pub fn new() -> Self {
        Self::default()
    }

    fn span() -> Duration {
        Duration::minutes(WINDOW_SPAN_MINUTES)
    }

    /// Append a point and trim everything outside the span.
    /// Points not newer than the latest one are ignored.
    pub fn push(&mut self, point: WindowPoint) {
        if let Some(latest) = self.points.back() {
            if point.timestamp <= latest.timestamp {
                return;
            }
        }
        self.points.push_back(point);

        let cutoff = before(point.timestamp, Self::span());
        while let Some(front) = self.points.front() {
            if front.timestamp >= cutoff {
                break;
            }
            self.points.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Replace the contents, e.g. when rehydrating from persisted samples
    pub fn replace<I>(&mut self, points: I)
    where
        I: IntoIterator<Item = WindowPoint>,
    {
        self.points.clear();
        for point in points {
            self.push(point);
        }
    }

    /// Copy of the points at or after `since`, oldest first
    pub fn points_since(&self, since: DateTime<Utc>) -> Vec<WindowPoint> {
        self.points
            .iter()
            .filter(|p| p.timestamp >= since)
            .copied()
            .collect()
    }
}

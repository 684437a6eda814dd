//! Data models for quota cycle tracking

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Identifier combining a provider and a quota dimension, e.g. `anthropic/five_hour`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuotaKey {
    pub provider: String,
    pub quota: String,
}

impl QuotaKey {
    pub fn new(provider: impl Into<String>, quota: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            quota: quota.into(),
        }
    }
}

impl fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.quota)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid quota key: {0:?} (expected provider/quota)")]
pub struct ParseQuotaKeyError(pub String);

impl FromStr for QuotaKey {
    type Err = ParseQuotaKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('/') {
            Some((provider, quota)) if !provider.is_empty() && !quota.is_empty() => {
                Ok(QuotaKey::new(provider, quota))
            }
            _ => Err(ParseQuotaKeyError(s.to_string())),
        }
    }
}

impl Serialize for QuotaKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for QuotaKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// How a provider reports consumption for a quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterKind {
    /// Usage counter that grows while the period is open
    Increasing,
    /// Remaining balance that shrinks while the period is open
    Remaining,
    /// Utilization percentage (0-100)
    Percent,
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterKind::Increasing => write!(f, "increasing"),
            CounterKind::Remaining => write!(f, "remaining"),
            CounterKind::Percent => write!(f, "percent"),
        }
    }
}

/// Declares which raw fields carry a quota's value and limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSpec {
    pub kind: CounterKind,
    pub value_field: String,
    #[serde(default)]
    pub limit_field: Option<String>,
    /// Use provider-reported reset times to confirm resets
    #[serde(default = "default_reset_hints")]
    pub reset_hints: bool,
}

fn default_reset_hints() -> bool {
    true
}

impl CounterSpec {
    fn with_kind(kind: CounterKind, value_field: String, limit_field: Option<String>) -> Self {
        Self {
            kind,
            value_field,
            limit_field,
            reset_hints: default_reset_hints(),
        }
    }

    pub fn increasing(value_field: impl Into<String>) -> Self {
        Self::with_kind(CounterKind::Increasing, value_field.into(), None)
    }

    pub fn remaining(value_field: impl Into<String>, limit_field: impl Into<String>) -> Self {
        Self::with_kind(
            CounterKind::Remaining,
            value_field.into(),
            Some(limit_field.into()),
        )
    }

    pub fn percent(value_field: impl Into<String>) -> Self {
        Self::with_kind(CounterKind::Percent, value_field.into(), None)
    }

    pub fn with_limit_field(mut self, limit_field: impl Into<String>) -> Self {
        self.limit_field = Some(limit_field.into());
        self
    }
}

/// One polled observation of a quota
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSample {
    pub quota_key: QuotaKey,
    pub timestamp: DateTime<Utc>,
    /// Provider-specific raw fields
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub limit: Option<f64>,
    /// Provider-reported reset time (advisory, jitters across polls)
    #[serde(default)]
    pub resets_at: Option<DateTime<Utc>>,
}

impl QuotaSample {
    pub fn new(quota_key: QuotaKey, timestamp: DateTime<Utc>) -> Self {
        Self {
            quota_key,
            timestamp,
            fields: Map::new(),
            limit: None,
            resets_at: None,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_limit(mut self, limit: f64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_resets_at(mut self, resets_at: DateTime<Utc>) -> Self {
        self.resets_at = Some(resets_at);
        self
    }
}

/// Normalized reading derived from a sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedConsumption {
    pub consumed: f64,
    /// `None` when the limit is missing or not positive
    pub limit: Option<f64>,
}

impl NormalizedConsumption {
    /// Percentage of the limit consumed, if the limit is known
    pub fn percent(&self) -> Option<f64> {
        usage_percent(self.consumed, self.limit)
    }
}

/// `consumed / limit * 100`, or `None` when the limit cannot be used
pub fn usage_percent(consumed: f64, limit: Option<f64>) -> Option<f64> {
    let limit = limit.filter(|l| l.is_finite() && *l > 0.0)?;
    let pct = consumed / limit * 100.0;
    pct.is_finite().then_some(pct)
}

/// A `(timestamp, consumed)` pair used for rate computation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowPoint {
    pub timestamp: DateTime<Utc>,
    pub consumed: f64,
}

impl WindowPoint {
    pub fn new(timestamp: DateTime<Utc>, consumed: f64) -> Self {
        Self { timestamp, consumed }
    }
}

/// One detected accounting period for a quota key
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cycle {
    pub id: i64,
    pub quota_key: QuotaKey,
    pub start: DateTime<Utc>,
    /// `None` while the cycle is active
    pub end: Option<DateTime<Utc>>,
    pub peak: f64,
    /// Consumption observed by the sample that opened the cycle
    pub start_consumed: f64,
    pub total_delta: f64,
    pub resets_at: Option<DateTime<Utc>>,
    /// Timestamp of the last sample applied to this cycle
    pub last_seen: DateTime<Utc>,
}

impl Cycle {
    pub fn is_active(&self) -> bool {
        self.end.is_none()
    }
}

/// Fields written by a continuation update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleUpdate {
    pub peak: f64,
    pub total_delta: f64,
    pub last_seen: DateTime<Utc>,
    pub resets_at: Option<DateTime<Utc>>,
}

/// A true provider accounting period reconstructed from adjacent cycles
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub max_peak: f64,
    pub cycle_count: usize,
}

/// Where a rate estimate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RateSource {
    /// Oldest/newest points of the short tracker window
    Window,
    /// Total tracked consumption over the whole tracked history
    CycleAverage,
}

/// Consumption rate per hour
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateEstimate {
    pub per_hour: f64,
    pub source: RateSource,
}

/// Forward projection of a rate against a limit and a reset time
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Forecast {
    /// Consumption expected at reset time
    pub projected: Option<f64>,
    /// Hours until the limit is reached at the current rate
    pub exhaustion_hours: Option<f64>,
    pub exhausts_first: bool,
}

/// Current rate and projection for a quota key
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Projection {
    pub quota_key: QuotaKey,
    pub as_of: DateTime<Utc>,
    pub current: Option<f64>,
    pub limit: Option<f64>,
    pub percent: Option<f64>,
    pub rate: Option<RateEstimate>,
    pub resets_at: Option<DateTime<Utc>>,
    pub hours_until_reset: Option<f64>,
    pub projected: Option<f64>,
    pub projected_percent: Option<f64>,
    pub exhaustion_hours: Option<f64>,
    pub exhausts_at: Option<DateTime<Utc>>,
    pub exhausts_first: bool,
}

//! Classification of usage, trends and forecasts into severity-tagged insights

use serde::Serialize;

use crate::quota::models::{BillingPeriod, Projection};
use crate::quota::periods::{recent_vs_older, BillingRollup};

/// Minimum number of billing periods for a trend insight
pub const MIN_TREND_PERIODS: usize = 4;
/// Minimum number of billing periods for a variance insight
pub const MIN_VARIANCE_PERIODS: usize = 2;

/// Trend change beyond this percentage counts as rising or falling
pub const TREND_THRESHOLD_PERCENT: f64 = 15.0;
/// Rates below this per hour are treated as idle
pub const IDLE_RATE_PER_HOUR: f64 = 0.01;
/// Projected usage above this percentage is flagged
pub const HIGH_PROJECTION_PERCENT: f64 = 80.0;

/// Days summed for the weekly pace
pub const PACE_WINDOW_DAYS: i64 = 7;
/// Days the weekly pace is compared against and projected to
pub const PACE_MONTH_DAYS: i64 = 30;
/// Monthly projection above this share of the monthly capacity is flagged
pub const PACE_WARNING_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Positive,
    Info,
    Warning,
    Negative,
}

/// Current usage level of a quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UsageLevel {
    Healthy,
    Warning,
    Danger,
    Critical,
}

impl UsageLevel {
    pub fn severity(&self) -> Severity {
        match self {
            UsageLevel::Healthy => Severity::Positive,
            UsageLevel::Warning => Severity::Info,
            UsageLevel::Danger => Severity::Warning,
            UsageLevel::Critical => Severity::Negative,
        }
    }
}

pub fn classify_usage(percent: f64) -> UsageLevel {
    if percent >= 95.0 {
        UsageLevel::Critical
    } else if percent >= 80.0 {
        UsageLevel::Danger
    } else if percent >= 50.0 {
        UsageLevel::Warning
    } else {
        UsageLevel::Healthy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Trend {
    Rising,
    Falling,
    Stable,
}

impl Trend {
    pub fn severity(&self) -> Severity {
        match self {
            Trend::Rising => Severity::Warning,
            Trend::Falling | Trend::Stable => Severity::Positive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendInsight {
    pub trend: Trend,
    pub change_percent: f64,
    pub recent_avg: f64,
    pub older_avg: f64,
}

/// Compare recent and older averages. Undefined when the older average is not positive.
pub fn classify_trend(recent_avg: f64, older_avg: f64) -> Option<TrendInsight> {
    if older_avg <= 0.0 || !recent_avg.is_finite() || !older_avg.is_finite() {
        return None;
    }

    let change_percent = (recent_avg - older_avg) / older_avg * 100.0;
    let trend = if change_percent > TREND_THRESHOLD_PERCENT {
        Trend::Rising
    } else if change_percent < -TREND_THRESHOLD_PERCENT {
        Trend::Falling
    } else {
        Trend::Stable
    };

    Some(TrendInsight {
        trend,
        change_percent,
        recent_avg,
        older_avg,
    })
}

/// Trend over billing periods (oldest first)
pub fn trend_from_periods(periods: &[BillingPeriod]) -> Option<TrendInsight> {
    if periods.len() < MIN_TREND_PERIODS {
        return None;
    }
    let (recent, older) = recent_vs_older(periods)?;
    classify_trend(recent, older)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Variance {
    HighVariance,
    ModerateSpread,
    Consistent,
}

impl Variance {
    pub fn severity(&self) -> Severity {
        match self {
            Variance::HighVariance => Severity::Warning,
            Variance::ModerateSpread => Severity::Info,
            Variance::Consistent => Severity::Positive,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Variance::HighVariance => "High Variance",
            Variance::ModerateSpread => "Usage Spread",
            Variance::Consistent => "Consistent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VarianceInsight {
    pub variance: Variance,
    pub diff_percent: f64,
    pub peak: f64,
    pub average: f64,
}

/// How far the peak period sits above the average. Undefined when the average is not positive.
pub fn classify_variance(peak: f64, average: f64) -> Option<VarianceInsight> {
    if average <= 0.0 || !peak.is_finite() || !average.is_finite() {
        return None;
    }

    let diff_percent = (peak - average) / average * 100.0;
    let variance = if diff_percent > 50.0 {
        Variance::HighVariance
    } else if diff_percent > 10.0 {
        Variance::ModerateSpread
    } else {
        Variance::Consistent
    };

    Some(VarianceInsight {
        variance,
        diff_percent,
        peak,
        average,
    })
}

pub fn variance_from_periods(periods: &[BillingPeriod]) -> Option<VarianceInsight> {
    if periods.len() < MIN_VARIANCE_PERIODS {
        return None;
    }
    let rollup = BillingRollup::from_periods(periods);
    classify_variance(rollup.max, rollup.average)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaceInsight {
    pub week_sum: f64,
    pub month_sum: f64,
    /// Share of the 30-day total consumed in the last 7 days
    pub week_share_percent: Option<f64>,
    /// Weekly sum extrapolated to 30 days
    pub projected_month: f64,
    pub severity: Severity,
}

/// Weekly pace from period sums over the last 7 and 30 days.
///
/// Flagged when the monthly projection exceeds 80% of `limit * cycles`, where
/// `cycles` is the number of cycles in the 30-day range. Undefined without
/// consumption in the last week.
pub fn classify_weekly_pace(
    week_sum: f64,
    month_sum: f64,
    limit: Option<f64>,
    cycles: usize,
) -> Option<PaceInsight> {
    if week_sum <= 0.0 || !week_sum.is_finite() {
        return None;
    }

    let projected_month = week_sum * PACE_MONTH_DAYS as f64 / PACE_WINDOW_DAYS as f64;
    let week_share_percent = (month_sum > 0.0).then(|| week_sum / month_sum * 100.0);

    let capacity = limit
        .filter(|l| *l > 0.0 && cycles > 0)
        .map(|l| l * cycles as f64);
    let severity = match capacity {
        Some(capacity) if projected_month > capacity * PACE_WARNING_RATIO => Severity::Warning,
        _ => Severity::Info,
    };

    Some(PaceInsight {
        week_sum,
        month_sum,
        week_share_percent,
        projected_month,
        severity,
    })
}

/// How well the average billing period fits the limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CycleUtilization {
    UnderUtilized,
    Comfortable,
    WellFitted,
    NearLimit,
    AtLimit,
}

impl CycleUtilization {
    pub fn severity(&self) -> Severity {
        match self {
            CycleUtilization::UnderUtilized => Severity::Warning,
            CycleUtilization::Comfortable => Severity::Info,
            CycleUtilization::WellFitted => Severity::Positive,
            CycleUtilization::NearLimit => Severity::Warning,
            CycleUtilization::AtLimit => Severity::Negative,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            CycleUtilization::UnderUtilized => "Most of the quota goes unused each period.",
            CycleUtilization::Comfortable => "Usage leaves comfortable headroom.",
            CycleUtilization::WellFitted => "Usage fits the quota well.",
            CycleUtilization::NearLimit => "Periods regularly come close to the limit.",
            CycleUtilization::AtLimit => "Periods regularly hit the limit.",
        }
    }
}

/// Classify the average period peak against the limit. `None` without a usable limit.
pub fn classify_cycle_utilization(
    average: f64,
    limit: Option<f64>,
) -> Option<(CycleUtilization, f64)> {
    let percent = crate::quota::models::usage_percent(average, limit)?;

    let level = if percent < 25.0 {
        CycleUtilization::UnderUtilized
    } else if percent < 50.0 {
        CycleUtilization::Comfortable
    } else if percent < 80.0 {
        CycleUtilization::WellFitted
    } else if percent < 95.0 {
        CycleUtilization::NearLimit
    } else {
        CycleUtilization::AtLimit
    };

    Some((level, percent))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ForecastStatus {
    /// Not enough data for a rate yet
    Analyzing,
    Idle,
    ExhaustsBeforeReset,
    HighProjected,
    Comfortable,
}

impl ForecastStatus {
    pub fn severity(&self) -> Severity {
        match self {
            ForecastStatus::Analyzing | ForecastStatus::Idle => Severity::Info,
            ForecastStatus::ExhaustsBeforeReset => Severity::Negative,
            ForecastStatus::HighProjected => Severity::Warning,
            ForecastStatus::Comfortable => Severity::Positive,
        }
    }
}

pub fn classify_forecast(projection: &Projection) -> ForecastStatus {
    let rate = match &projection.rate {
        None => return ForecastStatus::Analyzing,
        Some(rate) => rate,
    };

    if rate.per_hour < IDLE_RATE_PER_HOUR {
        ForecastStatus::Idle
    } else if projection.exhausts_first {
        ForecastStatus::ExhaustsBeforeReset
    } else if projection
        .projected_percent
        .map_or(false, |p| p > HIGH_PROJECTION_PERCENT)
    {
        ForecastStatus::HighProjected
    } else {
        ForecastStatus::Comfortable
    }
}

/// Kind of insight card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightKind {
    Factual,
    Trend,
    Recommendation,
    Info,
}

/// One presentation-ready insight
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightItem {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: InsightKind,
    pub severity: Severity,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sublabel: Option<String>,
    pub description: String,
}

//! Read-side commands returning presentation-ready structures

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::quota::insights::{
    classify_cycle_utilization, classify_forecast, classify_usage, classify_weekly_pace,
    trend_from_periods, variance_from_periods, ForecastStatus, InsightItem, InsightKind, Severity,
    Trend, UsageLevel, PACE_MONTH_DAYS, PACE_WINDOW_DAYS,
};
use crate::quota::models::{BillingPeriod, Cycle, Projection, QuotaKey};
use crate::quota::periods::{group_billing_periods, sum_since, BillingRollup};
use crate::quota::rate::before;
use crate::quota::tracker::QuotaTracker;

/// Current state of one quota
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    pub quota_key: QuotaKey,
    pub projection: Projection,
    pub usage_level: Option<UsageLevel>,
    pub severity: Option<Severity>,
    pub active_cycle: Option<Cycle>,
    /// Cycles started within the tracker lookback, active included
    pub cycle_count: usize,
    pub billing_period_count: usize,
}

/// Billing periods and their rollups
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingRollupView {
    pub quota_key: QuotaKey,
    pub as_of: DateTime<Utc>,
    pub since: DateTime<Utc>,
    pub periods: Vec<BillingPeriod>,
    pub rollup: BillingRollup,
    pub window_start: DateTime<Utc>,
    /// Sum of period peaks started at or after `window_start`
    pub window_sum: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaInsights {
    pub quota_key: QuotaKey,
    pub as_of: DateTime<Utc>,
    pub items: Vec<InsightItem>,
}

/// Get current usage, rate and forecast for a quota
pub fn get_quota_status(
    tracker: &QuotaTracker,
    key: &QuotaKey,
    now: DateTime<Utc>,
) -> Result<QuotaStatus, String> {
    let projection = tracker.projection(key, now).map_err(|e| e.to_string())?;
    let active_cycle = tracker.active_cycle(key).map_err(|e| e.to_string())?;
    let cycles = tracker
        .cycles_since(key, before(now, tracker.lookback()))
        .map_err(|e| e.to_string())?;
    let periods = group_billing_periods(&cycles);

    let usage_level = projection.percent.map(classify_usage);

    Ok(QuotaStatus {
        quota_key: key.clone(),
        usage_level,
        severity: usage_level.map(|l| l.severity()),
        active_cycle,
        cycle_count: cycles.len(),
        billing_period_count: periods.len(),
        projection,
    })
}

/// Get billing periods since `since`, with totals over the whole range and since `window_start`
pub fn get_billing_rollup(
    tracker: &QuotaTracker,
    key: &QuotaKey,
    since: DateTime<Utc>,
    window_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<BillingRollupView, String> {
    let periods = tracker
        .billing_periods(key, since)
        .map_err(|e| e.to_string())?;

    Ok(BillingRollupView {
        quota_key: key.clone(),
        as_of: now,
        since,
        rollup: BillingRollup::from_periods(&periods),
        window_start,
        window_sum: sum_since(&periods, window_start),
        periods,
    })
}

/// Get insight cards for a quota
pub fn get_quota_insights(
    tracker: &QuotaTracker,
    key: &QuotaKey,
    now: DateTime<Utc>,
) -> Result<QuotaInsights, String> {
    let projection = tracker.projection(key, now).map_err(|e| e.to_string())?;
    let periods = tracker
        .billing_periods(key, before(now, tracker.lookback()))
        .map_err(|e| e.to_string())?;

    let mut items = Vec::new();

    if projection.current.is_none() && periods.is_empty() {
        items.push(InsightItem {
            key: "getting_started".to_string(),
            kind: InsightKind::Info,
            severity: Severity::Info,
            title: "Getting Started".to_string(),
            metric: None,
            sublabel: None,
            description: format!(
                "Keep the tracker running to collect {} usage data. Insights will appear after a few samples.",
                key
            ),
        });
        return Ok(QuotaInsights {
            quota_key: key.clone(),
            as_of: now,
            items,
        });
    }

    items.push(forecast_item(&projection));

    let rollup = BillingRollup::from_periods(&periods);
    // The newest period is usually still open, so utilization uses completed ones when possible.
    let completed = if periods.len() > 1 {
        &periods[..periods.len() - 1]
    } else {
        &periods[..]
    };
    let completed_avg = BillingRollup::from_periods(completed).average;
    if let Some((level, percent)) = classify_cycle_utilization(completed_avg, projection.limit) {
        items.push(InsightItem {
            key: "cycle_utilization".to_string(),
            kind: InsightKind::Recommendation,
            severity: level.severity(),
            title: "Avg Cycle Utilization".to_string(),
            metric: Some(format!("{:.0}%", percent)),
            sublabel: projection
                .limit
                .map(|l| format!("of {:.0} limit/cycle", l)),
            description: format!(
                "Average period peak is {:.0} across {} {}. {}",
                completed_avg,
                completed.len(),
                plural(completed.len(), "period", "periods"),
                level.description()
            ),
        });
    }

    if let Some(item) = weekly_pace_item(tracker, key, projection.limit, now)? {
        items.push(item);
    }

    if let Some(variance) = variance_from_periods(&periods) {
        items.push(InsightItem {
            key: "variance".to_string(),
            kind: InsightKind::Factual,
            severity: variance.variance.severity(),
            title: variance.variance.title().to_string(),
            metric: Some(format!("+{:.0}%", variance.diff_percent)),
            sublabel: Some("peak above avg".to_string()),
            description: format!(
                "Peak period reached {:.0} against an average of {:.0} over {} periods.",
                variance.peak, variance.average, rollup.count
            ),
        });
    }

    if let Some(trend) = trend_from_periods(&periods) {
        let description = match trend.trend {
            Trend::Rising => format!(
                "Recent periods peak at {:.0} on average, up from {:.0}.",
                trend.recent_avg, trend.older_avg
            ),
            Trend::Falling => format!(
                "Recent periods peak at {:.0} on average, down from {:.0}.",
                trend.recent_avg, trend.older_avg
            ),
            Trend::Stable => format!(
                "Usage is steady at about {:.0} per period.",
                (trend.recent_avg + trend.older_avg) / 2.0
            ),
        };
        items.push(InsightItem {
            key: "trend".to_string(),
            kind: InsightKind::Trend,
            severity: trend.trend.severity(),
            title: "Trend".to_string(),
            metric: Some(format!("{:+.0}%", trend.change_percent)),
            sublabel: Some("recent vs earlier".to_string()),
            description,
        });
    }

    Ok(QuotaInsights {
        quota_key: key.clone(),
        as_of: now,
        items,
    })
}

/// Get completed cycles, newest first
pub fn get_cycle_history(
    tracker: &QuotaTracker,
    key: &QuotaKey,
    limit: usize,
) -> Result<Vec<Cycle>, String> {
    tracker.cycle_history(key, limit).map_err(|e| e.to_string())
}

/// Last-7-days consumption against the 30-day total, projected to a month
fn weekly_pace_item(
    tracker: &QuotaTracker,
    key: &QuotaKey,
    limit: Option<f64>,
    now: DateTime<Utc>,
) -> Result<Option<InsightItem>, String> {
    let cycles = tracker
        .cycles_since(key, before(now, Duration::days(PACE_MONTH_DAYS)))
        .map_err(|e| e.to_string())?;
    let periods = group_billing_periods(&cycles);

    let week_sum = sum_since(&periods, before(now, Duration::days(PACE_WINDOW_DAYS)));
    let month_sum = BillingRollup::from_periods(&periods).sum;

    let Some(pace) = classify_weekly_pace(week_sum, month_sum, limit, cycles.len()) else {
        return Ok(None);
    };

    let mut description = format!("{:.0} consumed this week", pace.week_sum);
    if let Some(share) = pace.week_share_percent {
        description.push_str(&format!(
            " ({:.0}% of 30-day total). Monthly projection: ~{:.0}.",
            share, pace.projected_month
        ));
    }

    Ok(Some(InsightItem {
        key: "weekly_pace".to_string(),
        kind: InsightKind::Trend,
        severity: pace.severity,
        title: "Weekly Pace".to_string(),
        metric: Some(format!("{:.0}", pace.week_sum)),
        sublabel: Some("last 7 days".to_string()),
        description,
    }))
}

fn forecast_item(projection: &Projection) -> InsightItem {
    let status = classify_forecast(projection);
    let current = projection.percent.unwrap_or_default();
    let per_hour = projection.rate.map(|r| r.per_hour).unwrap_or_default();
    let reset_in = projection.hours_until_reset.map(format_hours);

    let (metric, sublabel, description) = match status {
        ForecastStatus::Analyzing => (
            "Analyzing...".to_string(),
            Some("burn rate & forecast".to_string()),
            format!(
                "Collecting usage patterns to calculate burn rate and exhaustion forecasts. Currently at {:.0}%.",
                current
            ),
        ),
        ForecastStatus::Idle => (
            "Idle".to_string(),
            reset_in
                .map(|r| format!("resets in {}", r))
                .or_else(|| Some("no activity".to_string())),
            format!("No consumption detected recently. Currently at {:.0}%.", current),
        ),
        ForecastStatus::ExhaustsBeforeReset => {
            let exhausts = projection
                .exhaustion_hours
                .map(format_hours)
                .unwrap_or_else(|| "now".to_string());
            (
                format!("{:.1}/hr", per_hour),
                Some(format!("exhausts in {}", exhausts)),
                match reset_in {
                    Some(r) => format!(
                        "At the current rate the quota runs out in {}, before it resets in {}.",
                        exhausts, r
                    ),
                    None => format!("At the current rate the quota runs out in {}.", exhausts),
                },
            )
        }
        ForecastStatus::HighProjected => {
            let projected = projection.projected_percent.unwrap_or_default();
            (
                format!("{:.1}/hr", per_hour),
                Some(match reset_in {
                    Some(r) => format!("~{:.0}% at reset in {}", projected, r),
                    None => format!("projected ~{:.0}%", projected),
                }),
                format!(
                    "Consuming {:.1}/hr. Projected ~{:.0}% at reset.",
                    per_hour, projected
                ),
            )
        }
        ForecastStatus::Comfortable => (
            format!("{:.1}/hr", per_hour),
            reset_in
                .map(|r| format!("resets in {}", r))
                .or_else(|| Some("comfortable headroom".to_string())),
            format!("Consuming {:.1}/hr with comfortable headroom.", per_hour),
        ),
    };

    InsightItem {
        key: "forecast".to_string(),
        kind: InsightKind::Recommendation,
        severity: status.severity(),
        title: "Burn Rate".to_string(),
        metric: Some(metric),
        sublabel,
        description,
    }
}

/// Format fractional hours as e.g. `2h 50m` or `45m`
fn format_hours(hours: f64) -> String {
    let total_minutes = (hours.max(0.0) * 60.0).round() as i64;
    let (h, m) = (total_minutes / 60, total_minutes % 60);
    match (h, m) {
        (0, m) => format!("{}m", m),
        (h, 0) => format!("{}h", h),
        (h, m) => format!("{}h {}m", h, m),
    }
}

fn plural<'a>(n: usize, one: &'a str, many: &'a str) -> &'a str {
    if n == 1 {
        one
    } else {
        many
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::models::{CounterSpec, QuotaSample};
    use crate::quota::store::MemoryCycleStore;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 3, 6, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn key() -> QuotaKey {
        QuotaKey::new("anthropic", "five_hour")
    }

    fn tracker() -> QuotaTracker {
        let tracker = QuotaTracker::new(Arc::new(MemoryCycleStore::new()));
        tracker
            .register(key(), CounterSpec::percent("utilization"))
            .unwrap();
        tracker
    }

    fn ingest(tracker: &QuotaTracker, minute: i64, utilization: f64) {
        let sample = QuotaSample::new(key(), at(minute)).with_field("utilization", utilization);
        tracker.ingest(&sample).unwrap();
    }

    #[test]
    fn test_format_hours() {
        assert_eq!(format_hours(2.8333), "2h 50m");
        assert_eq!(format_hours(0.75), "45m");
        assert_eq!(format_hours(3.0), "3h");
    }

    #[test]
    fn test_empty_quota_gets_started_item() {
        let insights = get_quota_insights(&tracker(), &key(), at(0)).unwrap();
        assert_eq!(insights.items.len(), 1);
        assert_eq!(insights.items[0].title, "Getting Started");
    }

    #[test]
    fn test_status_reports_usage_level() {
        let tracker = tracker();
        ingest(&tracker, 0, 70.0);
        ingest(&tracker, 10, 82.0);

        let status = get_quota_status(&tracker, &key(), at(10)).unwrap();
        assert_eq!(status.usage_level, Some(UsageLevel::Danger));
        assert_eq!(status.severity, Some(Severity::Warning));
        assert_eq!(status.cycle_count, 1);
        assert_eq!(status.billing_period_count, 1);
        assert!(status.active_cycle.is_some());
        assert!((status.projection.rate.unwrap().per_hour - 72.0).abs() < 1e-9);
    }

    #[test]
    fn test_rollup_and_insights_over_periods() {
        let tracker = tracker();
        // Each cycle starts near zero and climbs to its peak. A low cycle
        // after a high one starts a new billing period.
        let peaks = [20.0, 8.0, 20.0, 8.0, 60.0, 25.0, 60.0];
        for (i, peak) in peaks.iter().enumerate() {
            let base = i as i64 * 300;
            ingest(&tracker, base, 1.0);
            ingest(&tracker, base + 60, *peak);
        }

        let view = get_billing_rollup(&tracker, &key(), at(0), at(900), at(1900)).unwrap();
        let maxima: Vec<f64> = view.periods.iter().map(|p| p.max_peak).collect();
        assert_eq!(maxima, vec![20.0, 20.0, 60.0, 60.0]);
        assert_eq!(view.rollup.count, 4);
        assert_eq!(view.rollup.max, 60.0);
        assert_eq!(view.window_sum, 120.0);

        let insights = get_quota_insights(&tracker, &key(), at(1900)).unwrap();
        let keys: Vec<&str> = insights.items.iter().map(|i| i.key.as_str()).collect();
        assert!(keys.contains(&"forecast"));
        assert!(keys.contains(&"cycle_utilization"));
        assert!(keys.contains(&"variance"));

        // 160 over the week projects to ~686 a month, above 80% of 7 cycles x 100.
        let pace = insights.items.iter().find(|i| i.key == "weekly_pace").unwrap();
        assert_eq!(pace.metric.as_deref(), Some("160"));
        assert_eq!(pace.severity, Severity::Warning);
        assert!(pace.description.contains("100% of 30-day total"));

        let trend = insights.items.iter().find(|i| i.key == "trend").unwrap();
        assert_eq!(trend.severity, Severity::Warning);

        let history = get_cycle_history(&tracker, &key(), 3).unwrap();
        assert_eq!(history.len(), 3);
        assert!(history[0].start > history[1].start);
    }

    #[test]
    fn test_weekly_pace_needs_recent_consumption() {
        let tracker = tracker();
        let ten_days = 10 * 24 * 60;
        ingest(&tracker, -ten_days, 1.0);
        ingest(&tracker, -ten_days + 60, 50.0);

        let insights = get_quota_insights(&tracker, &key(), at(0)).unwrap();
        assert!(insights.items.iter().all(|i| i.key != "weekly_pace"));
        assert!(insights.items.iter().any(|i| i.key == "forecast"));
    }

    #[test]
    fn test_two_periods_report_variance() {
        let tracker = tracker();
        for (i, peak) in [40.0, 8.0, 80.0].iter().enumerate() {
            let base = i as i64 * 300;
            ingest(&tracker, base, 1.0);
            ingest(&tracker, base + 60, *peak);
        }

        let view = get_billing_rollup(&tracker, &key(), at(0), at(0), at(700)).unwrap();
        assert_eq!(view.rollup.count, 2);

        let insights = get_quota_insights(&tracker, &key(), at(700)).unwrap();
        let variance = insights.items.iter().find(|i| i.key == "variance").unwrap();
        assert_eq!(variance.title, "Usage Spread");
        assert!(insights.items.iter().all(|i| i.key != "trend"));
    }
}

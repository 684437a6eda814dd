//! Sample normalization: provider-specific raw fields to a comparable consumption scalar

use serde_json::{Map, Value};
use thiserror::Error;

use crate::quota::models::{CounterKind, CounterSpec, NormalizedConsumption, QuotaSample};

/// Implicit limit of utilization-percentage counters
pub const PERCENT_LIMIT: f64 = 100.0;

/// Error type for normalization. A sample that fails is discarded.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizeError {
    #[error("missing field: {0}")]
    MissingField(String),
    #[error("field {field} is not numeric: {value}")]
    NotNumeric { field: String, value: String },
    #[error("field {0} is not a finite number")]
    NonFinite(String),
    #[error("remaining counter {0} has no usable limit")]
    UnknownLimit(String),
}

/// Convert a raw sample into `(consumed, limit)` according to the quota's counter spec
pub fn normalize(
    spec: &CounterSpec,
    sample: &QuotaSample,
) -> Result<NormalizedConsumption, NormalizeError> {
    let raw = read_number(&sample.fields, &spec.value_field)?;
    let limit = resolve_limit(spec, sample)?;

    let consumed = match spec.kind {
        CounterKind::Increasing | CounterKind::Percent => raw,
        CounterKind::Remaining => {
            let limit =
                limit.ok_or_else(|| NormalizeError::UnknownLimit(spec.value_field.clone()))?;
            limit - raw
        }
    };

    Ok(NormalizedConsumption {
        consumed: consumed.max(0.0),
        limit,
    })
}

/// Treat missing, zero, negative or non-finite limits as unknown
pub fn usable_limit(limit: f64) -> Option<f64> {
    (limit.is_finite() && limit > 0.0).then_some(limit)
}

/// Limit priority: explicit sample limit, then the configured limit field.
/// Percentage counters always use 100.
fn resolve_limit(
    spec: &CounterSpec,
    sample: &QuotaSample,
) -> Result<Option<f64>, NormalizeError> {
    if spec.kind == CounterKind::Percent {
        return Ok(Some(PERCENT_LIMIT));
    }

    if let Some(limit) = sample.limit {
        return Ok(usable_limit(limit));
    }

    match &spec.limit_field {
        Some(field) if sample.fields.contains_key(field) => {
            Ok(usable_limit(read_number(&sample.fields, field)?))
        }
        _ => Ok(None),
    }
}

/// Read a numeric field. Providers encode int64 values as strings, so numeric
/// strings are accepted too.
fn read_number(fields: &Map<String, Value>, name: &str) -> Result<f64, NormalizeError> {
    let value = match fields.get(name) {
        None | Some(Value::Null) => return Err(NormalizeError::MissingField(name.to_string())),
        Some(v) => v,
    };

    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| NormalizeError::NotNumeric {
        field: name.to_string(),
        value: value.to_string(),
    })?;

    if !number.is_finite() {
        return Err(NormalizeError::NonFinite(name.to_string()));
    }

    Ok(number)
}

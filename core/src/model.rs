//! The metric model shared by the agent and the server.
//!
//! A metric is either a *gauge* (last write wins) or a *counter* (values are
//! summed). The wire representation mirrors the JSON shape used by both the
//! path-form and JSON-form HTTP endpoints: `{"id": "...", "type": "gauge" |
//! "counter", "value": f64, "delta": i64}`, exactly one of `value`/`delta`
//! present depending on `type`.

use serde::{Deserialize, Serialize};

use crate::errors::ModelError;

pub const KIND_GAUGE: &str = "gauge";
pub const KIND_COUNTER: &str = "counter";

/// A single metric observation, already validated.
#[derive(Debug, Clone, PartialEq)]
pub enum Metric {
    Gauge { name: String, value: f64 },
    Counter { name: String, delta: i64 },
}

impl Metric {
    pub fn name(&self) -> &str {
        match self {
            Metric::Gauge { name, .. } => name,
            Metric::Counter { name, .. } => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Metric::Gauge { .. } => KIND_GAUGE,
            Metric::Counter { .. } => KIND_COUNTER,
        }
    }
}

/// The raw wire shape, prior to validation. Mirrors the Go original's
/// `Metrics` struct field-for-field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMetric {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
}

impl WireMetric {
    pub fn from_metric(metric: &Metric) -> Self {
        match metric {
            Metric::Gauge { name, value } => WireMetric {
                id: name.clone(),
                kind: KIND_GAUGE.to_string(),
                value: Some(*value),
                delta: None,
            },
            Metric::Counter { name, delta } => WireMetric {
                id: name.clone(),
                kind: KIND_COUNTER.to_string(),
                value: None,
                delta: Some(*delta),
            },
        }
    }
}

impl TryFrom<WireMetric> for Metric {
    type Error = ModelError;

    fn try_from(wire: WireMetric) -> Result<Self, Self::Error> {
        if wire.id.is_empty() {
            return Err(ModelError::EmptyField);
        }
        if wire.value.is_some() && wire.delta.is_some() {
            return Err(ModelError::BothValueAndDelta);
        }
        match wire.kind.as_str() {
            KIND_GAUGE => {
                let value = wire.value.ok_or(ModelError::EmptyField)?;
                Ok(Metric::Gauge {
                    name: wire.id,
                    value,
                })
            }
            KIND_COUNTER => {
                let delta = wire.delta.ok_or(ModelError::EmptyField)?;
                Ok(Metric::Counter {
                    name: wire.id,
                    delta,
                })
            }
            "" => Err(ModelError::EmptyField),
            _ => Err(ModelError::WrongType),
        }
    }
}

/// Validates and converts the four path-form components of
/// `/update/{kind}/{name}/{value}`, reproducing the Go original's
/// `ValidateAndConvert` ordering precisely: a GET request coerces the value
/// to `"0"` before anything else is checked, then empty fields are rejected,
/// then an unknown kind, then a value that does not parse as a float.
pub fn validate_and_convert(
    is_get: bool,
    kind: &str,
    name: &str,
    raw_value: &str,
) -> Result<Metric, ModelError> {
    let raw_value = if is_get { "0" } else { raw_value };

    if kind.is_empty() || name.is_empty() || raw_value.is_empty() {
        return Err(ModelError::EmptyField);
    }
    if kind != KIND_GAUGE && kind != KIND_COUNTER {
        return Err(ModelError::WrongType);
    }
    let value: f64 = raw_value.parse().map_err(|_| ModelError::ValueNotFloat)?;

    if kind == KIND_GAUGE {
        Ok(Metric::Gauge {
            name: name.to_string(),
            value,
        })
    } else {
        Ok(Metric::Counter {
            name: name.to_string(),
            delta: value as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_and_convert_rejects_empty_fields() {
        let err = validate_and_convert(false, KIND_GAUGE, "", "1").unwrap_err();
        assert_eq!(err, ModelError::EmptyField);
    }

    #[test]
    fn validate_and_convert_rejects_non_float_value() {
        let err = validate_and_convert(false, KIND_GAUGE, "a", "x").unwrap_err();
        assert_eq!(err, ModelError::ValueNotFloat);
    }

    #[test]
    fn validate_and_convert_rejects_unknown_kind() {
        let err = validate_and_convert(false, "foo", "a", "1").unwrap_err();
        assert_eq!(err, ModelError::WrongType);
    }

    #[test]
    fn validate_and_convert_get_coerces_value_to_zero() {
        let metric = validate_and_convert(true, KIND_COUNTER, "PollCount", "ignored").unwrap();
        assert_eq!(metric, Metric::Counter { name: "PollCount".into(), delta: 0 });
    }

    #[test]
    fn wire_metric_round_trips_gauge() {
        let metric = Metric::Gauge { name: "Alloc".into(), value: 42.5 };
        let wire = WireMetric::from_metric(&metric);
        let back: Metric = wire.try_into().unwrap();
        assert_eq!(back, metric);
    }

    #[test]
    fn wire_metric_rejects_both_value_and_delta() {
        let wire = WireMetric {
            id: "x".into(),
            kind: KIND_GAUGE.into(),
            value: Some(1.0),
            delta: Some(99),
        };
        let err: ModelError = Metric::try_from(wire).unwrap_err();
        assert_eq!(err, ModelError::BothValueAndDelta);
    }

    #[test]
    fn wire_metric_rejects_unknown_type() {
        let wire = WireMetric { id: "x".into(), kind: "histogram".into(), value: None, delta: None };
        let err: ModelError = Metric::try_from(wire).unwrap_err();
        assert_eq!(err, ModelError::WrongType);
    }
}

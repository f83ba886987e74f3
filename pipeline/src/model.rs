use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::errors::ValidationFailure;

/// Declared data kind of a metric. A metric's kind is immutable once
/// telemetry references it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Numeric,
    Boolean,
    #[serde(rename = "string")]
    Text,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Numeric => write!(f, "numeric"),
            MetricKind::Boolean => write!(f, "boolean"),
            MetricKind::Text => write!(f, "string"),
        }
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "numeric" => Ok(MetricKind::Numeric),
            "boolean" => Ok(MetricKind::Boolean),
            "string" => Ok(MetricKind::Text),
            _ => Err(format!("unknown metric kind: {s}")),
        }
    }
}

/// A metric value tagged with its kind. Exactly one variant is populated
/// per telemetry row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricValue {
    Numeric(Decimal),
    Boolean(bool),
    #[serde(rename = "string")]
    Text(String),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Numeric(_) => MetricKind::Numeric,
            MetricValue::Boolean(_) => MetricKind::Boolean,
            MetricValue::Text(_) => MetricKind::Text,
        }
    }
}

/// Converts a raw JSON value into a typed [`MetricValue`] under strict rules.
///
/// Booleans are never accepted for numeric or string metrics, and numbers
/// parse through their literal text into [`Decimal`] rather than through f64,
/// so no silent coercion or rounding can occur.
pub fn typed_value(
    kind: MetricKind,
    raw: &serde_json::Value,
) -> Result<MetricValue, ValidationFailure> {
    use serde_json::Value;

    let mismatch = || ValidationFailure::TypeMismatch { expected: kind };

    match kind {
        MetricKind::Numeric => match raw {
            // bool must be matched before number: some host languages treat
            // true/false as 1/0 and we must not.
            Value::Bool(_) => Err(mismatch()),
            Value::Number(n) => Decimal::from_str(&n.to_string())
                .map(MetricValue::Numeric)
                .map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
        MetricKind::Boolean => match raw {
            Value::Bool(b) => Ok(MetricValue::Boolean(*b)),
            _ => Err(mismatch()),
        },
        MetricKind::Text => match raw {
            Value::Bool(_) => Err(mismatch()),
            Value::String(s) => Ok(MetricValue::Text(s.clone())),
            _ => Err(mismatch()),
        },
    }
}

/// A registered device. Telemetry is only accepted while `is_active` is set.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    pub serial_id: String,
    pub is_active: bool,
    pub owner_id: Option<i64>,
}

/// A metric definition: case-insensitively unique name plus declared kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub id: i64,
    pub name: String,
    pub kind: MetricKind,
}

/// The (device, metric) pairing that telemetry rows and rules attach to.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceMetric {
    pub id: i64,
    pub device_id: i64,
    pub metric_id: i64,
}

/// A stored telemetry reading. `ts` is the reading's event time; `created_at`
/// is when the row was ingested (they differ under delayed delivery). At most
/// one row exists per (device_metric_id, ts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRow {
    pub id: i64,
    pub device_metric_id: i64,
    pub ts: DateTime<Utc>,
    /// `None` only for defensively-handled rows whose value columns are all
    /// empty; evaluators skip such rows.
    pub value: Option<MetricValue>,
    pub created_at: DateTime<Utc>,
}

/// A validated reading ready for insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTelemetryRow {
    pub device_metric_id: i64,
    pub ts: DateTime<Utc>,
    pub value: MetricValue,
}

/// A condition-based rule bound to exactly one device-metric. The `action`
/// descriptor is opaque to evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Rule {
    pub id: i64,
    pub device_metric_id: i64,
    pub name: String,
    pub condition: serde_json::Value,
    pub action: serde_json::Value,
    pub is_active: bool,
}

/// The fact that a rule fired at a point in time. Immutable once created,
/// aside from the operator-controlled `acknowledged` flag.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    pub id: i64,
    pub rule_id: i64,
    pub telemetry_id: Option<i64>,
    pub device_id: Option<i64>,
    pub ts: DateTime<Utc>,
    pub acknowledged: bool,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub rule_id: i64,
    pub telemetry_id: Option<i64>,
    pub device_id: Option<i64>,
    pub ts: DateTime<Utc>,
}

/// Outbound hand-off to the asynchronous delivery collaborator, keyed by the
/// created event's id.
#[derive(Debug, Clone, Serialize)]
pub struct EventDelivery {
    pub event_id: i64,
    pub rule_id: i64,
    pub rule_name: String,
    pub trigger_telemetry_id: Option<i64>,
    pub trigger_device_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

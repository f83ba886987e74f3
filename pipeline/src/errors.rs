use serde::Serialize;
use thiserror::Error;

use crate::model::MetricKind;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A structured validation outcome for one ingest item or one of its metrics.
///
/// These are collected and returned as data, never raised across the batch
/// boundary, so partial success stays reportable (per item, per metric).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ValidationFailure {
    #[error("device not found")]
    DeviceNotFound,

    #[error("device is inactive")]
    DeviceInactive,

    #[error("payload contains no valid metrics")]
    NoValidMetrics,

    #[error("metric not found")]
    MetricNotFound,

    #[error("metric is not configured for this device")]
    MetricNotConfiguredForDevice,

    #[error("value does not match declared kind {expected}")]
    TypeMismatch { expected: MetricKind },
}

/// Errors surfaced by condition evaluation. All of these are fatal to the
/// rule being evaluated but must not abort the processor's loop over
/// sibling rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    /// Condition carries a type tag no evaluator is registered for. A
    /// configuration bug, not a runtime data issue.
    #[error("unsupported condition type: {0}")]
    UnsupportedConditionType(String),

    /// Condition JSON is missing its `type` tag entirely.
    #[error("condition has no type tag")]
    MissingConditionType,

    /// The rule's device-metric does not match the triggering row's. The
    /// processor scopes rule loading, so this indicates a caller bug.
    #[error("rule device-metric {rule} does not match telemetry device-metric {telemetry}")]
    DeviceMetricMismatch { rule: i64, telemetry: i64 },

    /// Condition parameters failed to deserialize for a registered type.
    #[error("invalid condition parameters: {0}")]
    InvalidCondition(String),

    #[error("storage error during evaluation: {0}")]
    Store(String),
}

//! Persistence for telemetry rows, rules, and events.
//!
//! The uniqueness constraint on `(device_metric_id, ts)` is the sole
//! concurrency-correctness mechanism for ingestion: concurrent inserts of the
//! same key resolve to exactly one winner and the rest are silently absorbed
//! by the backend's conflict-ignore semantics. No additional locking exists
//! anywhere in the pipeline.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::errors::Result;
use crate::model::{
    Device, DeviceMetric, Event, Metric, NewEvent, NewTelemetryRow, Rule, TelemetryRow,
};

/// Storage backend for the ingestion and evaluation pipeline.
///
/// Implementations must be `Send + Sync`: the store is shared between the
/// HTTP ingest path and rule evaluation. Reads must be read-committed or
/// stronger, and `window` must observe rows created by an earlier
/// `insert_telemetry` call on the same task (the evaluator assumes
/// read-your-writes).
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Looks up a device by its serial id.
    async fn device_by_serial(&self, serial_id: &str) -> Result<Option<Device>>;

    /// Looks up a metric by name, case-insensitively.
    async fn metric_by_name(&self, name: &str) -> Result<Option<Metric>>;

    /// Looks up the pairing of a device and a metric.
    async fn device_metric(&self, device_id: i64, metric_id: i64) -> Result<Option<DeviceMetric>>;

    /// Looks up a device-metric pairing by its id.
    async fn device_metric_by_id(&self, id: i64) -> Result<Option<DeviceMetric>>;

    /// Set-based insert of validated rows. Rows colliding with an existing
    /// `(device_metric_id, ts)` are skipped, not errored; only the rows
    /// actually created are returned. Each row is atomic, but the set as a
    /// whole is not one transaction.
    async fn insert_telemetry(&self, rows: &[NewTelemetryRow]) -> Result<Vec<TelemetryRow>>;

    /// Rows with event time in `[end - duration, end]` for one device-metric,
    /// ordered by `ts` ascending.
    async fn window(
        &self,
        device_metric_id: i64,
        end: DateTime<Utc>,
        duration: Duration,
    ) -> Result<Vec<TelemetryRow>>;

    /// All active rules bound to the given device-metric.
    async fn active_rules(&self, device_metric_id: i64) -> Result<Vec<Rule>>;

    /// Records a fired-rule event. Events are immutable facts; each call
    /// creates a new row.
    async fn insert_event(&self, event: NewEvent) -> Result<Event>;

    /// Flips the `acknowledged` flag. Returns false when the event id is
    /// unknown. The only mutation events ever receive.
    async fn acknowledge_event(&self, event_id: i64) -> Result<bool>;
}

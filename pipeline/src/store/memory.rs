use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::errors::Result;
use crate::model::{
    Device, DeviceMetric, Event, Metric, MetricKind, NewEvent, NewTelemetryRow, Rule,
    TelemetryRow,
};
use crate::store::TelemetryStore;

/// In-process [`TelemetryStore`] backend.
///
/// Telemetry is keyed by `(device_metric_id, ts)` in a `BTreeMap`, so insert
/// conflicts and window range scans behave exactly like the Postgres
/// backend's unique constraint and `ts`-ordered queries. Used by the test
/// suites and for running the pipeline without a database.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    devices: Vec<Device>,
    metrics: Vec<Metric>,
    device_metrics: Vec<DeviceMetric>,
    telemetry: BTreeMap<(i64, DateTime<Utc>), TelemetryRow>,
    rules: Vec<Rule>,
    events: Vec<Event>,
    next_id: i64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_device(&self, serial_id: &str, is_active: bool) -> Device {
        let mut inner = self.inner.write().await;
        let device = Device {
            id: inner.next_id(),
            serial_id: serial_id.to_string(),
            is_active,
            owner_id: None,
        };
        inner.devices.push(device.clone());
        device
    }

    pub async fn add_metric(&self, name: &str, kind: MetricKind) -> Metric {
        let mut inner = self.inner.write().await;
        let metric = Metric {
            id: inner.next_id(),
            name: name.to_string(),
            kind,
        };
        inner.metrics.push(metric.clone());
        metric
    }

    pub async fn add_device_metric(&self, device_id: i64, metric_id: i64) -> DeviceMetric {
        let mut inner = self.inner.write().await;
        let dm = DeviceMetric {
            id: inner.next_id(),
            device_id,
            metric_id,
        };
        inner.device_metrics.push(dm.clone());
        dm
    }

    pub async fn add_rule(
        &self,
        device_metric_id: i64,
        name: &str,
        condition: serde_json::Value,
        is_active: bool,
    ) -> Rule {
        let mut inner = self.inner.write().await;
        let rule = Rule {
            id: inner.next_id(),
            device_metric_id,
            name: name.to_string(),
            condition,
            action: serde_json::json!({}),
            is_active,
        };
        inner.rules.push(rule.clone());
        rule
    }

    /// Snapshot of all recorded events, in creation order.
    pub async fn events(&self) -> Vec<Event> {
        self.inner.read().await.events.clone()
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn device_by_serial(&self, serial_id: &str) -> Result<Option<Device>> {
        let inner = self.inner.read().await;
        Ok(inner
            .devices
            .iter()
            .find(|d| d.serial_id == serial_id)
            .cloned())
    }

    async fn metric_by_name(&self, name: &str) -> Result<Option<Metric>> {
        let inner = self.inner.read().await;
        Ok(inner
            .metrics
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn device_metric(&self, device_id: i64, metric_id: i64) -> Result<Option<DeviceMetric>> {
        let inner = self.inner.read().await;
        Ok(inner
            .device_metrics
            .iter()
            .find(|dm| dm.device_id == device_id && dm.metric_id == metric_id)
            .cloned())
    }

    async fn device_metric_by_id(&self, id: i64) -> Result<Option<DeviceMetric>> {
        let inner = self.inner.read().await;
        Ok(inner.device_metrics.iter().find(|dm| dm.id == id).cloned())
    }

    async fn insert_telemetry(&self, rows: &[NewTelemetryRow]) -> Result<Vec<TelemetryRow>> {
        let mut inner = self.inner.write().await;
        let mut created = Vec::new();
        for row in rows {
            let key = (row.device_metric_id, row.ts);
            if inner.telemetry.contains_key(&key) {
                continue; // conflict: silently absorbed
            }
            let stored = TelemetryRow {
                id: inner.next_id(),
                device_metric_id: row.device_metric_id,
                ts: row.ts,
                value: Some(row.value.clone()),
                created_at: Utc::now(),
            };
            inner.telemetry.insert(key, stored.clone());
            created.push(stored);
        }
        Ok(created)
    }

    async fn window(
        &self,
        device_metric_id: i64,
        end: DateTime<Utc>,
        duration: Duration,
    ) -> Result<Vec<TelemetryRow>> {
        let start = end - duration;
        // A non-positive duration inverts the range; BTreeMap::range panics
        // on start > end where Postgres just returns no rows.
        if start > end {
            return Ok(Vec::new());
        }
        let inner = self.inner.read().await;
        Ok(inner
            .telemetry
            .range((device_metric_id, start)..=(device_metric_id, end))
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn active_rules(&self, device_metric_id: i64) -> Result<Vec<Rule>> {
        let inner = self.inner.read().await;
        Ok(inner
            .rules
            .iter()
            .filter(|r| r.device_metric_id == device_metric_id && r.is_active)
            .cloned()
            .collect())
    }

    async fn insert_event(&self, event: NewEvent) -> Result<Event> {
        let mut inner = self.inner.write().await;
        let created = Event {
            id: inner.next_id(),
            rule_id: event.rule_id,
            telemetry_id: event.telemetry_id,
            device_id: event.device_id,
            ts: event.ts,
            acknowledged: false,
        };
        inner.events.push(created.clone());
        Ok(created)
    }

    async fn acknowledge_event(&self, event_id: i64) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.events.iter_mut().find(|e| e.id == event_id) {
            Some(event) => {
                event.acknowledged = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

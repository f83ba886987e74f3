use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::errors::{Result, ValidationFailure};
use crate::model::{typed_value, NewTelemetryRow};
use crate::store::TelemetryStore;

/// One inbound telemetry payload item.
///
/// `metrics` stays untyped JSON deliberately: a non-mapping value must be
/// reported as a structured `NoValidMetrics` failure, not a deserialization
/// error, so the rest of a batch can still succeed.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestItem {
    pub device: String,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub metrics: serde_json::Value,
}

/// Validation failures for one item: either a single item-level failure that
/// aborted the whole item, or per-metric failures keyed by normalized name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ItemErrors {
    Item(ValidationFailure),
    Metrics(BTreeMap<String, ValidationFailure>),
}

#[derive(Debug, Default)]
pub struct ItemOutcome {
    pub rows: Vec<NewTelemetryRow>,
    pub errors: Option<ItemErrors>,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub rows: Vec<NewTelemetryRow>,
    /// Failures indexed by item position. Items with mixed valid/invalid
    /// metrics appear here and still contribute rows.
    pub errors: BTreeMap<usize, ItemErrors>,
}

/// Maps raw payloads to verified, typed telemetry rows.
///
/// Device resolution is all-or-nothing per item; metric failures are
/// collected by name without blocking sibling metrics of the same item.
pub struct Validator {
    store: Arc<dyn TelemetryStore>,
}

impl Validator {
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        Self { store }
    }

    pub async fn validate_item(&self, item: &IngestItem) -> Result<ItemOutcome> {
        let device = match self.store.device_by_serial(&item.device).await? {
            Some(device) => device,
            None => {
                return Ok(ItemOutcome {
                    rows: Vec::new(),
                    errors: Some(ItemErrors::Item(ValidationFailure::DeviceNotFound)),
                })
            }
        };
        if !device.is_active {
            return Ok(ItemOutcome {
                rows: Vec::new(),
                errors: Some(ItemErrors::Item(ValidationFailure::DeviceInactive)),
            });
        }

        let Some(metrics) = item.metrics.as_object().filter(|m| !m.is_empty()) else {
            return Ok(ItemOutcome {
                rows: Vec::new(),
                errors: Some(ItemErrors::Item(ValidationFailure::NoValidMetrics)),
            });
        };

        let mut rows = Vec::new();
        let mut metric_errors = BTreeMap::new();

        for (raw_name, entry) in metrics {
            let name = raw_name.trim();
            if name.is_empty() {
                continue;
            }

            let metric = match self.store.metric_by_name(name).await? {
                Some(metric) => metric,
                None => {
                    metric_errors.insert(name.to_string(), ValidationFailure::MetricNotFound);
                    continue;
                }
            };

            let device_metric = match self.store.device_metric(device.id, metric.id).await? {
                Some(dm) => dm,
                None => {
                    metric_errors.insert(
                        name.to_string(),
                        ValidationFailure::MetricNotConfiguredForDevice,
                    );
                    continue;
                }
            };

            match typed_value(metric.kind, reading_value(entry)) {
                Ok(value) => rows.push(NewTelemetryRow {
                    device_metric_id: device_metric.id,
                    ts: item.ts,
                    value,
                }),
                Err(failure) => {
                    metric_errors.insert(name.to_string(), failure);
                }
            }
        }

        let errors = (!metric_errors.is_empty()).then_some(ItemErrors::Metrics(metric_errors));
        Ok(ItemOutcome { rows, errors })
    }

    /// Applies the single-item validator to each element, collecting failures
    /// by index. The batch is usable even when some items fail entirely.
    pub async fn validate_batch(&self, items: &[IngestItem]) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for (index, item) in items.iter().enumerate() {
            let item_outcome = self.validate_item(item).await?;
            outcome.rows.extend(item_outcome.rows);
            if let Some(errors) = item_outcome.errors {
                outcome.errors.insert(index, errors);
            }
        }
        Ok(outcome)
    }
}

/// Readings may be the documented `{"value": v, "unit": u}` object or a bare
/// JSON value; the unit is advisory and not stored. Objects without a
/// `value` key fall through to strict typing and fail there.
fn reading_value(entry: &serde_json::Value) -> &serde_json::Value {
    match entry.get("value") {
        Some(value) => value,
        None => entry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MetricKind, MetricValue};
    use crate::store::memory::MemoryStore;
    use rust_decimal::Decimal;
    use serde_json::json;

    struct Env {
        store: MemoryStore,
        validator: Validator,
        dm_temperature: i64,
    }

    /// Active device DEV-1 exposing numeric `temperature`; numeric `humidity`
    /// exists as a metric but is not configured for the device.
    async fn env() -> Env {
        let store = MemoryStore::new();
        let device = store.add_device("DEV-1", true).await;
        let temperature = store.add_metric("temperature", MetricKind::Numeric).await;
        store.add_metric("humidity", MetricKind::Numeric).await;
        let dm = store.add_device_metric(device.id, temperature.id).await;
        let validator = Validator::new(Arc::new(store.clone()));
        Env {
            store,
            validator,
            dm_temperature: dm.id,
        }
    }

    fn item(device: &str, metrics: serde_json::Value) -> IngestItem {
        IngestItem {
            device: device.to_string(),
            ts: Utc::now(),
            metrics,
        }
    }

    #[tokio::test]
    async fn valid_reading_produces_typed_row() {
        let env = env().await;
        let out = env
            .validator
            .validate_item(&item("DEV-1", json!({"temperature": {"value": 21.5, "unit": "C"}})))
            .await
            .unwrap();

        assert!(out.errors.is_none());
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].device_metric_id, env.dm_temperature);
        assert_eq!(
            out.rows[0].value,
            MetricValue::Numeric(Decimal::new(215, 1))
        );
    }

    #[tokio::test]
    async fn bare_values_are_accepted() {
        let env = env().await;
        let out = env
            .validator
            .validate_item(&item("DEV-1", json!({"temperature": 21})))
            .await
            .unwrap();
        assert_eq!(out.rows.len(), 1);
    }

    #[tokio::test]
    async fn unknown_device_aborts_the_item() {
        let env = env().await;
        let out = env
            .validator
            .validate_item(&item("DEV-404", json!({"temperature": 21})))
            .await
            .unwrap();
        assert!(out.rows.is_empty());
        assert_eq!(
            out.errors,
            Some(ItemErrors::Item(ValidationFailure::DeviceNotFound))
        );
    }

    #[tokio::test]
    async fn inactive_device_aborts_regardless_of_metric_validity() {
        let env = env().await;
        env.store.add_device("DEV-OFF", false).await;
        let out = env
            .validator
            .validate_item(&item("DEV-OFF", json!({"temperature": 21})))
            .await
            .unwrap();
        assert!(out.rows.is_empty());
        assert_eq!(
            out.errors,
            Some(ItemErrors::Item(ValidationFailure::DeviceInactive))
        );
    }

    #[tokio::test]
    async fn empty_or_non_mapping_metrics_is_rejected() {
        let env = env().await;
        for metrics in [json!({}), json!([1, 2]), json!("temperature"), json!(null)] {
            let out = env
                .validator
                .validate_item(&item("DEV-1", metrics))
                .await
                .unwrap();
            assert_eq!(
                out.errors,
                Some(ItemErrors::Item(ValidationFailure::NoValidMetrics))
            );
        }
    }

    #[tokio::test]
    async fn boolean_is_never_coerced_to_numeric() {
        let env = env().await;
        let out = env
            .validator
            .validate_item(&item("DEV-1", json!({"temperature": true})))
            .await
            .unwrap();
        assert!(out.rows.is_empty());
        assert_eq!(
            out.errors,
            Some(ItemErrors::Metrics(BTreeMap::from([(
                "temperature".to_string(),
                ValidationFailure::TypeMismatch {
                    expected: MetricKind::Numeric
                }
            )])))
        );
    }

    #[tokio::test]
    async fn failing_metric_does_not_block_siblings() {
        let env = env().await;
        let out = env
            .validator
            .validate_item(&item(
                "DEV-1",
                json!({
                    "temperature": 21,
                    "humidity": 60,
                    "voltage": 12,
                }),
            ))
            .await
            .unwrap();

        assert_eq!(out.rows.len(), 1);
        let Some(ItemErrors::Metrics(errors)) = out.errors else {
            panic!("expected metric errors");
        };
        assert_eq!(
            errors.get("humidity"),
            Some(&ValidationFailure::MetricNotConfiguredForDevice)
        );
        assert_eq!(errors.get("voltage"), Some(&ValidationFailure::MetricNotFound));
    }

    #[tokio::test]
    async fn names_are_trimmed_and_blank_names_dropped() {
        let env = env().await;
        let out = env
            .validator
            .validate_item(&item("DEV-1", json!({"  temperature  ": 21, "   ": 5})))
            .await
            .unwrap();
        assert!(out.errors.is_none());
        assert_eq!(out.rows.len(), 1);
    }

    #[tokio::test]
    async fn metric_lookup_is_case_insensitive() {
        let env = env().await;
        let out = env
            .validator
            .validate_item(&item("DEV-1", json!({"Temperature": 21})))
            .await
            .unwrap();
        assert!(out.errors.is_none());
        assert_eq!(out.rows.len(), 1);
    }

    #[tokio::test]
    async fn batch_collects_failures_by_index() {
        let env = env().await;
        env.store.add_device("DEV-OFF", false).await;
        let items = vec![
            item("DEV-1", json!({"temperature": 21})),
            item("DEV-OFF", json!({"temperature": 22})),
            item("DEV-1", json!({"temperature": 23, "voltage": 1})),
        ];

        let out = env.validator.validate_batch(&items).await.unwrap();
        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.errors.len(), 2);
        assert_eq!(
            out.errors.get(&1),
            Some(&ItemErrors::Item(ValidationFailure::DeviceInactive))
        );
        assert!(matches!(out.errors.get(&2), Some(ItemErrors::Metrics(_))));
        assert!(!out.errors.contains_key(&0));
    }
}

use async_trait::async_trait;
use chrono::Duration;

use crate::condition::{compare, CompareOp, ThresholdParams};
use crate::errors::EvalError;
use crate::evaluator::{ConditionEvaluator, EvalContext};
use crate::model::TelemetryRow;

pub const DEFAULT_WINDOW_MINUTES: i64 = 5;
pub const DEFAULT_THRESHOLD_PERCENTAGE: f64 = 0.8;

/// Fires when at least `threshold_percentage` of the windowed readings
/// compare true against the operand.
///
/// The window is `[trigger.ts - duration, trigger.ts]` over event time,
/// anchored at the triggering row so evaluation is reproducible.
pub struct ThresholdEvaluator;

#[async_trait]
impl ConditionEvaluator for ThresholdEvaluator {
    async fn evaluate(
        &self,
        condition: &serde_json::Value,
        ctx: &EvalContext<'_>,
    ) -> Result<bool, EvalError> {
        let params: ThresholdParams = serde_json::from_value(condition.clone())
            .map_err(|e| EvalError::InvalidCondition(e.to_string()))?;

        // The processor scopes rule loading by device-metric; a mismatch here
        // means a caller bug, not bad data.
        if ctx.device_metric_id != ctx.trigger.device_metric_id {
            return Err(EvalError::DeviceMetricMismatch {
                rule: ctx.device_metric_id,
                telemetry: ctx.trigger.device_metric_id,
            });
        }

        let duration =
            Duration::minutes(params.duration_minutes.unwrap_or(DEFAULT_WINDOW_MINUTES));
        let rows = ctx
            .store
            .window(ctx.device_metric_id, ctx.trigger.ts, duration)
            .await
            .map_err(|e| EvalError::Store(e.to_string()))?;

        let percentage = params
            .threshold_percentage
            .unwrap_or(DEFAULT_THRESHOLD_PERCENTAGE);

        Ok(window_matches(
            &rows,
            params.operator,
            &params.value,
            percentage,
        ))
    }
}

/// Ratio check over a window. Rows without a populated value are excluded
/// from both numerator and denominator; an empty window never matches.
fn window_matches(
    rows: &[TelemetryRow],
    op: CompareOp,
    operand: &serde_json::Value,
    percentage: f64,
) -> bool {
    let mut total = 0usize;
    let mut matching = 0usize;

    for row in rows {
        let Some(value) = &row.value else { continue };
        total += 1;
        if compare(op, value, operand) {
            matching += 1;
        }
    }

    if total == 0 {
        return false;
    }

    matching as f64 / total as f64 >= percentage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::testutil::insert_numeric;
    use crate::evaluator::EvaluatorRegistry;
    use crate::model::{MetricKind, MetricValue};
    use crate::store::memory::MemoryStore;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use serde_json::json;

    fn rows(values: &[i64]) -> Vec<TelemetryRow> {
        let now = Utc::now();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| TelemetryRow {
                id: i as i64 + 1,
                device_metric_id: 1,
                ts: now - Duration::seconds((values.len() - i) as i64),
                value: Some(MetricValue::Numeric(Decimal::from(*v))),
                created_at: now,
            })
            .collect()
    }

    #[test]
    fn ratio_respects_threshold_percentage() {
        // 105 and 110 exceed 100: 2 of 3 readings, ratio 0.667.
        let window = rows(&[100, 105, 110]);
        let operand = json!(100);

        assert!(!window_matches(&window, CompareOp::Gt, &operand, 0.8));
        assert!(window_matches(&window, CompareOp::Gt, &operand, 0.6));
    }

    #[test]
    fn empty_window_is_false() {
        assert!(!window_matches(&[], CompareOp::Gt, &json!(0), 0.0));
    }

    #[test]
    fn valueless_rows_are_excluded_from_both_counts() {
        let mut window = rows(&[105, 110]);
        window.push(TelemetryRow {
            id: 99,
            device_metric_id: 1,
            ts: Utc::now(),
            value: None,
            created_at: Utc::now(),
        });

        // 2 of 2 populated rows match; the bare row changes nothing.
        assert!(window_matches(&window, CompareOp::Gt, &json!(100), 1.0));
    }

    #[tokio::test]
    async fn mismatched_trigger_pairing_is_an_error() {
        let store = MemoryStore::new();
        let device = store.add_device("DEV-1", true).await;
        let metric = store.add_metric("temperature", MetricKind::Numeric).await;
        let dm = store.add_device_metric(device.id, metric.id).await.id;
        let trigger = insert_numeric(&store, dm, Utc::now(), 0, 95).await;

        let registry = EvaluatorRegistry::with_builtins();
        let ctx = EvalContext {
            store: &store,
            registry: &registry,
            device_metric_id: dm + 1,
            trigger: &trigger,
        };

        let condition = json!({"type": "threshold", "operator": ">", "value": 90});
        let err = registry.evaluate(&condition, &ctx).await.unwrap_err();
        assert_eq!(
            err,
            EvalError::DeviceMetricMismatch {
                rule: dm + 1,
                telemetry: dm
            }
        );
    }

    #[test]
    fn full_window_matches_at_default_percentage() {
        let window = rows(&[101, 102, 103, 104, 105]);
        assert!(window_matches(
            &window,
            CompareOp::Gt,
            &json!(100),
            DEFAULT_THRESHOLD_PERCENTAGE
        ));
    }
}

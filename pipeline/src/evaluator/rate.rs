use async_trait::async_trait;
use chrono::Duration;
use tracing::warn;

use crate::condition::RateParams;
use crate::errors::EvalError;
use crate::evaluator::{ConditionEvaluator, EvalContext};

/// Fires when at least `count` readings arrived in the window
/// `[trigger.ts - duration_minutes, trigger.ts]`, with no value comparison.
///
/// A rate condition missing `count` or `duration_minutes` can never fire;
/// that is logged and evaluates false rather than erroring, since partially
/// configured rules are a data issue, not a dispatch bug.
pub struct RateEvaluator;

#[async_trait]
impl ConditionEvaluator for RateEvaluator {
    async fn evaluate(
        &self,
        condition: &serde_json::Value,
        ctx: &EvalContext<'_>,
    ) -> Result<bool, EvalError> {
        let params: RateParams = serde_json::from_value(condition.clone())
            .map_err(|e| EvalError::InvalidCondition(e.to_string()))?;

        let (Some(count), Some(duration_minutes)) = (params.count, params.duration_minutes)
        else {
            warn!(
                device_metric_id = ctx.device_metric_id,
                "Rate condition missing count or duration_minutes, evaluating false"
            );
            return Ok(false);
        };

        let rows = ctx
            .store
            .window(
                ctx.device_metric_id,
                ctx.trigger.ts,
                Duration::minutes(duration_minutes),
            )
            .await
            .map_err(|e| EvalError::Store(e.to_string()))?;

        Ok(rows.len() as i64 >= count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::testutil::insert_numeric;
    use crate::evaluator::EvaluatorRegistry;
    use crate::model::MetricKind;
    use crate::store::memory::MemoryStore;
    use chrono::Utc;
    use serde_json::json;

    async fn seeded(store: &MemoryStore) -> i64 {
        let device = store.add_device("DEV-1", true).await;
        let metric = store.add_metric("pulse", MetricKind::Numeric).await;
        store.add_device_metric(device.id, metric.id).await.id
    }

    #[tokio::test]
    async fn fires_at_required_count() {
        let store = MemoryStore::new();
        let dm = seeded(&store).await;
        let anchor = Utc::now();

        insert_numeric(&store, dm, anchor, 240, 1).await;
        insert_numeric(&store, dm, anchor, 120, 2).await;
        let trigger = insert_numeric(&store, dm, anchor, 0, 3).await;

        let registry = EvaluatorRegistry::with_builtins();
        let ctx = EvalContext {
            store: &store,
            registry: &registry,
            device_metric_id: dm,
            trigger: &trigger,
        };

        let condition = json!({"type": "rate", "count": 3, "duration_minutes": 5});
        assert!(registry.evaluate(&condition, &ctx).await.unwrap());

        let condition = json!({"type": "rate", "count": 4, "duration_minutes": 5});
        assert!(!registry.evaluate(&condition, &ctx).await.unwrap());
    }

    #[tokio::test]
    async fn readings_outside_window_do_not_count() {
        let store = MemoryStore::new();
        let dm = seeded(&store).await;
        let anchor = Utc::now();

        insert_numeric(&store, dm, anchor, 600, 1).await; // beyond 5 minutes
        insert_numeric(&store, dm, anchor, 120, 2).await;
        let trigger = insert_numeric(&store, dm, anchor, 0, 3).await;

        let registry = EvaluatorRegistry::with_builtins();
        let ctx = EvalContext {
            store: &store,
            registry: &registry,
            device_metric_id: dm,
            trigger: &trigger,
        };

        let condition = json!({"type": "rate", "count": 3, "duration_minutes": 5});
        assert!(!registry.evaluate(&condition, &ctx).await.unwrap());
    }

    #[tokio::test]
    async fn missing_parameters_evaluate_false() {
        let store = MemoryStore::new();
        let dm = seeded(&store).await;
        let trigger = insert_numeric(&store, dm, Utc::now(), 0, 1).await;

        let registry = EvaluatorRegistry::with_builtins();
        let ctx = EvalContext {
            store: &store,
            registry: &registry,
            device_metric_id: dm,
            trigger: &trigger,
        };

        for condition in [
            json!({"type": "rate", "count": 3}),
            json!({"type": "rate", "duration_minutes": 5}),
            json!({"type": "rate"}),
        ] {
            assert!(!registry.evaluate(&condition, &ctx).await.unwrap());
        }
    }
}

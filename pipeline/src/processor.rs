use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::dispatch::ActionDispatcher;
use crate::errors::Result;
use crate::evaluator::{EvalContext, EvaluatorRegistry};
use crate::metrics::RULES_EVALUATED_TOTAL;
use crate::model::TelemetryRow;
use crate::store::TelemetryStore;

/// Per-rule evaluation result for one telemetry row.
#[derive(Debug, Clone, Serialize)]
pub struct RuleOutcome {
    pub rule_id: i64,
    pub triggered: bool,
    /// Evaluation or dispatch failure, isolated to this rule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub telemetry_id: i64,
    pub results: Vec<RuleOutcome>,
}

/// Orchestrates rule evaluation for one stored telemetry row.
///
/// Rules are loaded scoped to the row's device-metric, so a rule can never
/// see telemetry from a different pairing. Every matching rule is evaluated
/// independently with no early exit; a failure evaluating or dispatching one
/// rule is logged and must not abort its siblings.
pub struct RuleProcessor {
    store: Arc<dyn TelemetryStore>,
    registry: Arc<EvaluatorRegistry>,
    dispatcher: ActionDispatcher,
}

impl RuleProcessor {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        registry: Arc<EvaluatorRegistry>,
        dispatcher: ActionDispatcher,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
        }
    }

    pub async fn run(&self, row: &TelemetryRow) -> Result<ProcessOutcome> {
        let rules = self.store.active_rules(row.device_metric_id).await?;
        let mut results = Vec::with_capacity(rules.len());

        for rule in &rules {
            RULES_EVALUATED_TOTAL.inc();
            let ctx = EvalContext {
                store: self.store.as_ref(),
                registry: &self.registry,
                device_metric_id: rule.device_metric_id,
                trigger: row,
            };

            let triggered = match self.registry.evaluate(&rule.condition, &ctx).await {
                Ok(triggered) => triggered,
                Err(e) => {
                    warn!(
                        rule_id = rule.id,
                        telemetry_id = row.id,
                        "Condition evaluation failed: {}",
                        e
                    );
                    results.push(RuleOutcome {
                        rule_id: rule.id,
                        triggered: false,
                        error: Some(e.to_string()),
                    });
                    continue;
                }
            };

            if !triggered {
                results.push(RuleOutcome {
                    rule_id: rule.id,
                    triggered: false,
                    error: None,
                });
                continue;
            }

            match self.dispatcher.dispatch(rule, row).await {
                Ok(event) => {
                    debug!(
                        rule_id = rule.id,
                        event_id = event.id,
                        telemetry_id = row.id,
                        "Rule triggered"
                    );
                    results.push(RuleOutcome {
                        rule_id: rule.id,
                        triggered: true,
                        error: None,
                    });
                }
                Err(e) => {
                    // Isolated: the remaining rules still get evaluated.
                    error!(rule_id = rule.id, "Action dispatch failed: {}", e);
                    results.push(RuleOutcome {
                        rule_id: rule.id,
                        triggered: true,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        Ok(ProcessOutcome {
            telemetry_id: row.id,
            results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MetricKind, MetricValue, NewTelemetryRow, TelemetryRow};
    use crate::store::memory::MemoryStore;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Fixture {
        store: MemoryStore,
        processor: RuleProcessor,
        _rx: mpsc::Receiver<crate::model::EventDelivery>,
    }

    fn processor_for(store: &MemoryStore) -> (RuleProcessor, mpsc::Receiver<crate::model::EventDelivery>) {
        let store: Arc<dyn TelemetryStore> = Arc::new(store.clone());
        let (tx, rx) = mpsc::channel(16);
        let dispatcher = ActionDispatcher::new(store.clone(), tx);
        let registry = Arc::new(EvaluatorRegistry::with_builtins());
        (RuleProcessor::new(store, registry, dispatcher), rx)
    }

    async fn fixture() -> (Fixture, i64) {
        let store = MemoryStore::new();
        let device = store.add_device("DEV-1", true).await;
        let metric = store.add_metric("temperature", MetricKind::Numeric).await;
        let dm = store.add_device_metric(device.id, metric.id).await.id;
        let (processor, rx) = processor_for(&store);
        (
            Fixture {
                store,
                processor,
                _rx: rx,
            },
            dm,
        )
    }

    async fn insert(store: &MemoryStore, dm: i64, value: i64) -> TelemetryRow {
        store
            .insert_telemetry(&[NewTelemetryRow {
                device_metric_id: dm,
                ts: Utc::now(),
                value: MetricValue::Numeric(Decimal::from(value)),
            }])
            .await
            .unwrap()
            .into_iter()
            .next()
            .unwrap()
    }

    fn hot_condition() -> serde_json::Value {
        json!({"type": "threshold", "operator": ">", "value": 90})
    }

    #[tokio::test]
    async fn triggering_rule_creates_one_event() {
        let (fx, dm) = fixture().await;
        let rule = fx.store.add_rule(dm, "hot", hot_condition(), true).await;
        let row = insert(&fx.store, dm, 95).await;

        let outcome = fx.processor.run(&row).await.unwrap();
        assert_eq!(outcome.telemetry_id, row.id);
        assert_eq!(outcome.results.len(), 1);
        assert!(outcome.results[0].triggered);
        assert_eq!(outcome.results[0].rule_id, rule.id);
        assert_eq!(fx.store.events().await.len(), 1);
    }

    #[tokio::test]
    async fn inactive_rules_are_not_evaluated() {
        let (fx, dm) = fixture().await;
        fx.store.add_rule(dm, "hot", hot_condition(), false).await;
        let row = insert(&fx.store, dm, 95).await;

        let outcome = fx.processor.run(&row).await.unwrap();
        assert!(outcome.results.is_empty());
        assert!(fx.store.events().await.is_empty());
    }

    #[tokio::test]
    async fn rules_never_fire_across_device_metrics() {
        let (fx, dm_a) = fixture().await;
        let device_b = fx.store.add_device("DEV-2", true).await;
        let metric_b = fx.store.add_metric("pressure", MetricKind::Numeric).await;
        let dm_b = fx
            .store
            .add_device_metric(device_b.id, metric_b.id)
            .await
            .id;

        // Rule on pairing A; telemetry arrives on pairing B with a value
        // that would satisfy the condition were it comparable.
        fx.store.add_rule(dm_a, "hot", hot_condition(), true).await;
        let row_b = insert(&fx.store, dm_b, 999).await;

        let outcome = fx.processor.run(&row_b).await.unwrap();
        assert!(outcome.results.is_empty());
        assert!(fx.store.events().await.is_empty());
    }

    #[tokio::test]
    async fn all_rules_evaluate_even_after_a_trigger() {
        let (fx, dm) = fixture().await;
        fx.store.add_rule(dm, "hot-1", hot_condition(), true).await;
        fx.store.add_rule(dm, "hot-2", hot_condition(), true).await;
        fx.store
            .add_rule(dm, "cold", json!({"type": "threshold", "operator": "<", "value": 0}), true)
            .await;
        let row = insert(&fx.store, dm, 95).await;

        let outcome = fx.processor.run(&row).await.unwrap();
        assert_eq!(outcome.results.len(), 3);
        let triggered: Vec<bool> = outcome.results.iter().map(|r| r.triggered).collect();
        assert_eq!(triggered, vec![true, true, false]);
        assert_eq!(fx.store.events().await.len(), 2);
    }

    #[tokio::test]
    async fn misconfigured_rule_does_not_abort_siblings() {
        let (fx, dm) = fixture().await;
        fx.store
            .add_rule(dm, "broken", json!({"type": "percentile"}), true)
            .await;
        fx.store.add_rule(dm, "hot", hot_condition(), true).await;
        let row = insert(&fx.store, dm, 95).await;

        let outcome = fx.processor.run(&row).await.unwrap();
        assert_eq!(outcome.results.len(), 2);
        assert!(!outcome.results[0].triggered);
        assert!(outcome.results[0].error.is_some());
        assert!(outcome.results[1].triggered);
        assert_eq!(fx.store.events().await.len(), 1);
    }
}

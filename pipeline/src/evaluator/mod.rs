//! Condition evaluation strategies.
//!
//! A condition is a tagged JSON document persisted on a rule. The
//! [`EvaluatorRegistry`] maps each type tag to a [`ConditionEvaluator`]
//! strategy; new kinds register by name without touching the dispatch core.
//! Evaluation is a pure function of stored state at evaluation time: every
//! call re-queries its window from the store, and no evaluator keeps state
//! between calls.

pub mod composite;
pub mod rate;
pub mod threshold;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::errors::EvalError;
use crate::model::TelemetryRow;
use crate::store::TelemetryStore;

/// Everything an evaluator may look at: the store for window reads, the
/// registry for recursive sub-condition dispatch, the rule's device-metric,
/// and the triggering telemetry row the window is anchored on.
pub struct EvalContext<'a> {
    pub store: &'a dyn TelemetryStore,
    pub registry: &'a EvaluatorRegistry,
    pub device_metric_id: i64,
    pub trigger: &'a TelemetryRow,
}

#[async_trait]
pub trait ConditionEvaluator: Send + Sync {
    /// Evaluates one condition document against the trigger context.
    async fn evaluate(
        &self,
        condition: &serde_json::Value,
        ctx: &EvalContext<'_>,
    ) -> Result<bool, EvalError>;
}

/// Dispatch table from condition type tag to evaluator strategy.
pub struct EvaluatorRegistry {
    evaluators: HashMap<String, Box<dyn ConditionEvaluator>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self {
            evaluators: HashMap::new(),
        }
    }

    /// Registry with the built-in `threshold`, `rate`, and `composite`
    /// strategies.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("threshold", Box::new(threshold::ThresholdEvaluator));
        registry.register("rate", Box::new(rate::RateEvaluator));
        registry.register("composite", Box::new(composite::CompositeEvaluator));
        registry
    }

    pub fn register(&mut self, tag: impl Into<String>, evaluator: Box<dyn ConditionEvaluator>) {
        self.evaluators.insert(tag.into(), evaluator);
    }

    /// Dispatches on the condition's `type` tag. An unknown or missing tag is
    /// a configuration bug and fails hard rather than evaluating false.
    pub async fn evaluate(
        &self,
        condition: &serde_json::Value,
        ctx: &EvalContext<'_>,
    ) -> Result<bool, EvalError> {
        let tag = condition
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(EvalError::MissingConditionType)?;

        let evaluator = self
            .evaluators
            .get(tag)
            .ok_or_else(|| EvalError::UnsupportedConditionType(tag.to_string()))?;

        evaluator.evaluate(condition, ctx).await
    }
}

impl Default for EvaluatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

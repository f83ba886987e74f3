use async_trait::async_trait;

use crate::condition::{BoolOp, CompositeParams};
use crate::errors::EvalError;
use crate::evaluator::{ConditionEvaluator, EvalContext};

/// Reduces an ordered list of sub-conditions with AND/OR.
///
/// Sub-conditions evaluate recursively through the registry against the same
/// trigger row and device-metric; no intermediate rule objects are
/// materialized. An empty list evaluates false for either operator.
pub struct CompositeEvaluator;

#[async_trait]
impl ConditionEvaluator for CompositeEvaluator {
    async fn evaluate(
        &self,
        condition: &serde_json::Value,
        ctx: &EvalContext<'_>,
    ) -> Result<bool, EvalError> {
        let params: CompositeParams = serde_json::from_value(condition.clone())
            .map_err(|e| EvalError::InvalidCondition(e.to_string()))?;

        if params.conditions.is_empty() {
            return Ok(false);
        }

        match params.operator {
            BoolOp::And => {
                for sub in &params.conditions {
                    if !ctx.registry.evaluate(sub, ctx).await? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            BoolOp::Or => {
                for sub in &params.conditions {
                    if ctx.registry.evaluate(sub, ctx).await? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

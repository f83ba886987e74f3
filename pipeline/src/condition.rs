use serde::Deserialize;
use std::cmp::Ordering;
use std::str::FromStr;

use crate::model::{typed_value, MetricValue};

/// Comparison operator used by threshold conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl FromStr for CompareOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "==" | "eq" => Ok(Self::Eq),
            "!=" | "ne" => Ok(Self::Ne),
            ">" | "gt" => Ok(Self::Gt),
            "<" | "lt" => Ok(Self::Lt),
            ">=" | "gte" => Ok(Self::Ge),
            "<=" | "lte" => Ok(Self::Le),
            _ => Err(format!("unknown compare operator: {s}")),
        }
    }
}

impl TryFrom<String> for CompareOp {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Le => "<=",
        };
        write!(f, "{s}")
    }
}

impl CompareOp {
    fn check_ordering(&self, ord: Ordering) -> bool {
        match self {
            Self::Eq => ord == Ordering::Equal,
            Self::Ne => ord != Ordering::Equal,
            Self::Gt => ord == Ordering::Greater,
            Self::Lt => ord == Ordering::Less,
            Self::Ge => ord != Ordering::Less,
            Self::Le => ord != Ordering::Greater,
        }
    }

    fn is_equality(&self) -> bool {
        matches!(self, Self::Eq | Self::Ne)
    }
}

/// Boolean reducer for composite conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum BoolOp {
    And,
    Or,
}

impl FromStr for BoolOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AND" | "and" => Ok(Self::And),
            "OR" | "or" => Ok(Self::Or),
            _ => Err(format!("unknown composite operator: {s}")),
        }
    }
}

impl TryFrom<String> for BoolOp {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Parameters of a `{"type": "threshold", ...}` condition.
#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdParams {
    pub operator: CompareOp,
    pub value: serde_json::Value,
    pub duration_minutes: Option<i64>,
    pub threshold_percentage: Option<f64>,
}

/// Parameters of a `{"type": "rate", ...}` condition. Both fields are
/// required for the condition to ever evaluate true; missing fields make it
/// evaluate false rather than error.
#[derive(Debug, Clone, Deserialize)]
pub struct RateParams {
    pub count: Option<i64>,
    pub duration_minutes: Option<i64>,
}

/// Parameters of a `{"type": "composite", ...}` condition.
#[derive(Debug, Clone, Deserialize)]
pub struct CompositeParams {
    pub operator: BoolOp,
    #[serde(default)]
    pub conditions: Vec<serde_json::Value>,
}

/// Compares a stored value against a condition operand.
///
/// The operand is coerced to the value's kind under the same strict rules as
/// ingestion; an operand of the wrong kind never matches. Numerics compare
/// with decimal semantics. Booleans support equality only (ordering a bool
/// would reintroduce the bool-as-integer coercion we reject at ingest).
/// Strings order lexicographically.
pub fn compare(op: CompareOp, value: &MetricValue, operand: &serde_json::Value) -> bool {
    let Ok(operand) = typed_value(value.kind(), operand) else {
        return false;
    };

    match (value, &operand) {
        (MetricValue::Numeric(a), MetricValue::Numeric(b)) => op.check_ordering(a.cmp(b)),
        (MetricValue::Boolean(a), MetricValue::Boolean(b)) => {
            op.is_equality() && op.check_ordering(a.cmp(b))
        }
        (MetricValue::Text(a), MetricValue::Text(b)) => op.check_ordering(a.as_str().cmp(b)),
        _ => false,
    }
}

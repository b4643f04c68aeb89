//! The predicate tree and its JSON wire shape.
//!
//! Conditions deserialize from the same JSON the HTTP API accepts:
//! a leaf is `{"field": ..., "operator": ..., "value": ...}`, a logical
//! node is `{"operator": "and"|"or"|"not", "conditions": [...]}`.

use meshdb_core::{value, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operators available on a leaf condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    Regex,
    Exists,
    Type,
    Contains,
    StartsWith,
    EndsWith,
}

/// Logical combinators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

/// A query predicate. Nests to arbitrary depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Leaf {
        field: String,
        operator: CompareOp,
        value: Value,
    },
    Logical {
        operator: LogicalOp,
        conditions: Vec<Condition>,
    },
}

impl Condition {
    pub fn field(field: impl Into<String>, operator: CompareOp, value: Value) -> Self {
        Condition::Leaf {
            field: field.into(),
            operator,
            value,
        }
    }

    pub fn and(conditions: Vec<Condition>) -> Self {
        Condition::Logical {
            operator: LogicalOp::And,
            conditions,
        }
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Condition::Logical {
            operator: LogicalOp::Or,
            conditions,
        }
    }

    pub fn negate(condition: Condition) -> Self {
        Condition::Logical {
            operator: LogicalOp::Not,
            conditions: vec![condition],
        }
    }

    /// Reject structurally invalid predicates before execution: regex
    /// patterns must compile, `type` names must come from the closed set,
    /// `exists` takes a boolean, `not` takes exactly one child.
    pub fn validate(&self) -> Result<()> {
        match self {
            Condition::Leaf {
                field,
                operator,
                value,
            } => {
                if field.is_empty() {
                    return Err(Error::malformed("predicate", "empty field path"));
                }
                match operator {
                    CompareOp::Regex => {
                        let pattern = value.as_str().ok_or_else(|| {
                            Error::malformed("predicate", "regex pattern must be a string")
                        })?;
                        regex::Regex::new(pattern).map_err(|e| {
                            Error::malformed("predicate", format!("bad regex: {e}"))
                        })?;
                    }
                    CompareOp::Exists => {
                        if !value.is_boolean() {
                            return Err(Error::malformed(
                                "predicate",
                                "exists takes a boolean",
                            ));
                        }
                    }
                    CompareOp::Type => {
                        let name = value.as_str().unwrap_or_default();
                        if !value::TYPE_NAMES.contains(&name) {
                            return Err(Error::malformed(
                                "predicate",
                                format!("unknown type name: {name:?}"),
                            ));
                        }
                    }
                    _ => {}
                }
                Ok(())
            }
            Condition::Logical {
                operator,
                conditions,
            } => {
                if *operator == LogicalOp::Not && conditions.len() != 1 {
                    return Err(Error::malformed(
                        "predicate",
                        "not takes exactly one condition",
                    ));
                }
                for cond in conditions {
                    cond.validate()?;
                }
                Ok(())
            }
        }
    }
}

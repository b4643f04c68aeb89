//! Condition evaluation against a document payload.

use crate::condition::{CompareOp, Condition, LogicalOp};
use meshdb_core::value::{compare_values, lookup_path, type_matches, values_equal};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Whether `data` satisfies `condition`.
pub fn matches(data: &Map<String, Value>, condition: &Condition) -> bool {
    match condition {
        Condition::Leaf {
            field,
            operator,
            value,
        } => match lookup_path(data, field) {
            Some(found) => matches_present(found, *operator, value),
            None => matches_absent(*operator, value),
        },
        Condition::Logical {
            operator,
            conditions,
        } => match operator {
            LogicalOp::And => conditions.iter().all(|c| matches(data, c)),
            LogicalOp::Or => conditions.iter().any(|c| matches(data, c)),
            LogicalOp::Not => conditions
                .first()
                .map(|c| !matches(data, c))
                .unwrap_or(false),
        },
    }
}

/// Operator semantics when the field path did not resolve: `exists: false`
/// and `nin` hold, everything else fails.
fn matches_absent(operator: CompareOp, value: &Value) -> bool {
    match operator {
        CompareOp::Exists => value == &Value::Bool(false),
        CompareOp::Nin => true,
        _ => false,
    }
}

fn matches_present(found: &Value, operator: CompareOp, value: &Value) -> bool {
    match operator {
        CompareOp::Eq => values_equal(found, value),
        CompareOp::Ne => !values_equal(found, value),
        CompareOp::Gt => compare_values(found, value) == Ordering::Greater,
        CompareOp::Gte => compare_values(found, value) != Ordering::Less,
        CompareOp::Lt => compare_values(found, value) == Ordering::Less,
        CompareOp::Lte => compare_values(found, value) != Ordering::Greater,
        CompareOp::In => value
            .as_array()
            .map(|items| items.iter().any(|v| values_equal(found, v)))
            .unwrap_or(false),
        CompareOp::Nin => value
            .as_array()
            .map(|items| !items.iter().any(|v| values_equal(found, v)))
            .unwrap_or(true),
        CompareOp::Regex => match (found.as_str(), value.as_str()) {
            (Some(s), Some(pattern)) => regex::Regex::new(pattern)
                .map(|re| re.is_match(s))
                .unwrap_or(false),
            _ => false,
        },
        CompareOp::Exists => value == &Value::Bool(true),
        CompareOp::Type => value
            .as_str()
            .map(|name| type_matches(found, name))
            .unwrap_or(false),
        CompareOp::Contains => str_pair(found, value)
            .map(|(s, sub)| s.contains(sub))
            .unwrap_or(false),
        CompareOp::StartsWith => str_pair(found, value)
            .map(|(s, prefix)| s.starts_with(prefix))
            .unwrap_or(false),
        CompareOp::EndsWith => str_pair(found, value)
            .map(|(s, suffix)| s.ends_with(suffix))
            .unwrap_or(false),
    }
}

fn str_pair<'a>(a: &'a Value, b: &'a Value) -> Option<(&'a str, &'a str)> {
    Some((a.as_str()?, b.as_str()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data() -> Map<String, Value> {
        json!({
            "name": "Ana",
            "age": 30,
            "address": {"city": "Madrid", "zip": "28001"},
            "tags": ["admin", "ops"]
        })
        .as_object()
        .unwrap()
        .clone()
    }

    fn check(field: &str, op: CompareOp, value: Value) -> bool {
        matches(&data(), &Condition::field(field, op, value))
    }

    #[test]
    fn equality_is_strict() {
        assert!(check("age", CompareOp::Eq, json!(30)));
        assert!(!check("age", CompareOp::Eq, json!("30")));
        assert!(check("age", CompareOp::Ne, json!("30")));
    }

    #[test]
    fn nested_paths_resolve() {
        assert!(check("address.city", CompareOp::Eq, json!("Madrid")));
        assert!(check("address.city", CompareOp::StartsWith, json!("Mad")));
    }

    #[test]
    fn absent_fields() {
        assert!(check("missing", CompareOp::Exists, json!(false)));
        assert!(!check("missing", CompareOp::Exists, json!(true)));
        assert!(check("missing", CompareOp::Nin, json!([1, 2])));
        assert!(!check("missing", CompareOp::Eq, json!(null)));
        assert!(!check("missing", CompareOp::Lt, json!(10)));
    }

    #[test]
    fn membership() {
        assert!(check("age", CompareOp::In, json!([10, 20, 30])));
        assert!(!check("age", CompareOp::In, json!([10, 20])));
        assert!(check("age", CompareOp::Nin, json!([10, 20])));
        // A non-array operand never matches `in`.
        assert!(!check("age", CompareOp::In, json!(30)));
    }

    #[test]
    fn regex_and_substrings() {
        assert!(check("name", CompareOp::Regex, json!("^A.a$")));
        assert!(!check("name", CompareOp::Regex, json!("^B")));
        assert!(check("name", CompareOp::Contains, json!("n")));
        assert!(check("address.zip", CompareOp::EndsWith, json!("001")));
        // Regex against a non-string field fails rather than erroring.
        assert!(!check("age", CompareOp::Regex, json!("3.*")));
    }

    #[test]
    fn type_checks() {
        assert!(check("age", CompareOp::Type, json!("integer")));
        assert!(check("tags", CompareOp::Type, json!("array")));
        assert!(check("address", CompareOp::Type, json!("object")));
        assert!(!check("age", CompareOp::Type, json!("string")));
    }

    #[test]
    fn logical_composition() {
        let d = data();
        let cond = Condition::and(vec![
            Condition::field("age", CompareOp::Gte, json!(25)),
            Condition::field("age", CompareOp::Lte, json!(35)),
        ]);
        assert!(matches(&d, &cond));

        let cond = Condition::or(vec![
            Condition::field("age", CompareOp::Gt, json!(100)),
            Condition::field("name", CompareOp::Eq, json!("Ana")),
        ]);
        assert!(matches(&d, &cond));

        let cond = Condition::negate(Condition::field("age", CompareOp::Eq, json!(30)));
        assert!(!matches(&d, &cond));
    }
}

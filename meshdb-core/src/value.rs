//! JSON value utilities shared by the query engine, the index manager and
//! the memory sweeper: dotted-path lookup, a total ordering, type naming
//! and in-memory size estimation.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Resolve a dotted field path (`a.b.c`) against a nested object.
///
/// Resolution failure is not an error: a missing key or a non-object
/// intermediate simply yields `None` ("field absent").
pub fn lookup_path<'a>(data: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = data.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Total ordering over JSON values.
///
/// Numbers compare by magnitude, strings lexicographically (chronologically
/// when both parse as RFC 3339 timestamps), booleans false-before-true.
/// Any cross-type pair, and arrays/objects, fall back to comparing their
/// string rendering.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => {
            match (parse_datetime(x), parse_datetime(y)) {
                (Some(dx), Some(dy)) => dx.cmp(&dy),
                _ => x.cmp(y),
            }
        }
        _ => display_string(a).cmp(&display_string(b)),
    }
}

/// Strict equality: same JSON type and same value, no coercion.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    a == b
}

/// The closed set of queryable type names.
pub const TYPE_NAMES: &[&str] = &[
    "null", "string", "integer", "float", "boolean", "array", "object", "date",
];

/// Whether `value` matches the given type name.
///
/// `date` matches strings that parse as RFC 3339 timestamps; such strings
/// do not also match `string`, mirroring how the original system kept the
/// two apart.
pub fn type_matches(value: &Value, name: &str) -> bool {
    match name {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "integer" => matches!(value, Value::Number(n) if n.is_i64() || n.is_u64()),
        "float" => matches!(value, Value::Number(n) if n.is_f64()),
        "string" => matches!(value, Value::String(s) if parse_datetime(s).is_none()),
        "date" => matches!(value, Value::String(s) if parse_datetime(s).is_some()),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => false,
    }
}

/// String rendering used for cross-type comparison and composite index
/// keys. Strings render bare (no quotes), everything else as compact JSON.
pub fn display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Rough in-memory footprint of a value, in bytes. Used by the memory
/// sweeper to decide when the document ceiling has been crossed.
pub fn estimate_size(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 4,
        Value::Number(_) => 8,
        Value::String(s) => s.len(),
        Value::Array(items) => items.iter().map(estimate_size).sum(),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| k.len() + estimate_size(v))
            .sum(),
    }
}

/// Footprint of a whole document payload plus its fixed fields.
pub fn estimate_document_size(id: &str, collection: &str, data: &Map<String, Value>) -> usize {
    // 100 bytes covers the struct itself and the two timestamps.
    100 + id.len()
        + collection.len()
        + data
            .iter()
            .map(|(k, v)| k.len() + estimate_size(v))
            .sum::<usize>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn lookup_traverses_nested_objects() {
        let data = obj(json!({"a": {"b": {"c": 42}}}));
        assert_eq!(lookup_path(&data, "a.b.c"), Some(&json!(42)));
        assert_eq!(lookup_path(&data, "a.b"), Some(&json!({"c": 42})));
        assert_eq!(lookup_path(&data, "a.x.c"), None);
        assert_eq!(lookup_path(&data, "missing"), None);
    }

    #[test]
    fn lookup_stops_at_non_objects() {
        let data = obj(json!({"a": 1}));
        assert_eq!(lookup_path(&data, "a.b"), None);
    }

    #[test]
    fn numbers_compare_by_magnitude() {
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!(2.5), &json!(2)), Ordering::Greater);
    }

    #[test]
    fn timestamps_compare_chronologically() {
        let early = json!("2024-01-02T00:00:00Z");
        let late = json!("2024-01-10T00:00:00Z");
        // Lexicographic order would agree here, so use one where it differs.
        let a = json!("2024-09-30T23:59:59Z");
        let b = json!("2024-10-01T00:00:00+02:00");
        assert_eq!(compare_values(&early, &late), Ordering::Less);
        assert_eq!(compare_values(&a, &b), Ordering::Greater);
    }

    #[test]
    fn cross_type_falls_back_to_strings() {
        assert_eq!(compare_values(&json!(1), &json!("1")), Ordering::Equal);
        assert_ne!(compare_values(&json!(true), &json!("a")), Ordering::Equal);
    }

    #[test]
    fn type_names() {
        assert!(type_matches(&json!(null), "null"));
        assert!(type_matches(&json!(3), "integer"));
        assert!(type_matches(&json!(3.5), "float"));
        assert!(type_matches(&json!("hi"), "string"));
        assert!(type_matches(&json!("2024-01-01T00:00:00Z"), "date"));
        assert!(!type_matches(&json!("2024-01-01T00:00:00Z"), "string"));
        assert!(type_matches(&json!([1]), "array"));
        assert!(type_matches(&json!({"a": 1}), "object"));
    }

    #[test]
    fn size_estimates_grow_with_payload() {
        let small = obj(json!({"a": "x"}));
        let large = obj(json!({"a": "x".repeat(1000)}));
        assert!(
            estimate_document_size("id", "col", &large)
                > estimate_document_size("id", "col", &small)
        );
    }
}

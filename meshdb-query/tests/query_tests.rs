//! End-to-end query execution tests: filtering, sorting, pagination and
//! the wire-JSON parse path used by the HTTP adapter.

use meshdb_core::Document;
use meshdb_query::{CompareOp, Condition, Query, SortDirection};
use serde_json::{json, Map, Value};

fn doc(collection: &str, data: Value) -> Document {
    let map: Map<String, Value> = data.as_object().unwrap().clone();
    Document::new(collection, map)
}

fn users() -> Vec<Document> {
    vec![
        doc("users", json!({"name": "a", "age": 20, "city": "Oslo"})),
        doc("users", json!({"name": "b", "age": 30, "city": "Madrid"})),
        doc("users", json!({"name": "c", "age": 40, "city": "Madrid"})),
        doc("users", json!({"name": "d", "age": 30})),
    ]
}

#[test]
fn and_range_returns_exact_matches() {
    let query = Query::new("users").filter(Condition::and(vec![
        Condition::field("age", CompareOp::Gte, json!(25)),
        Condition::field("age", CompareOp::Lte, json!(35)),
    ]));

    let results = query.execute(users()).unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|d| d.data["age"] == json!(30)));
}

#[test]
fn no_condition_matches_everything() {
    let results = Query::new("users").execute(users()).unwrap();
    assert_eq!(results.len(), 4);
}

#[test]
fn or_and_not_compose() {
    let query = Query::new("users").filter(Condition::or(vec![
        Condition::field("age", CompareOp::Lt, json!(25)),
        Condition::negate(Condition::field("city", CompareOp::Eq, json!("Madrid"))),
    ]));

    // Matches "a" (both arms) and "d" (no city).
    let results = query.execute(users()).unwrap();
    let names: Vec<_> = results.iter().map(|d| d.data["name"].clone()).collect();
    assert_eq!(names, vec![json!("a"), json!("d")]);
}

#[test]
fn sort_ascending_and_descending() {
    let query = Query::new("users").sort("age", SortDirection::Asc);
    let results = query.execute(users()).unwrap();
    let ages: Vec<_> = results
        .iter()
        .map(|d| d.data["age"].as_i64().unwrap())
        .collect();
    assert_eq!(ages, vec![20, 30, 30, 40]);

    let query = Query::new("users").sort("name", SortDirection::Desc);
    let results = query.execute(users()).unwrap();
    assert_eq!(results[0].data["name"], json!("d"));
}

#[test]
fn sort_is_stable_on_ties() {
    // "b" and "d" share age 30; insertion order must survive the sort.
    let query = Query::new("users").sort("age", SortDirection::Asc);
    let results = query.execute(users()).unwrap();
    assert_eq!(results[1].data["name"], json!("b"));
    assert_eq!(results[2].data["name"], json!("d"));
}

#[test]
fn documents_missing_the_sort_key_order_last() {
    let query = Query::new("users").sort("city", SortDirection::Asc);
    let results = query.execute(users()).unwrap();
    assert_eq!(results.last().unwrap().data["name"], json!("d"));

    // Still last when descending.
    let query = Query::new("users").sort("city", SortDirection::Desc);
    let results = query.execute(users()).unwrap();
    assert_eq!(results.last().unwrap().data["name"], json!("d"));
}

#[test]
fn multi_key_sort_breaks_ties_with_later_keys() {
    let query = Query::new("users")
        .sort("age", SortDirection::Asc)
        .sort("name", SortDirection::Desc);
    let results = query.execute(users()).unwrap();
    let names: Vec<_> = results.iter().map(|d| d.data["name"].clone()).collect();
    assert_eq!(names, vec![json!("a"), json!("d"), json!("b"), json!("c")]);
}

#[test]
fn skip_and_limit_apply_after_sort() {
    let query = Query::new("users")
        .sort("age", SortDirection::Asc)
        .skip(1)
        .limit(2);
    let results = query.execute(users()).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].data["name"], json!("b"));
    assert_eq!(results[1].data["name"], json!("d"));
}

#[test]
fn zero_limit_is_unbounded() {
    let query = Query::new("users").limit(0);
    assert_eq!(query.execute(users()).unwrap().len(), 4);
}

#[test]
fn repeated_execution_is_idempotent() {
    let query = Query::new("users")
        .filter(Condition::field("city", CompareOp::Eq, json!("Madrid")))
        .sort("name", SortDirection::Asc);

    let first = query.execute(users()).unwrap();
    let second = query.execute(users()).unwrap();
    let names =
        |docs: &[Document]| docs.iter().map(|d| d.data["name"].clone()).collect::<Vec<_>>();
    assert_eq!(names(&first), names(&second));
}

#[test]
fn invalid_predicates_fail_before_scanning() {
    let query =
        Query::new("users").filter(Condition::field("name", CompareOp::Regex, json!("(")));
    let err = query.execute(users()).unwrap_err();
    assert_eq!(err.error_code(), "MALFORMED");
}

#[test]
fn query_parses_from_wire_json() {
    let query: Query = serde_json::from_value(json!({
        "collection": "users",
        "condition": {
            "operator": "and",
            "conditions": [
                {"field": "age", "operator": "gte", "value": 25},
                {"field": "city", "operator": "startswith", "value": "Mad"}
            ]
        },
        "options": {"skip": 0, "limit": 5, "sort": [{"field": "age", "direction": "desc"}]}
    }))
    .unwrap();

    let results = query.execute(users()).unwrap();
    let ages: Vec<_> = results
        .iter()
        .map(|d| d.data["age"].as_i64().unwrap())
        .collect();
    assert_eq!(ages, vec![40, 30]);
}

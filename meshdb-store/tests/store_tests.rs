//! Store behavior: CRUD contracts, queries, events, backups, indexes and
//! the replication apply path.

use meshdb_core::Operation;
use meshdb_store::{EventOrigin, IndexKind, RemoteOutcome, Store, StoreEvent};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn data(value: Value) -> Map<String, Value> {
    value.as_object().unwrap().clone()
}

fn persistent_store() -> (TempDir, Store) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path()).unwrap();
    (dir, store)
}

#[test]
fn create_then_get_returns_identical_document() {
    let (_dir, store) = persistent_store();

    let doc = store
        .create("users", data(json!({"name": "Ana", "age": 30})))
        .unwrap();
    assert!(!doc.id.is_empty());
    assert_eq!(doc.created_at, doc.updated_at);
    assert_eq!(doc.data, data(json!({"name": "Ana", "age": 30})));

    let fetched = store.get(&doc.id).unwrap();
    assert_eq!(fetched, doc);
}

#[test]
fn update_merges_shallowly_and_advances_updated_at() {
    let (_dir, store) = persistent_store();
    let doc = store
        .create("users", data(json!({"name": "Ana", "age": 30})))
        .unwrap();

    let updated = store
        .update(&doc.id, data(json!({"age": 31, "city": "Madrid"})))
        .unwrap();
    assert_eq!(
        updated.data,
        data(json!({"name": "Ana", "age": 31, "city": "Madrid"}))
    );
    assert!(updated.updated_at > updated.created_at);
}

#[test]
fn mutations_on_unknown_ids_are_not_found() {
    let (_dir, store) = persistent_store();
    assert_eq!(
        store.get("nope").unwrap_err().error_code(),
        "NOT_FOUND"
    );
    assert_eq!(
        store.update("nope", Map::new()).unwrap_err().error_code(),
        "NOT_FOUND"
    );
    assert_eq!(store.delete("nope").unwrap_err().error_code(), "NOT_FOUND");
}

#[test]
fn delete_removes_document_and_collection_disappears() {
    let (_dir, store) = persistent_store();
    let doc = store.create("users", data(json!({"name": "Ana"}))).unwrap();
    assert_eq!(store.collections(), vec!["users".to_string()]);

    store.delete(&doc.id).unwrap();
    assert_eq!(store.get(&doc.id).unwrap_err().error_code(), "NOT_FOUND");
    assert!(store.collections().is_empty());
}

#[test]
fn get_all_returns_creation_order() {
    let (_dir, store) = persistent_store();
    for name in ["a", "b", "c"] {
        store.create("users", data(json!({"name": name}))).unwrap();
    }
    store.create("other", data(json!({"name": "x"}))).unwrap();

    let docs = store.get_all("users");
    let names: Vec<_> = docs.iter().map(|d| d.data["name"].clone()).collect();
    assert_eq!(names, vec![json!("a"), json!("b"), json!("c")]);
}

#[test]
fn flat_query_matches_strictly() {
    let (_dir, store) = persistent_store();
    store
        .create("users", data(json!({"name": "Ana", "age": 30})))
        .unwrap();
    store
        .create("users", data(json!({"name": "Bruno", "age": "30"})))
        .unwrap();

    let results = store.query("users", &data(json!({"age": 30})));
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].data["name"], json!("Ana"));
}

#[test]
fn search_runs_the_full_query_engine() {
    use meshdb_query::{CompareOp, Condition, Query};

    let (_dir, store) = persistent_store();
    for age in [20, 30, 40] {
        store
            .create("users", data(json!({"name": format!("u{age}"), "age": age})))
            .unwrap();
    }

    let query = Query::new("users").filter(Condition::and(vec![
        Condition::field("age", CompareOp::Gte, json!(25)),
        Condition::field("age", CompareOp::Lte, json!(35)),
    ]));
    let results = store.search(&query).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].data["age"], json!(30));
}

#[tokio::test]
async fn each_listener_gets_exactly_one_event_per_mutation() {
    let (_dir, store) = persistent_store();
    let counter = Arc::new(AtomicUsize::new(0));

    let c = counter.clone();
    store.register_event_callback(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let doc = store.create("users", data(json!({"name": "Ana"}))).unwrap();
    store.update(&doc.id, data(json!({"age": 1}))).unwrap();
    store.delete(&doc.id).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn delete_event_carries_a_copy_of_the_document() {
    let (_dir, store) = persistent_store();
    let mut rx = store.subscribe_events();

    let doc = store.create("users", data(json!({"name": "Ana"}))).unwrap();
    store.delete(&doc.id).unwrap();

    let create_event: StoreEvent = rx.recv().await.unwrap();
    assert_eq!(create_event.op, Operation::Create);

    let delete_event = rx.recv().await.unwrap();
    assert_eq!(delete_event.op, Operation::Delete);
    assert_eq!(delete_event.origin, EventOrigin::Local);
    let snapshot = delete_event.document.unwrap();
    assert_eq!(snapshot.id, doc.id);
    assert_eq!(snapshot.data["name"], json!("Ana"));
}

#[test]
fn backup_restore_round_trip() {
    let (_dir, store) = persistent_store();
    let ids: Vec<String> = (0..3)
        .map(|i| {
            store
                .create("users", data(json!({"n": i})))
                .unwrap()
                .id
        })
        .collect();

    let name = store.create_backup().unwrap();
    assert!(store.list_backups().unwrap().contains(&name));

    for id in &ids {
        store.delete(id).unwrap();
    }
    assert!(store.get_all("users").is_empty());

    store.restore_from_backup(&name).unwrap();
    let docs = store.get_all("users");
    assert_eq!(docs.len(), 3);
    for id in &ids {
        assert!(store.get(id).is_ok());
    }
}

#[test]
fn restore_unknown_backup_is_not_found() {
    let (_dir, store) = persistent_store();
    assert_eq!(
        store
            .restore_from_backup("backup_never")
            .unwrap_err()
            .error_code(),
        "NOT_FOUND"
    );
}

#[test]
fn backups_unavailable_without_persistence() {
    let store = Store::in_memory();
    assert_eq!(
        store.create_backup().unwrap_err().error_code(),
        "PERSISTENCE_ERROR"
    );
}

#[test]
fn unique_index_rejects_second_insert() {
    let (_dir, store) = persistent_store();
    store
        .create_index("users_email", "users", vec!["email".into()], IndexKind::Unique)
        .unwrap();

    store
        .create("users", data(json!({"email": "a@x"})))
        .unwrap();
    let err = store
        .create("users", data(json!({"email": "a@x"})))
        .unwrap_err();
    assert_eq!(err.error_code(), "CONFLICT");

    // The losing insert left nothing behind.
    assert_eq!(store.get_all("users").len(), 1);
}

#[test]
fn index_lookup_reaches_documents() {
    let (_dir, store) = persistent_store();
    store
        .create_index("users_city", "users", vec!["city".into()], IndexKind::NonUnique)
        .unwrap();

    let doc = store
        .create("users", data(json!({"city": "Oslo"})))
        .unwrap();
    assert_eq!(
        store.lookup_by_field("users", "city", "Oslo").unwrap(),
        vec![doc.id]
    );
}

#[test]
fn create_survives_persistence_failure() {
    // A NUL byte in the collection name makes the directory creation fail,
    // after the in-memory insert has already happened.
    let (_dir, store) = persistent_store();
    let err = store.create("bad\0collection", data(json!({"x": 1})));
    let err = err.unwrap_err();
    assert_eq!(err.error_code(), "PERSISTENCE_ERROR");

    // The document is still visible in memory.
    let docs = store.get_all("bad\0collection");
    assert_eq!(docs.len(), 1);
    assert!(store.get(&docs[0].id).is_ok());
}

// ---------------------------------------------------------------
// Remote apply path
// ---------------------------------------------------------------

#[test]
fn remote_insert_lands_verbatim() {
    let (_dir, store) = persistent_store();
    let incoming = meshdb_core::Document::new("users", data(json!({"name": "remote"})));

    let outcome = store
        .apply_remote_upsert(incoming.clone(), "peer-a", "peer-z")
        .unwrap();
    assert_eq!(outcome, RemoteOutcome::AppliedCreate);

    let local = store.get(&incoming.id).unwrap();
    assert_eq!(local, incoming);
}

#[test]
fn newer_remote_update_wins_older_is_skipped() {
    let (_dir, store) = persistent_store();
    let doc = store.create("users", data(json!({"v": "local"}))).unwrap();

    // Older than ours: skipped.
    let mut stale = doc.clone();
    stale.data = data(json!({"v": "stale"}));
    stale.updated_at = doc.updated_at - chrono::Duration::seconds(10);
    assert_eq!(
        store
            .apply_remote_upsert(stale, "peer-a", "peer-z")
            .unwrap(),
        RemoteOutcome::Skipped
    );
    assert_eq!(store.get(&doc.id).unwrap().data["v"], json!("local"));

    // Newer than ours: replaces.
    let mut fresh = doc.clone();
    fresh.data = data(json!({"v": "fresh"}));
    fresh.updated_at = doc.updated_at + chrono::Duration::seconds(10);
    assert_eq!(
        store
            .apply_remote_upsert(fresh, "peer-a", "peer-z")
            .unwrap(),
        RemoteOutcome::AppliedUpdate
    );
    assert_eq!(store.get(&doc.id).unwrap().data["v"], json!("fresh"));
}

#[test]
fn timestamp_tie_breaks_to_lower_peer_id() {
    let (_dir, store) = persistent_store();
    let doc = store.create("users", data(json!({"v": "local"}))).unwrap();

    let mut tied = doc.clone();
    tied.data = data(json!({"v": "tied"}));
    // Same updated_at. Lower origin than our id wins...
    assert_eq!(
        store
            .apply_remote_upsert(tied.clone(), "aaaa", "zzzz")
            .unwrap(),
        RemoteOutcome::AppliedUpdate
    );
    // ...and a higher origin loses.
    tied.data = data(json!({"v": "loser"}));
    assert_eq!(
        store
            .apply_remote_upsert(tied, "zzzz", "aaaa")
            .unwrap(),
        RemoteOutcome::Skipped
    );
    assert_eq!(store.get(&doc.id).unwrap().data["v"], json!("tied"));
}

#[test]
fn remote_delete_is_unconditional() {
    let (_dir, store) = persistent_store();
    let doc = store.create("users", data(json!({"v": 1}))).unwrap();

    assert!(store.apply_remote_delete(&doc.id).unwrap());
    assert_eq!(store.get(&doc.id).unwrap_err().error_code(), "NOT_FOUND");

    // Unknown id is a no-op, not an error.
    assert!(!store.apply_remote_delete("unknown").unwrap());
}

#[tokio::test]
async fn remote_applies_are_tagged_remote_for_subscribers() {
    let (_dir, store) = persistent_store();
    let mut rx = store.subscribe_events();

    let incoming = meshdb_core::Document::new("users", data(json!({"name": "remote"})));
    store
        .apply_remote_upsert(incoming.clone(), "peer-a", "peer-z")
        .unwrap();

    let event = rx.recv().await.unwrap();
    assert_eq!(event.origin, EventOrigin::Remote);
    assert_eq!(event.op, Operation::Create);
    assert_eq!(event.id, incoming.id);
}

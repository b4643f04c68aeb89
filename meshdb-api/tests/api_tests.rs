//! Router-level tests driven through `tower::ServiceExt::oneshot`.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use meshdb_api::{create_router, AppState};
use meshdb_core::Document;
use meshdb_store::Store;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn test_app() -> (TempDir, axum::Router, Arc<Store>) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::open(dir.path()).unwrap());
    let state = AppState::new(store.clone());
    (dir, create_router(state), store)
}

#[tokio::test]
async fn health_answers() {
    let (_dir, app, _store) = test_app();
    let response = app
        .oneshot(request("GET", "/health", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn create_get_update_delete_flow() {
    let (_dir, app, _store) = test_app();

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/api/collections/users/documents",
            Some(json!({"data": {"name": "Ana", "age": 30}})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created: Document = serde_json::from_value(body_json(response).await).unwrap();
    assert_eq!(created.data["name"], json!("Ana"));

    let response = app
        .clone()
        .oneshot(request("GET", &format!("/api/documents/{}", created.id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(request(
            "PUT",
            &format!("/api/documents/{}", created.id),
            Some(json!({"data": {"age": 31}})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let updated = body_json(response).await;
    assert_eq!(updated["data"]["age"], json!(31));
    assert_eq!(updated["data"]["name"], json!("Ana"));

    let response = app
        .clone()
        .oneshot(request(
            "DELETE",
            &format!("/api/documents/{}", created.id),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(request("GET", &format!("/api/documents/{}", created.id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_document_maps_to_404_with_error_body() {
    let (_dir, app, _store) = test_app();
    let response = app
        .oneshot(request("GET", "/api/documents/nope", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["code"], json!("NOT_FOUND"));
}

#[tokio::test]
async fn query_endpoint_runs_predicates() {
    let (_dir, app, store) = test_app();
    for age in [20, 30, 40] {
        store
            .create("users", json!({"age": age}).as_object().unwrap().clone())
            .unwrap();
    }

    let response = app
        .oneshot(request(
            "POST",
            "/api/query",
            Some(json!({
                "collection": "users",
                "condition": {"field": "age", "operator": "gte", "value": 30},
                "options": {"sort": [{"field": "age", "direction": "desc"}]}
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let ages: Vec<i64> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["data"]["age"].as_i64().unwrap())
        .collect();
    assert_eq!(ages, vec![40, 30]);
}

#[tokio::test]
async fn malformed_query_is_a_400() {
    let (_dir, app, store) = test_app();
    store
        .create("users", json!({"n": 1}).as_object().unwrap().clone())
        .unwrap();

    let response = app
        .oneshot(request(
            "POST",
            "/api/query",
            Some(json!({
                "collection": "users",
                "condition": {"field": "n", "operator": "regex", "value": "("}
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn backup_endpoints_round_trip() {
    let (_dir, app, store) = test_app();
    store
        .create("users", json!({"n": 1}).as_object().unwrap().clone())
        .unwrap();

    let response = app
        .clone()
        .oneshot(request("POST", "/api/backups", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let name = body_json(response).await["name"].as_str().unwrap().to_string();

    let docs = store.get_all("users");
    store.delete(&docs[0].id).unwrap();

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            &format!("/api/backups/{name}/restore"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(store.get_all("users").len(), 1);
}

#[tokio::test]
async fn unique_index_violation_maps_to_409() {
    let (_dir, app, _store) = test_app();

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/api/indexes",
            Some(json!({
                "name": "users_email",
                "collection": "users",
                "fields": ["email"],
                "kind": "unique"
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let create = |app: axum::Router| async move {
        app.oneshot(request(
            "POST",
            "/api/collections/users/documents",
            Some(json!({"data": {"email": "a@x"}})),
        ))
        .await
        .unwrap()
    };
    assert_eq!(create(app.clone()).await.status(), StatusCode::CREATED);
    assert_eq!(create(app).await.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn cached_reads_survive_and_invalidate() {
    let (_dir, app, store) = test_app();
    let doc = store
        .create("users", json!({"v": 1}).as_object().unwrap().clone())
        .unwrap();

    // Prime the cache.
    let response = app
        .clone()
        .oneshot(request("GET", &format!("/api/documents/{}", doc.id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // A direct store mutation invalidates through the event bus.
    store
        .update(&doc.id, json!({"v": 2}).as_object().unwrap().clone())
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let response = app
        .oneshot(request("GET", &format!("/api/documents/{}", doc.id), None))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["data"]["v"], json!(2));
}

#[tokio::test]
async fn stats_reports_all_sections() {
    let (_dir, app, store) = test_app();
    store
        .create("users", json!({"n": 1}).as_object().unwrap().clone())
        .unwrap();

    let response = app
        .oneshot(request("GET", "/api/stats", None))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["store"]["documents"], json!(1));
    assert!(body.get("cache").is_some());
    assert_eq!(body["metrics"]["documents_created"], json!(1));
}

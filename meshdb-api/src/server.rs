//! REST surface over the store.

use crate::ws;
use axum::extract::{Path, Query as UrlQuery, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use meshdb_core::metrics::MetricsSnapshot;
use meshdb_core::{Document, Error};
use meshdb_query::Query;
use meshdb_store::{Cache, CacheConfig, CacheStats, IndexInfo, IndexKind, Store, StoreStats};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

// ========== API Types ==========

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub data: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    pub data: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct CreateIndexRequest {
    pub name: String,
    pub collection: String,
    pub fields: Vec<String>,
    pub kind: IndexKind,
}

#[derive(Debug, Serialize)]
pub struct BackupResponse {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub store: StoreStats,
    pub cache: CacheStats,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Deserialize)]
pub struct LookupParams {
    pub key: String,
}

// ========== Server State ==========

pub struct AppState {
    pub store: Arc<Store>,
    pub cache: Arc<Cache<Document>>,
}

impl AppState {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        Self::with_cache(store, CacheConfig::default())
    }

    pub fn with_cache(store: Arc<Store>, cache_config: CacheConfig) -> Arc<Self> {
        let cache = Arc::new(Cache::new(cache_config));

        // Drop cached copies the moment the store changes them, local or
        // remote.
        let invalidate = cache.clone();
        store.register_event_callback(move |event| {
            invalidate.delete(&doc_key(&event.id));
        });

        Arc::new(Self { store, cache })
    }
}

fn doc_key(id: &str) -> String {
    format!("doc:{id}")
}

// ========== Routes ==========

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/collections", get(list_collections))
        .route(
            "/api/collections/:collection/documents",
            post(create_document).get(get_all_documents),
        )
        .route("/api/collections/:collection/find", post(find_documents))
        .route(
            "/api/documents/:id",
            get(get_document).put(update_document).delete(delete_document),
        )
        .route("/api/query", post(run_query))
        .route("/api/backups", post(create_backup).get(list_backups))
        .route("/api/backups/:name/restore", post(restore_backup))
        .route("/api/backups/:name", delete(delete_backup))
        .route("/api/indexes", post(create_index).get(list_indexes))
        .route("/api/indexes/:name", delete(drop_index))
        .route("/api/indexes/:name/lookup", get(lookup_index))
        .route("/api/stats", get(stats))
        .route("/ws", get(ws::websocket_handler))
        .with_state(state)
}

/// Bind and serve until the shutdown signal flips.
pub async fn serve(
    state: Arc<AppState>,
    addr: SocketAddr,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> meshdb_core::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Io {
            message: format!("binding {addr}"),
            source: e,
        })?;
    info!(%addr, "http api listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| Error::internal(format!("http server: {e}")))
}

fn reject(e: Error) -> (StatusCode, Json<ApiError>) {
    let status = match e.error_code() {
        "NOT_FOUND" => StatusCode::NOT_FOUND,
        "CONFLICT" => StatusCode::CONFLICT,
        "MALFORMED" => StatusCode::BAD_REQUEST,
        "CAPACITY_EXCEEDED" => StatusCode::TOO_MANY_REQUESTS,
        "TRANSPORT_ERROR" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ApiError {
            code: e.error_code(),
            message: e.to_string(),
        }),
    )
}

type ApiResult<T> = std::result::Result<T, (StatusCode, Json<ApiError>)>;

async fn health() -> &'static str {
    "ok"
}

async fn list_collections(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.store.collections())
}

async fn create_document(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    Json(request): Json<CreateRequest>,
) -> ApiResult<(StatusCode, Json<Document>)> {
    let doc = state
        .store
        .create(&collection, request.data)
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(doc)))
}

async fn get_all_documents(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
) -> Json<Vec<Document>> {
    Json(state.store.get_all(&collection))
}

async fn get_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Document>> {
    if let Some(doc) = state.cache.get(&doc_key(&id)) {
        return Ok(Json(doc));
    }
    let doc = state.store.get(&id).map_err(reject)?;
    state.cache.set(&doc_key(&id), doc.clone(), None);
    Ok(Json(doc))
}

async fn update_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<UpdateRequest>,
) -> ApiResult<Json<Document>> {
    let doc = state.store.update(&id, request.data).map_err(reject)?;
    Ok(Json(doc))
}

async fn delete_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.store.delete(&id).map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Flat equality filter over one collection.
async fn find_documents(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    Json(filter): Json<Map<String, Value>>,
) -> Json<Vec<Document>> {
    Json(state.store.query(&collection, &filter))
}

/// Full predicate query.
async fn run_query(
    State(state): State<Arc<AppState>>,
    Json(query): Json<Query>,
) -> ApiResult<Json<Vec<Document>>> {
    let results = state.store.search(&query).map_err(reject)?;
    Ok(Json(results))
}

async fn create_backup(State(state): State<Arc<AppState>>) -> ApiResult<Json<BackupResponse>> {
    let name = state.store.create_backup().map_err(reject)?;
    Ok(Json(BackupResponse { name }))
}

async fn list_backups(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.store.list_backups().map_err(reject)?))
}

async fn restore_backup(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.store.restore_from_backup(&name).map_err(reject)?;
    state.cache.clear();
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_backup(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.store.delete_backup(&name).map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_index(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateIndexRequest>,
) -> ApiResult<StatusCode> {
    state
        .store
        .create_index(
            &request.name,
            &request.collection,
            request.fields,
            request.kind,
        )
        .map_err(reject)?;
    Ok(StatusCode::CREATED)
}

async fn list_indexes(State(state): State<Arc<AppState>>) -> Json<Vec<IndexInfo>> {
    Json(state.store.list_indexes())
}

async fn drop_index(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.store.drop_index(&name).map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn lookup_index(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    UrlQuery(params): UrlQuery<LookupParams>,
) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(
        state.store.lookup_index(&name, &params.key).map_err(reject)?,
    ))
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        store: state.store.stats(),
        cache: state.cache.stats(),
        metrics: state.store.metrics().snapshot(),
    })
}

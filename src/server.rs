//! Admin HTTP API.
//!
//! Lets an operator trigger a pass and inspect or correct the bookkeeping
//! (cache markers, name relations, upload records) without touching the
//! database by hand.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/scan` | Run a pass now; `409` while one is in flight |
//! | `GET`  | `/cache?path=` | Marker name and processed flag of a folder |
//! | `DELETE` | `/cache?path=` | Remove a folder's marker |
//! | `GET`  | `/relations` | All name → knowledge-base relations |
//! | `GET`  | `/relations/search?name=` | Relations with an exact name |
//! | `POST` | `/relations` | Record a relation |
//! | `GET`  | `/records?knowledge_id=` | Upload records of a knowledge base |
//! | `GET`  | `/records/search?file_name=` | Records whose file key contains a fragment |
//! | `GET`  | `/records/{id}` | One upload record |
//! | `POST` | `/records` | Append an upload record |
//! | `DELETE` | `/records/{id}` | Delete an upload record |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "name must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `busy` (409),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::cache::ScanCache;
use crate::config::Config;
use crate::models::{NameRelation, NewNameRelation, NewUploadRecord, UploadRecord};
use crate::orchestrator::PassReport;
use crate::scheduler::PassGate;

/// Starts the admin server on `[server].bind` and serves until the process
/// ends or binding fails.
pub async fn run_server(config: &Config, gate: PassGate) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "admin API listening");
    axum::serve(listener, router(gate)).await?;
    Ok(())
}

/// Builds the router over a pass gate.
pub fn router(gate: PassGate) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/scan", post(handle_scan))
        .route("/cache", get(handle_cache_status).delete(handle_cache_invalidate))
        .route("/relations", get(handle_list_relations).post(handle_add_relation))
        .route("/relations/search", get(handle_search_relations))
        .route("/records", get(handle_list_records).post(handle_add_record))
        .route("/records/search", get(handle_search_records))
        .route("/records/{id}", get(handle_get_record).delete(handle_delete_record))
        .layer(cors)
        .with_state(gate)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %err, "admin request failed");
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        anyhow::Error::from(err).into()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn busy(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "busy",
        message: message.into(),
    }
}

/// Rejects a missing or blank required parameter.
fn required(value: Option<String>, name: &str) -> Result<String, AppError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(bad_request(format!("{} must not be empty", name))),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /scan ============

async fn handle_scan(State(gate): State<PassGate>) -> Result<Json<PassReport>, AppError> {
    match gate.try_run().await {
        Some(report) => Ok(Json(report)),
        None => Err(busy("a scan pass is already running")),
    }
}

// ============ /cache ============

#[derive(Deserialize)]
struct CacheQuery {
    path: Option<String>,
}

#[derive(Serialize)]
struct CacheStatus {
    path: String,
    marker: String,
    enabled: bool,
    processed: bool,
}

async fn handle_cache_status(
    State(gate): State<PassGate>,
    Query(q): Query<CacheQuery>,
) -> Result<Json<CacheStatus>, AppError> {
    let path = required(q.path, "path")?;
    let cache = gate.orchestrator().cache();
    let folder = std::path::Path::new(&path);
    Ok(Json(CacheStatus {
        marker: ScanCache::marker_name(folder),
        enabled: cache.is_enabled(),
        processed: cache.lookup(folder)?,
        path,
    }))
}

async fn handle_cache_invalidate(
    State(gate): State<PassGate>,
    Query(q): Query<CacheQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let path = required(q.path, "path")?;
    let removed = gate
        .orchestrator()
        .cache()
        .invalidate(std::path::Path::new(&path))?;
    Ok(Json(json!({ "path": path, "removed": removed })))
}

// ============ /relations ============

#[derive(Deserialize)]
struct RelationQuery {
    name: Option<String>,
}

async fn handle_list_relations(
    State(gate): State<PassGate>,
) -> Result<Json<Vec<NameRelation>>, AppError> {
    Ok(Json(gate.orchestrator().resolver().list().await?))
}

async fn handle_search_relations(
    State(gate): State<PassGate>,
    Query(q): Query<RelationQuery>,
) -> Result<Json<Vec<NameRelation>>, AppError> {
    let name = required(q.name, "name")?;
    Ok(Json(gate.orchestrator().resolver().find_by_name(&name).await?))
}

async fn handle_add_relation(
    State(gate): State<PassGate>,
    Json(body): Json<NewNameRelation>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    if body.name.trim().is_empty() || body.knowledge_id.trim().is_empty() {
        return Err(bad_request("name and knowledge_id must not be empty"));
    }
    gate.orchestrator()
        .resolver()
        .record(&body.name, &body.knowledge_id)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "name": body.name, "knowledge_id": body.knowledge_id })),
    ))
}

// ============ /records ============

#[derive(Deserialize)]
struct RecordQuery {
    knowledge_id: Option<String>,
    file_name: Option<String>,
}

async fn handle_list_records(
    State(gate): State<PassGate>,
    Query(q): Query<RecordQuery>,
) -> Result<Json<Vec<UploadRecord>>, AppError> {
    let knowledge_id = required(q.knowledge_id, "knowledge_id")?;
    Ok(Json(
        gate.orchestrator()
            .ledger()
            .by_knowledge_base(&knowledge_id)
            .await?,
    ))
}

async fn handle_search_records(
    State(gate): State<PassGate>,
    Query(q): Query<RecordQuery>,
) -> Result<Json<Vec<UploadRecord>>, AppError> {
    let fragment = required(q.file_name, "file_name")?;
    Ok(Json(
        gate.orchestrator()
            .ledger()
            .search_file_name(&fragment)
            .await?,
    ))
}

async fn handle_get_record(
    State(gate): State<PassGate>,
    Path(id): Path<i64>,
) -> Result<Json<UploadRecord>, AppError> {
    gate.orchestrator()
        .ledger()
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("no upload record with id {}", id)))
}

async fn handle_add_record(
    State(gate): State<PassGate>,
    Json(body): Json<NewUploadRecord>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    if body.knowledge_id.trim().is_empty() || body.file_name.trim().is_empty() {
        return Err(bad_request("knowledge_id and file_name must not be empty"));
    }
    let id = gate
        .orchestrator()
        .ledger()
        .record(&body.knowledge_id, &body.knowledge_name, &body.file_name)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn handle_delete_record(
    State(gate): State<PassGate>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    if gate.orchestrator().ledger().delete(id).await? {
        Ok(Json(json!({ "id": id, "deleted": true })))
    } else {
        Err(not_found(format!("no upload record with id {}", id)))
    }
}

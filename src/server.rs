//! HTTP status interface.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `POST`   | `/ingest` | Ingest one document, returns the ingestion report |
//! | `POST`   | `/requests` | Submit a requirement, returns `{ "request_id" }` |
//! | `GET`    | `/requests/{id}` | Poll state, attempts, and result or failure |
//! | `DELETE` | `/requests/{id}` | Cancel a request |
//! | `GET`    | `/collections` | Collections with document and chunk counts |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "requirement text must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `rate_limited` (429),
//! `provider_unavailable` (502), `internal` (500).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};

use caseforge_core::error::PipelineError;
use caseforge_core::models::{Document, IngestionReport};
use caseforge_core::store::CollectionSummary;

use crate::app::App;
use crate::config::Config;
use crate::ingest::DocumentIngestor;
use crate::orchestrator::{Orchestrator, RequestStatus};
use crate::sqlite_store;

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    ingestor: DocumentIngestor,
    orchestrator: Orchestrator,
    /// `None` when the index is not SQLite-backed.
    pool: Option<SqlitePool>,
}

impl AppState {
    pub fn new(
        ingestor: DocumentIngestor,
        orchestrator: Orchestrator,
        pool: Option<SqlitePool>,
    ) -> Self {
        Self {
            ingestor,
            orchestrator,
            pool,
        }
    }
}

/// Start the server on `[server].bind` and run until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let app = App::open(config).await?;
    let state = AppState::new(app.ingestor(), app.orchestrator()?, Some(app.pool.clone()));

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("caseforge listening on http://{}", bind_addr);
    tracing::info!(bind = %bind_addr, collection = %config.db.collection, "server started");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/ingest", post(handle_ingest))
        .route("/requests", post(handle_submit))
        .route("/requests/{id}", get(handle_poll).delete(handle_cancel))
        .route("/collections", get(handle_collections))
        .layer(cors)
        .with_state(state)
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
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::InvalidRequest(_) => return bad_request(err.to_string()),
            PipelineError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            PipelineError::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
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

// ============ POST /ingest ============

#[derive(Deserialize)]
struct IngestRequest {
    source_id: String,
    text: String,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<IngestionReport>, AppError> {
    if req.source_id.trim().is_empty() {
        return Err(bad_request("source_id must not be empty"));
    }

    let mut doc = Document::new(req.source_id, req.text);
    if let Some(ct) = req.content_type {
        doc = doc.with_content_type(ct);
    }
    if let Some(title) = req.title {
        doc = doc.with_title(title);
    }

    let report = state.ingestor.ingest(&doc).await?;
    Ok(Json(report))
}

// ============ /requests ============

#[derive(Deserialize)]
struct SubmitRequest {
    session_id: String,
    requirement: String,
    #[serde(default)]
    framework: Option<String>,
}

#[derive(Serialize)]
struct SubmitResponse {
    request_id: String,
}

async fn handle_submit(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    let request_id = state
        .orchestrator
        .submit(&req.session_id, &req.requirement, req.framework)?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { request_id })))
}

async fn handle_poll(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RequestStatus>, AppError> {
    state
        .orchestrator
        .poll(&id)
        .map(Json)
        .ok_or_else(|| not_found(format!("request not found: {}", id)))
}

#[derive(Serialize)]
struct CancelResponse {
    request_id: String,
    cancelled: bool,
}

async fn handle_cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    if state.orchestrator.poll(&id).is_none() {
        return Err(not_found(format!("request not found: {}", id)));
    }
    let cancelled = state.orchestrator.cancel(&id);
    Ok(Json(CancelResponse {
        request_id: id,
        cancelled,
    }))
}

// ============ GET /collections ============

#[derive(Serialize)]
struct CollectionsResponse {
    collections: Vec<CollectionSummary>,
}

async fn handle_collections(
    State(state): State<AppState>,
) -> Result<Json<CollectionsResponse>, AppError> {
    let pool = state
        .pool
        .as_ref()
        .ok_or_else(|| not_found("collections are only tracked by the SQLite index"))?;
    let collections = sqlite_store::list_collections(pool)
        .await
        .map_err(|e| internal(format!("{:#}", e)))?;
    Ok(Json(CollectionsResponse { collections }))
}

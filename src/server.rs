//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version and active model) |
//! | `POST` | `/search` | Retrieve context and citations for a query |
//! | `POST` | `/answer` | Retrieve, then generate an answer (requires `[generation]`) |
//! | `POST` | `/documents` | Ingest one document version |
//! | `GET`  | `/documents/{id}` | Catalogued document with its published chunks |
//! | `DELETE` | `/documents/{id}` | Remove a document from search |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "k must be >= 1" } }
//! ```
//!
//! | Code | Status | Raised for |
//! |------|--------|-----------|
//! | `bad_request` | 400 | invalid input, stale versions, dimension mismatches |
//! | `not_found` | 404 | unknown document |
//! | `timeout` | 408 | query exceeded `retrieval.timeout_secs` |
//! | `provider_unavailable` | 503 | provider retries exhausted |
//! | `index_corruption` | 500 | persisted index failed verification |
//! | `internal` | 500 | storage failures |

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use standards_search_core::generation::Answer;
use standards_search_core::models::{IngestReport, RemoveReport, RetrievalResult, SearchFilter};
use standards_search_core::RagError;

use crate::config::Config;
use crate::engine::{DocumentView, Engine, NewDocument};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
    query_timeout: Duration,
}

/// Open the engine and serve on `[server].bind` until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let engine = Arc::new(Engine::open(config).await?);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;

    tracing::info!(
        bind = %config.server.bind,
        model = engine.model_id(),
        "server listening"
    );
    println!("Standards Search listening on http://{}", config.server.bind);

    axum::serve(listener, router(engine)).await?;
    Ok(())
}

pub fn router(engine: Arc<Engine>) -> Router {
    let state = AppState {
        query_timeout: Duration::from_secs(engine.config().retrieval.timeout_secs),
        engine,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/search", post(handle_search))
        .route("/answer", post(handle_answer))
        .route("/documents", post(handle_ingest))
        .route(
            "/documents/{id}",
            get(handle_get_document).delete(handle_remove_document),
        )
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
    /// Machine-readable error code (e.g., `"bad_request"`, `"not_found"`).
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

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        let (status, code) = match &err {
            RagError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            RagError::ProviderUnavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "provider_unavailable")
            }
            RagError::IndexCorruption(_) => (StatusCode::INTERNAL_SERVER_ERROR, "index_corruption"),
            RagError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn timeout_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::REQUEST_TIMEOUT,
        code: "timeout",
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    model: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model: state.engine.model_id().to_string(),
    })
}

// ============ POST /search, POST /answer ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    k: Option<usize>,
    #[serde(default)]
    max_context_tokens: Option<usize>,
    #[serde(default)]
    filter: Option<SearchFilter>,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<RetrievalResult>, AppError> {
    let search = state.engine.search(
        &req.query,
        req.k,
        req.max_context_tokens,
        req.filter.as_ref(),
    );
    let result = tokio::time::timeout(state.query_timeout, search)
        .await
        .map_err(|_| timeout_error("search timed out"))??;
    Ok(Json(result))
}

async fn handle_answer(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<Answer>, AppError> {
    let ask = state
        .engine
        .ask(&req.query, req.k, req.max_context_tokens, req.filter.as_ref());
    let answer = tokio::time::timeout(state.query_timeout, ask)
        .await
        .map_err(|_| timeout_error("answer timed out"))??;
    Ok(Json(answer))
}

// ============ /documents ============

async fn handle_ingest(
    State(state): State<AppState>,
    Json(doc): Json<NewDocument>,
) -> Result<Json<IngestReport>, AppError> {
    Ok(Json(state.engine.ingest(doc).await?))
}

async fn handle_get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentView>, AppError> {
    state
        .engine
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("document not found: {}", id)))
}

async fn handle_remove_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RemoveReport>, AppError> {
    Ok(Json(state.engine.remove(&id).await?))
}

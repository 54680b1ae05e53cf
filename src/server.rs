//! JSON HTTP retrieval and control server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/search` | Semantic search over indexed chunks |
//! | `GET`  | `/similar/{content_id}` | More-like-this for one document |
//! | `GET`  | `/status` | Pipeline state plus index statistics |
//! | `POST` | `/pipeline/start` | Start an ingestion run |
//! | `POST` | `/pipeline/stop` | Cooperatively stop the active run |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! All error responses share one schema:
//!
//! ```json
//! { "error": { "code": "validation", "message": "query must not be empty" } }
//! ```
//!
//! Codes map to HTTP status: `validation` (400), `not_found` (404),
//! `conflict` (409), `rate_limited` (429), everything else (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser
//! clients.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::content::{FsContentSource, RunScope};
use crate::db;
use crate::embedding::create_provider;
use crate::error::Error;
use crate::index::SqliteVectorIndex;
use crate::models::{SearchFilters, SearchResponse};
use crate::pipeline::{Orchestrator, PipelineState, StartOptions};
use crate::retrieval::RetrievalService;
use crate::stats::{gather_stats, IndexStats};

#[derive(Clone)]
struct AppState {
    pool: sqlx::SqlitePool,
    retrieval: Arc<RetrievalService>,
    /// Absent when no content root is configured; pipeline endpoints then
    /// report a validation error.
    orchestrator: Option<Arc<Orchestrator>>,
}

/// Start the server on the configured bind address. Runs until the
/// process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let provider = create_provider(&config.embedding)?;
    let index = Arc::new(SqliteVectorIndex::new(
        pool.clone(),
        config.retrieval.scan_limit,
    ));

    let retrieval = Arc::new(RetrievalService::new(
        pool.clone(),
        provider.clone(),
        index.clone(),
        config.retrieval.clone(),
    ));

    let orchestrator = match config.content.root {
        Some(_) => {
            let source = Arc::new(FsContentSource::new(&config.content)?);
            Some(Arc::new(Orchestrator::new(
                pool.clone(),
                source,
                provider,
                index,
                config.chunking.clone(),
                config.pipeline.clone(),
            )))
        }
        None => None,
    };

    let state = AppState {
        pool,
        retrieval,
        orchestrator,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/search", post(handle_search))
        .route("/similar/{content_id}", get(handle_similar))
        .route("/status", get(handle_status))
        .route("/pipeline/start", post(handle_pipeline_start))
        .route("/pipeline/stop", post(handle_pipeline_stop))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    let bind_addr = &config.server.bind;
    tracing::info!(bind = %bind_addr, "server listening");
    println!("Semandex server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
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

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = match err {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn pipeline_unconfigured() -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "validation".to_string(),
        message: "content.root is not configured; pipeline control unavailable".to_string(),
    }
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    filters: SearchFilters,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    let response = state
        .retrieval
        .search(&request.query, request.top_k, &request.filters)
        .await?;
    Ok(Json(response))
}

// ============ GET /similar/{content_id} ============

#[derive(Deserialize)]
struct SimilarParams {
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default, rename = "type")]
    content_type: Option<String>,
}

async fn handle_similar(
    State(state): State<AppState>,
    Path(content_id): Path<String>,
    Query(params): Query<SimilarParams>,
) -> Result<Json<SearchResponse>, AppError> {
    let filters = SearchFilters {
        content_type: params.content_type,
        ..Default::default()
    };
    let response = state
        .retrieval
        .find_similar(&content_id, params.top_k, &filters)
        .await?
        .ok_or_else(|| {
            not_found(format!("no indexed vectors for content id: {}", content_id))
        })?;
    Ok(Json(response))
}

// ============ GET /status ============

#[derive(Serialize)]
struct StatusResponse {
    pipeline: Option<PipelineState>,
    stats: IndexStats,
}

async fn handle_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, AppError> {
    let pipeline = match &state.orchestrator {
        Some(orchestrator) => orchestrator.status().await?,
        None => None,
    };
    let stats = gather_stats(&state.pool).await?;
    Ok(Json(StatusResponse { pipeline, stats }))
}

// ============ POST /pipeline/start ============

#[derive(Deserialize, Default)]
struct StartRequest {
    #[serde(default)]
    scope: Option<RunScope>,
    #[serde(default)]
    force: bool,
}

#[derive(Serialize)]
struct StartResponse {
    run_id: String,
    total: i64,
}

async fn handle_pipeline_start(
    State(state): State<AppState>,
    body: Option<Json<StartRequest>>,
) -> Result<Json<StartResponse>, AppError> {
    let Some(orchestrator) = state.orchestrator.clone() else {
        return Err(pipeline_unconfigured());
    };
    let request = body.map(|Json(r)| r).unwrap_or_default();

    let started = orchestrator
        .start(StartOptions {
            scope: request.scope.unwrap_or_default(),
            force: request.force,
        })
        .await?;

    // Drive the run in the background; the endpoint returns immediately.
    let worker = orchestrator.clone();
    tokio::spawn(async move {
        if let Err(err) = worker.run_worker_until_idle().await {
            tracing::error!(error = %err, "pipeline worker exited with error");
        }
    });

    Ok(Json(StartResponse {
        run_id: started.run_id,
        total: started.overall.total,
    }))
}

// ============ POST /pipeline/stop ============

#[derive(Serialize)]
struct StopResponse {
    stopped: bool,
}

async fn handle_pipeline_stop(
    State(state): State<AppState>,
) -> Result<Json<StopResponse>, AppError> {
    let Some(orchestrator) = &state.orchestrator else {
        return Err(pipeline_unconfigured());
    };
    let stopped = orchestrator.stop().await?;
    Ok(Json(StopResponse { stopped }))
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

//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/index` | Run one indexing cycle (`{force_reindex?}`) |
//! | `POST` | `/search` | Ranked passages (`{query, k?, mode?, explain?}`) |
//! | `POST` | `/query` | Answer from vault passages (`{query, k?}`) |
//! | `GET`  | `/health` | Status, index size, cache hit rate |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `conflict` (409), `embedding_failed`
//! (502), `llm_unavailable` (503), `cycle_aborted` (503), `internal` (500).
//! A `cycle_aborted` error also carries the partial `summary` of the cycle.
//!
//! `/query` answers `{"answer": null, "sources": []}` when no passage was
//! relevant, so an empty vault is never confused with `llm_unavailable`.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::answer::{AnswerOutcome, AnswerSource};
use crate::config::Config;
use crate::error::PipelineError;
use crate::models::{IndexSummary, SearchMode, SearchResult};
use crate::service::{HealthReport, RetrievalService, ServiceError};

/// Open the service from `config` and serve until Ctrl-C. A running
/// indexing cycle is cancelled at its next batch boundary on shutdown.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let service = Arc::new(RetrievalService::open(config).await?);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("vsearch listening on http://{}", listener.local_addr()?);

    let signal = {
        let service = service.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
                return std::future::pending().await;
            }
            service.shutdown();
        }
    };
    let served = axum::serve(listener, router(service.clone()))
        .with_graceful_shutdown(signal)
        .await;
    service.close().await;
    Ok(served?)
}

/// Serve the API for `service` on an already bound listener.
pub async fn serve(
    listener: tokio::net::TcpListener,
    service: Arc<RetrievalService>,
) -> anyhow::Result<()> {
    axum::serve(listener, router(service)).await?;
    Ok(())
}

pub fn router(service: Arc<RetrievalService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/index", post(handle_index))
        .route("/search", post(handle_search))
        .route("/query", post(handle_query))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(service)
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
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<IndexSummary>,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    summary: Option<IndexSummary>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
                summary: self.summary,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
        summary: None,
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        let message = err.to_string();
        if let ServiceError::Pipeline(PipelineError::CycleAborted { summary, .. }) = err {
            error!(error = %message, "indexing cycle aborted");
            return AppError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                code: "cycle_aborted",
                message,
                summary: Some(*summary),
            };
        }
        let (status, code) = match &err {
            ServiceError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ServiceError::CycleInProgress => (StatusCode::CONFLICT, "conflict"),
            ServiceError::Pipeline(PipelineError::EmbeddingFailure(_)) => {
                (StatusCode::BAD_GATEWAY, "embedding_failed")
            }
            ServiceError::Pipeline(PipelineError::LlmUnavailable(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "llm_unavailable")
            }
            ServiceError::Pipeline(_) | ServiceError::Internal(_) => {
                error!(error = %message, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        AppError {
            status,
            code,
            message,
            summary: None,
        }
    }
}

// ============ POST /index ============

#[derive(Deserialize, Default)]
struct IndexRequest {
    #[serde(default)]
    force_reindex: bool,
}

/// An absent or empty body means `force_reindex = false`.
async fn handle_index(
    State(service): State<Arc<RetrievalService>>,
    body: axum::body::Bytes,
) -> Result<Json<IndexSummary>, AppError> {
    let req: IndexRequest = if body.is_empty() {
        IndexRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| bad_request(e.to_string()))?
    };
    info!(force = req.force_reindex, "index requested");
    Ok(Json(service.run_index(req.force_reindex).await?))
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    k: Option<usize>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    explain: bool,
}

async fn handle_search(
    State(service): State<Arc<RetrievalService>>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<Vec<SearchResult>>, AppError> {
    let Json(req) = payload?;
    let mode = match req.mode.as_deref() {
        None => SearchMode::Hybrid,
        Some(m) => m.parse::<SearchMode>().map_err(|e| bad_request(e.to_string()))?,
    };
    if req.k == Some(0) {
        return Err(bad_request("k must be >= 1"));
    }
    Ok(Json(
        service.search(&req.query, req.k, mode, req.explain).await?,
    ))
}

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    k: Option<usize>,
}

#[derive(Serialize)]
struct QueryResponse {
    answer: Option<String>,
    sources: Vec<AnswerSource>,
}

async fn handle_query(
    State(service): State<Arc<RetrievalService>>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, AppError> {
    let Json(req) = payload?;
    if req.k == Some(0) {
        return Err(bad_request("k must be >= 1"));
    }
    let response = match service.query(&req.query, req.k).await? {
        AnswerOutcome::Answered(a) => QueryResponse {
            answer: Some(a.answer),
            sources: a.sources,
        },
        AnswerOutcome::NoRelevantContent => QueryResponse {
            answer: None,
            sources: Vec::new(),
        },
    };
    Ok(Json(response))
}

// ============ GET /health ============

async fn handle_health(
    State(service): State<Arc<RetrievalService>>,
) -> Result<Json<HealthReport>, AppError> {
    Ok(Json(service.health().await?))
}

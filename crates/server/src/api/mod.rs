use crate::config::{AppState, ServerConfig};
use crate::middleware::auth::require_auth;
use anyhow::Result;
use axum::{
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use etl_workflow_core::types::ErrorKind;
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

/// Starts the HTTP gateway, binding `addr` and serving until the process is
/// killed.
pub async fn serve(addr: &str, config: ServerConfig) -> Result<()> {
    let state = AppState::new(&config).await?;

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn create_router(state: AppState) -> Router {
    let workflow_routes = Router::new()
        .route("/api/workflows", get(handlers::list_workflows).post(handlers::create_workflow))
        .route(
            "/api/workflows/{id}",
            get(handlers::get_workflow)
                .put(handlers::update_workflow)
                .delete(handlers::delete_workflow),
        )
        .route("/api/workflows/{id}/versions", get(handlers::get_workflow_versions))
        .route("/api/workflows/{id}/metrics", get(handlers::get_workflow_metrics))
        .route("/api/workflows/{id}/execute", post(handlers::execute_workflow))
        .route("/api/workflows/{id}/history", get(handlers::get_workflow_history))
        .route(
            "/api/workflows/{id}/executions/summaries",
            get(handlers::get_workflow_execution_summaries),
        )
        .route("/api/workflows/executions/{id}", get(handlers::get_execution))
        .route("/api/workflows/executions/{id}/cancel", post(handlers::cancel_execution))
        .route("/api/workflows/executions/{id}/pause", post(handlers::pause_execution))
        .route("/api/workflows/executions/{id}/resume", post(handlers::resume_execution))
        .route("/api/workflows/executions/{id}/events", get(handlers::get_execution_events))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(workflow_routes)
        .route("/health", get(health_check))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "etl-workflow-server",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now(),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Wraps an unexpected (anyhow) failure: storage/monitor plumbing that isn't
/// already typed as an `EngineError`. Always renders as a 500.
pub struct ApiError(anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_msg = self.0.to_string();
        let details = self.0.chain().skip(1).map(|e| e.to_string()).collect::<Vec<_>>().join(": ");

        let response = if details.is_empty() {
            ErrorResponse::new(error_msg)
        } else {
            ErrorResponse::with_details(error_msg, details)
        };

        (StatusCode::INTERNAL_SERVER_ERROR, Json(response)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Wraps the engine's own typed error, rendering the status code its
/// `ErrorKind` implies instead of collapsing everything to a 500.
pub struct EngineApiError(etl_workflow_core::engine::EngineError);

impl IntoResponse for EngineApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::ConfigurationError => StatusCode::BAD_REQUEST,
            ErrorKind::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout
            | ErrorKind::Cancelled
            | ErrorKind::ProcessorError
            | ErrorKind::PersistenceError => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorResponse::new(self.0.message))).into_response()
    }
}

impl From<etl_workflow_core::engine::EngineError> for EngineApiError {
    fn from(err: etl_workflow_core::engine::EngineError) -> Self {
        Self(err)
    }
}

pub type EngineApiResult<T> = Result<T, EngineApiError>;

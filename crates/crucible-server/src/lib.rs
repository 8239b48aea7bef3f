//! HTTP boundary for the execution pipeline
//!
//! Thin translation layer: handlers parse the request, pull the caller
//! identity out of the `x-user-id` header, and delegate to the
//! [`ExecutionGateway`]. All policy (validation, authorization, sync vs
//! queued) lives in the gateway; the only decisions made here are HTTP
//! ones, chiefly how each [`CrucibleError`] maps onto a status code.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crucible_core::{
    CrucibleError, ExecuteRequest, ExecutionGateway, ExecutionResult, JobStatus, LanguageSummary,
    SubmissionOutcome,
};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<ExecutionGateway>,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    pub session_id: String,
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub job_id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub job_id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LanguagesResponse {
    pub languages: Vec<LanguageSummary>,
}

#[derive(Debug, Serialize)]
pub struct KillResponse {
    pub session_id: String,
    pub pending: usize,
    pub killed: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub sandbox: bool,
    pub timestamp: DateTime<Utc>,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// HTTP-facing error wrapper. The gateway's error taxonomy maps directly
/// onto status codes; anything infrastructural is an opaque 500.
pub struct ApiError(pub CrucibleError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CrucibleError::InvalidInput(_) | CrucibleError::UnsupportedLanguage { .. } => {
                StatusCode::BAD_REQUEST
            }
            CrucibleError::AccessDenied(_) => StatusCode::FORBIDDEN,
            CrucibleError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            CrucibleError::TrackerFull(_) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("internal error serving request: {}", self.0);
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<CrucibleError> for ApiError {
    fn from(err: CrucibleError) -> Self {
        ApiError(err)
    }
}

fn caller_id(headers: &HeaderMap) -> Result<String, Response> {
    match headers.get("x-user-id").and_then(|v| v.to_str().ok()) {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody {
                error: "missing x-user-id header".into(),
            }),
        )
            .into_response()),
    }
}

async fn execute_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ExecuteBody>,
) -> Response {
    let user_id = match caller_id(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let request_id = body
        .request_id
        .or_else(|| {
            headers
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let request = ExecuteRequest {
        request_id,
        session_id: body.session_id,
        user_id,
        language: body.language,
        code: body.code,
        stdin: body.stdin,
        timeout_ms: body.timeout_ms,
    };

    match state.gateway.submit(request).await {
        Ok(SubmissionOutcome::Sync { job_id, result }) => (
            StatusCode::OK,
            Json(ExecuteResponse {
                job_id,
                status: "completed",
                result: Some(result),
            }),
        )
            .into_response(),
        Ok(SubmissionOutcome::Queued { job_id }) => (
            StatusCode::ACCEPTED,
            Json(ExecuteResponse {
                job_id,
                status: "queued",
                result: None,
            }),
        )
            .into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}

async fn status_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Response {
    let user_id = match caller_id(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.gateway.status(&job_id, &user_id).await {
        Ok(JobStatus::Pending {
            language,
            submitted_at,
        }) => Json(StatusResponse {
            job_id,
            status: "pending",
            language: Some(language.to_string()),
            submitted_at: Some(submitted_at),
            result: None,
            error: None,
        })
        .into_response(),
        Ok(JobStatus::Completed { result }) => Json(StatusResponse {
            job_id,
            status: "completed",
            language: None,
            submitted_at: None,
            result: Some(result),
            error: None,
        })
        .into_response(),
        Ok(JobStatus::Failed { error }) => Json(StatusResponse {
            job_id,
            status: "failed",
            language: None,
            submitted_at: None,
            result: None,
            error: Some(error),
        })
        .into_response(),
        Ok(JobStatus::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("no job {job_id}"),
            }),
        )
            .into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}

async fn languages_handler(State(state): State<AppState>) -> Json<LanguagesResponse> {
    Json(LanguagesResponse {
        languages: state.gateway.languages(),
    })
}

async fn kill_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Response {
    let user_id = match caller_id(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.gateway.kill_session(&session_id, &user_id).await {
        Ok(report) => Json(KillResponse {
            session_id,
            pending: report.pending,
            killed: report.killed,
        })
        .into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let sandbox = state.gateway.healthy().await;
    let status = if sandbox { "healthy" } else { "degraded" };
    let code = if sandbox {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(HealthResponse {
            status,
            sandbox,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
        .into_response()
}

/// Build the router with all routes and middleware.
pub fn build_router(gateway: Arc<ExecutionGateway>) -> Router {
    let state = AppState { gateway };
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/execute", post(execute_handler))
        .route("/execute/status/{job_id}", get(status_handler))
        .route("/execute/languages", get(languages_handler))
        .route("/execute/kill/{session_id}", post(kill_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the shutdown future resolves.
pub async fn serve_with_shutdown<F>(
    gateway: Arc<ExecutionGateway>,
    bind_addr: SocketAddr,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let router = build_router(gateway);
    let listener = TcpListener::bind(bind_addr).await?;
    log::info!("crucible server listening on {bind_addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    log::info!("crucible server shut down gracefully");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            log::info!("received SIGTERM, shutting down");
        },
    }
}

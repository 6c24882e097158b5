use crate::config::ApiConfig;
use crate::model::{UploadSession, UploadState};
use crate::queue::{DrainOutcome, UploadQueue};
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<UploadQueue>,
}

/// Queued session in API responses
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub event_id: String,
    pub created_at: DateTime<Utc>,
    pub uploaded_assets: usize,
    pub total_assets: usize,
    pub manifest_state: UploadState,
    pub complete_state: UploadState,
}

impl From<UploadSession> for SessionSummary {
    fn from(s: UploadSession) -> Self {
        let (uploaded_assets, total_assets) = s.progress();
        Self {
            session_id: s.session_id,
            event_id: s.event_id,
            created_at: s.created_at,
            uploaded_assets,
            total_assets,
            manifest_state: s.manifest_state,
            complete_state: s.complete_state,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Serialize)]
pub struct QueueStatusResponse {
    pub draining: bool,
    pub queued: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();

            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/sessions", get(list_sessions))
        .route("/api/v1/status", get(queue_status))
        .route("/api/v1/drain", post(trigger_drain))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "upload-queue"
    }))
}

/// Ready once the session store answers
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.queue.queued_sessions().await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "store": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "store": "unavailable",
                "error": e.to_string()
            })),
        ),
    }
}

#[instrument(skip(state))]
async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<SessionListResponse>, (StatusCode, Json<ErrorResponse>)> {
    let sessions = state.queue.queued_sessions().await.map_err(|e| {
        error!(error = %e, "Failed to list queued sessions");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "Failed to list queued sessions".to_string(),
                code: "STORE_ERROR".to_string(),
            }),
        )
    })?;

    Ok(Json(SessionListResponse {
        sessions: sessions.into_iter().map(Into::into).collect(),
    }))
}

async fn queue_status(
    State(state): State<AppState>,
) -> Result<Json<QueueStatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    let queued = state
        .queue
        .queued_sessions()
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to read queue status");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Failed to read queue status".to_string(),
                    code: "STORE_ERROR".to_string(),
                }),
            )
        })?
        .len();

    Ok(Json(QueueStatusResponse {
        draining: state.queue.is_draining(),
        queued,
    }))
}

/// Start a drain in the background
async fn trigger_drain(State(state): State<AppState>) -> impl IntoResponse {
    if state.queue.is_draining() {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "status": "already_running" })),
        );
    }

    let queue = state.queue.clone();
    tokio::spawn(async move {
        let outcome = queue
            .start_processing(
                |session_id| info!(session_id = %session_id, "Upload progress"),
                |session_id, e| warn!(session_id = %session_id, error = %e, "Upload halted"),
            )
            .await;

        if let DrainOutcome::Finished(summary) = outcome {
            info!(
                sessions = summary.sessions,
                completed = summary.completed,
                "Triggered drain finished"
            );
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "accepted" })),
    )
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting upload queue API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}

use super::state::AppState;
use crate::error::LiveError;
use crate::session::{SessionStatus, Transcript};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /live/start
/// Begin a session; progress is visible through /live/status
pub async fn start_session(State(state): State<AppState>) -> impl IntoResponse {
    let session = &state.session;
    info!("Start requested for session {}", session.session_id());

    match session.start().await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(StartSessionResponse {
                session_id: session.session_id().to_string(),
                status: session.status(),
                message: "Connecting".to_string(),
            }),
        )
            .into_response(),
        Err(e @ LiveError::InvalidState { .. }) => error_response(StatusCode::CONFLICT, e.to_string()),
        Err(e) => {
            error!("Failed to start session: {}", e);
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

/// POST /live/stop
/// Always succeeds; returns the final snapshot
pub async fn stop_session(State(state): State<AppState>) -> impl IntoResponse {
    info!("Stop requested for session {}", state.session.session_id());
    state.session.stop().await;
    get_status(State(state)).await.into_response()
}

/// GET /live/status
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.session.snapshot().await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => {
            error!("Failed to get snapshot: {}", e);
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

/// GET /live/transcript
/// Finalized turns, oldest first
pub async fn get_transcript(State(state): State<AppState>) -> impl IntoResponse {
    let transcript: Vec<Transcript> = state.session.transcripts();
    (StatusCode::OK, Json(transcript))
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

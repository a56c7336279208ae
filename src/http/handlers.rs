use super::state::AppState;
use crate::relay::{HealthStatus, RelayStatsSnapshot};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::info;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub uptime_seconds: f64,
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub provider: String,
    pub relay: RelayStatsSnapshot,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CloseSessionResponse {
    pub device_id: String,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn session_not_found(device_id: &str) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("No active session for device {}", device_id),
        }),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health
/// Liveness; reports offline with 503 once shutdown has begun.
/// Does not probe the upstream provider, the health topic does that.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let (code, status) = if state.engine.cancel_token().is_cancelled() {
        (StatusCode::SERVICE_UNAVAILABLE, HealthStatus::Offline)
    } else {
        (StatusCode::OK, HealthStatus::Healthy)
    };

    (code, Json(state.engine.health_record(status).await))
}

/// GET /stats
pub async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.engine.registry();

    Json(StatsResponse {
        uptime_seconds: state.engine.uptime().as_secs_f64(),
        active_sessions: registry.len().await,
        max_sessions: registry.limits().max_concurrent_sessions,
        provider: registry.provider().to_string(),
        relay: state.engine.stats(),
    })
}

/// GET /sessions
pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.registry().snapshot().await)
}

/// GET /sessions/:device_id
pub async fn get_session(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> impl IntoResponse {
    match state.engine.registry().get(&device_id).await {
        Some(session) => (StatusCode::OK, Json(session.stats())).into_response(),
        None => session_not_found(&device_id),
    }
}

/// DELETE /sessions/:device_id
/// Force-close a device's session; its driver tears down on its own
pub async fn close_session(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> impl IntoResponse {
    info!("Admin close requested for device {}", device_id);

    if state.engine.registry().close_device(&device_id).await {
        (
            StatusCode::OK,
            Json(CloseSessionResponse {
                device_id,
                status: "closed".to_string(),
            }),
        )
            .into_response()
    } else {
        session_not_found(&device_id)
    }
}

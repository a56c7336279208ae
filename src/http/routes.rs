use super::handlers;
use super::state::AppState;
use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        .route("/stats", get(handlers::get_stats))
        // Session inspection and control
        .route("/sessions", get(handlers::list_sessions))
        .route(
            "/sessions/:device_id",
            get(handlers::get_session).delete(handlers::close_session),
        )
        // Add tracing middleware for request logging
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

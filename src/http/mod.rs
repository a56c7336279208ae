//! HTTP admin API
//!
//! Read-only views of the relay plus forced session close:
//! - GET /health - Liveness and relay counters
//! - GET /stats - Relay counters
//! - GET /sessions - Every active session
//! - GET /sessions/:device_id - One device's session
//! - DELETE /sessions/:device_id - Close a device's session

mod handlers;
mod routes;
mod state;

pub use handlers::{CloseSessionResponse, ErrorResponse, StatsResponse};
pub use routes::create_router;
pub use state::AppState;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Serve the admin API on `bind:port` until `cancel` fires
pub async fn serve(state: AppState, bind: &str, port: u16, cancel: CancellationToken) -> Result<()> {
    let addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind admin API to {}", addr))?;

    info!("Admin API listening on http://{}", addr);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Admin API server failed")?;

    info!("Admin API stopped");
    Ok(())
}

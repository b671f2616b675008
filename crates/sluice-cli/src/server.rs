//! HTTP server for health and metrics endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use sluice_core::{CancellationToken, ClientMetrics};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// Shared state for HTTP endpoints.
pub struct ServerState {
    pub metrics: Arc<ClientMetrics>,
    /// Whether the stage uploader is usable
    pub uploader_healthy: Box<dyn Fn() -> bool + Send + Sync>,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve health and metrics until `shutdown` is cancelled.
pub async fn start_server(state: Arc<ServerState>, port: u16, shutdown: CancellationToken) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, port, "Failed to bind metrics server");
            return;
        }
    };

    info!(port, "Metrics server started");

    if let Err(e) = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        error!(error = %e, "Metrics server error");
    }
    info!("Metrics server stopped");
}

/// Liveness: healthy while stage credentials are usable.
async fn healthz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if (state.uploader_healthy)() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "stale stage credentials")
    }
}

/// Prometheus metrics endpoint handler.
async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.export_prometheus_text(),
    )
}

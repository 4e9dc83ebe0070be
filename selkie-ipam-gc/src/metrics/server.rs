//! HTTP server exposing `/metrics` and `/healthz`.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde_json::json;
use thiserror::Error;
use tokio::{net::TcpListener, sync::broadcast};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::metrics::registry;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to bind metrics listener: {0}")]
    Bind(std::io::Error),

    #[error("metrics server error: {0}")]
    Serve(std::io::Error),
}

/// Shared readiness flags surfaced on `/healthz`.
#[derive(Clone, Default)]
pub struct HealthState {
    pub caches_synced: Arc<AtomicBool>,
}

async fn metrics_handler() -> impl IntoResponse {
    match tokio::task::spawn_blocking(|| {
        let encoder = prometheus::TextEncoder::new();
        encoder.encode_to_string(&registry::REGISTRY.gather())
    })
    .await
    {
        Ok(Ok(body)) => (StatusCode::OK, body),
        Ok(Err(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {e}"),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics gathering task panicked: {e}"),
        ),
    }
}

async fn healthz_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let synced = state.caches_synced.load(Ordering::Relaxed);
    let status = if synced {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        axum::Json(json!({ "caches_synced": synced })),
    )
}

/// Serves until the shutdown signal fires.
pub async fn serve(
    listen_addr: &str,
    health: HealthState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), MetricsError> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(health);

    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(MetricsError::Bind)?;
    info!(
        event.name = "metrics.server_started",
        addr = %listen_addr,
        "metrics server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .map_err(MetricsError::Serve)
}

//! Metrics HTTP exporter
//!
//! Serves the worker's [`MetricsSnapshot`] as JSON on `/metrics` and a
//! liveness answer on `/health`.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metrics::{MetricsSnapshot, SharedMetrics};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind metrics exporter to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Metrics exporter failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// Handler for GET /metrics
async fn get_metrics(State(metrics): State<SharedMetrics>) -> Json<MetricsSnapshot> {
    let snapshot = metrics.read().await.clone();
    Json(snapshot)
}

async fn health() -> &'static str {
    "OK"
}

pub fn create_metrics_router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/health", get(health))
        .with_state(metrics)
}

/// Serve metrics on `addr` until `shutdown` is cancelled.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: SharedMetrics,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(addr = %addr, "Metrics exporter listening");

    axum::serve(listener, create_metrics_router(metrics))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(ServerError::Serve)
}

// src/server/metrics_server.rs

use crate::core::metrics::gather_metrics;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Handles HTTP requests to the /metrics endpoint. The reconciler updates
/// its own gauges each tick, so this just gathers and encodes them.
async fn metrics_handler() -> impl IntoResponse {
    let body = gather_metrics();
    (StatusCode::OK, [("content-type", "text/plain; version=0.0.4")], body)
}

/// Runs a simple HTTP server to expose Prometheus metrics on /metrics.
pub async fn run_metrics_server(port: u16, mut shutdown_rx: broadcast::Receiver<()>) {
    let app = Router::new().route("/metrics", get(metrics_handler));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("prometheus metrics server listening on http://{}/metrics", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind metrics server on port {}: {}", port, e);
            return;
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("metrics server shutting down");
        })
        .await
        .unwrap();
}

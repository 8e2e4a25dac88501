//! Axum HTTP server for probes and metrics

use std::net::SocketAddr;

use axum::{http::StatusCode, routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{Error, Result};

async fn healthz() -> &'static str {
    "ok"
}

/// Metrics endpoint handler
async fn metrics_handler() -> std::result::Result<String, StatusCode> {
    use prometheus_client::encoding::text::encode;
    let mut buffer = String::new();
    encode(&mut buffer, &crate::controller::metrics::REGISTRY)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(buffer)
}

fn router() -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
}

/// Run the health and metrics server on `addr`
pub async fn run_server(addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("Metrics server listening on {}", addr);

    axum::serve(listener, router())
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}

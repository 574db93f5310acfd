//! # HTTP servers
//!
//! Health and metrics endpoints on separate listeners:
//!
//! - health address: `/healthz` liveness (always 200) and `/readyz`
//!   readiness (200 once the controller is running)
//! - metrics address: `/metrics` in prometheus text format
//!
//! Addresses accept the `:PORT` shorthand for `0.0.0.0:PORT`.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Default)]
pub struct ServerState {
    pub is_ready: AtomicBool,
}

pub async fn start_health_server(addr: &str, state: Arc<ServerState>) -> Result<(), anyhow::Error> {
    let app = Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state);
    serve(addr, app, "health").await
}

pub async fn start_metrics_server(addr: &str) -> Result<(), anyhow::Error> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    serve(addr, app, "metrics").await
}

async fn serve(addr: &str, app: Router, kind: &str) -> Result<(), anyhow::Error> {
    let addr = listen_addr(addr);
    let listener = TcpListener::bind(&addr).await?;
    info!("{kind} server listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = crate::observability::metrics::REGISTRY.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {e}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
}

async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.is_ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_expands_port_shorthand() {
        assert_eq!(listen_addr(":9090"), "0.0.0.0:9090");
        assert_eq!(listen_addr("127.0.0.1:9090"), "127.0.0.1:9090");
    }
}

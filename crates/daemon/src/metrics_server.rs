//! Metrics HTTP server
//!
//! Exposes the metrics registry in Prometheus text format on its own port.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::metrics::SharedMetrics;

/// Content type of the Prometheus text exposition format.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Errors that can occur when running an HTTP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Handler for GET /metrics
async fn get_metrics(State(metrics): State<SharedMetrics>) -> Response {
    match metrics.encode_text() {
        Ok(body) => ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!(error = %e, "metrics encoding failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn health() -> &'static str {
    "OK"
}

/// Creates the axum Router with the metrics endpoint
pub fn create_metrics_router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/health", get(health))
        .with_state(metrics)
}

/// Wait until the shutdown flag flips to true (or its sender is gone).
pub(crate) async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

/// Bind `addr`, reporting the address in the error.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

/// Serve `router` on an already bound listener until shutdown.
pub(crate) async fn serve_on(
    listener: TcpListener,
    router: Router,
    shutdown: watch::Receiver<bool>,
    name: &'static str,
) -> Result<(), ServerError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, server = name, "listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_shutdown(shutdown))
        .await?;
    info!(server = name, "stopped");
    Ok(())
}

/// Serve the metrics router on a bound listener until `shutdown` flips to true
pub async fn serve_metrics(
    listener: TcpListener,
    metrics: SharedMetrics,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    serve_on(listener, create_metrics_router(metrics), shutdown, "metrics").await
}

/// Runs the metrics HTTP server until `shutdown` flips to true
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: SharedMetrics,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    serve_metrics(bind(addr).await?, metrics, shutdown).await
}

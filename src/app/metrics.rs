//! Prometheus-based metrics module
//!
//! Provides metrics collection using the Prometheus client library,
//! exposed via an optional /metrics endpoint.

use std::net::SocketAddr;

use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Tunnel Metrics ===

    /// Frames written to the tunnel transport
    pub static ref TUNNEL_FRAMES_SENT: IntCounter = IntCounter::new(
        "tunium_tunnel_frames_sent_total",
        "Total frames written to the tunnel transport"
    ).unwrap();

    /// Frames read from the tunnel transport
    pub static ref TUNNEL_FRAMES_RECEIVED: IntCounter = IntCounter::new(
        "tunium_tunnel_frames_received_total",
        "Total frames read from the tunnel transport"
    ).unwrap();

    /// Frames addressed to session ids this side no longer tracks
    pub static ref FRAMES_DROPPED: IntCounter = IntCounter::new(
        "tunium_frames_dropped_total",
        "Frames dropped because their session id was unknown"
    ).unwrap();

    // === Session Metrics ===

    /// Sessions opened, by originating side
    pub static ref SESSIONS_OPENED: IntCounterVec = IntCounterVec::new(
        Opts::new("tunium_sessions_opened_total", "Sessions opened per origin"),
        &["origin"]
    ).unwrap();

    /// Currently open sessions, by originating side
    pub static ref SESSIONS_ACTIVE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("tunium_sessions_active", "Currently open sessions per origin"),
        &["origin"]
    ).unwrap();

    /// Target dials that failed
    pub static ref DIAL_FAILURES: IntCounter = IntCounter::new(
        "tunium_dial_failures_total",
        "CONNECT target dials that failed"
    ).unwrap();

    // === Traffic Metrics ===

    /// Bytes read from session sockets
    pub static ref SESSION_BYTES_IN: IntCounter = IntCounter::new(
        "tunium_session_bytes_in_total",
        "Bytes read from session sockets"
    ).unwrap();

    /// Bytes written to session sockets
    pub static ref SESSION_BYTES_OUT: IntCounter = IntCounter::new(
        "tunium_session_bytes_out_total",
        "Bytes written to session sockets"
    ).unwrap();
}

/// Initialize and register all metrics with the global registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(TUNNEL_FRAMES_SENT.clone())).ok();
    REGISTRY.register(Box::new(TUNNEL_FRAMES_RECEIVED.clone())).ok();
    REGISTRY.register(Box::new(FRAMES_DROPPED.clone())).ok();
    REGISTRY.register(Box::new(SESSIONS_OPENED.clone())).ok();
    REGISTRY.register(Box::new(SESSIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(DIAL_FAILURES.clone())).ok();
    REGISTRY.register(Box::new(SESSION_BYTES_IN.clone())).ok();
    REGISTRY.register(Box::new(SESSION_BYTES_OUT.clone())).ok();
}

/// Serve `GET /metrics` until cancelled
pub async fn serve_metrics(addr: SocketAddr, cancel: CancellationToken) {
    let app = Router::new().route("/metrics", get(metrics_handler));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("metrics listener failed to bind {}: {}", addr, e);
            return;
        }
    };
    info!("metrics listening on {}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await });
    if let Err(e) = served.await {
        warn!("metrics server error: {}", e);
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buf) {
        warn!("metrics encode failed: {}", e);
    }
    ([(CONTENT_TYPE, "text/plain; version=0.0.4")], buf)
}

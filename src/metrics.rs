use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{http::header::CONTENT_TYPE, routing::get, Router};
use once_cell::sync::Lazy;
use prometheus::{
    opts, register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

static FRONT_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!(
        "slotline_front_connections",
        "currently open client connections"
    ))
    .expect("front connections gauge registration must succeed")
});

static FRONT_CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "slotline_front_connections_total",
        "client connections accepted since start"
    ))
    .expect("front connections counter registration must succeed")
});

static GLOBAL_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "slotline_global_error_total",
        "errors returned to clients"
    ))
    .expect("global error counter registration must succeed")
});

static BACKEND_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "slotline_backend_error_total",
            "backend link failures by backend"
        ),
        &["backend"]
    )
    .expect("backend error counter registration must succeed")
});

static REDIRECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "slotline_redirection_total",
            "cluster redirections followed, by kind"
        ),
        &["kind"]
    )
    .expect("redirection counter registration must succeed")
});

static TOPOLOGY_REFRESHES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "slotline_topology_refresh_total",
        "successful CLUSTER NODES refreshes"
    ))
    .expect("topology refresh counter registration must succeed")
});

pub fn front_conn_open() {
    FRONT_CONNECTIONS.inc();
    FRONT_CONNECTIONS_TOTAL.inc();
}

pub fn front_conn_close() {
    FRONT_CONNECTIONS.dec();
}

pub fn global_error_incr() {
    GLOBAL_ERRORS.inc();
}

pub fn backend_error(backend: &str) {
    BACKEND_ERRORS.with_label_values(&[backend]).inc();
}

pub fn redirection(kind: &str) {
    REDIRECTIONS.with_label_values(&[kind]).inc();
}

pub fn topology_refresh() {
    TOPOLOGY_REFRESHES.inc();
}

/// Expose the registry on `GET /metrics`.
pub async fn serve(addr: SocketAddr) -> Result<JoinHandle<()>> {
    let app = Router::new().route("/metrics", get(render));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
    info!(%addr, "metrics exporter listening");
    Ok(tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    }))
}

async fn render() -> ([(axum::http::HeaderName, &'static str); 1], Vec<u8>) {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    let _ = encoder.encode(&families, &mut buffer);
    ([(CONTENT_TYPE, "text/plain; version=0.0.4")], buffer)
}

//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  - Prometheus text format
//!   GET /healthz  - Liveness check (always 200 if process is running)

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use sib_protocol::{Command, ConnectionObserver};
use std::sync::Arc;

type Labels = Vec<(String, String)>;

#[derive(Clone, Default)]
pub struct ServerMetrics {
    connections: Family<Labels, Counter>,
    handshakes_failed: Counter,
    operations: Family<Labels, Counter>,
}

impl ServerMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "sibvault_connections",
            "Connections by admission outcome (accepted, banned)",
            metrics.connections.clone(),
        );
        registry.register(
            "sibvault_handshakes_failed",
            "Handshakes that ended in an error",
            metrics.handshakes_failed.clone(),
        );
        registry.register(
            "sibvault_operations",
            "Vault operations by command and outcome",
            metrics.operations.clone(),
        );
        metrics
    }

    pub fn connection(&self, outcome: &str) {
        self.connections
            .get_or_create(&vec![("outcome".to_string(), outcome.to_string())])
            .inc();
    }
}

impl ConnectionObserver for ServerMetrics {
    fn on_handshake(&self, ok: bool) {
        if !ok {
            self.handshakes_failed.inc();
        }
    }

    fn on_operation(&self, command: Command, ok: bool) {
        let labels = vec![
            ("command".to_string(), command.tag().to_lowercase()),
            ("outcome".to_string(), if ok { "ok" } else { "error" }.to_string()),
        ];
        self.operations.get_or_create(&labels).inc();
    }
}

/// Serve Prometheus metrics and the liveness check on `addr`
pub async fn serve(addr: String, registry: Arc<Registry>) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(registry);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz");

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

fn render(registry: &Registry) -> Result<String, std::fmt::Error> {
    let mut body = String::new();
    encode(&mut body, registry)?;
    Ok(body)
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    match render(&registry) {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Liveness check: returns 200 if the process is running.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

//! Liveness/readiness endpoints and the Prometheus exposition endpoint,
//! served by two small HTTP servers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{HealthConfig, MetricsConfig};
use crate::error::{ArchiverError, Result};
use crate::metrics::MetricsCollector;

/// Shared health state flipped by the components that own each signal:
/// the consumer context marks Kafka ready on its first assignment, the
/// storage writer marks storage ready once its backend is constructed,
/// and shutdown clears liveness.
#[derive(Debug)]
pub struct ReadinessProbe {
    alive: AtomicBool,
    kafka_ready: AtomicBool,
    storage_ready: AtomicBool,
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        ReadinessProbe {
            alive: AtomicBool::new(true),
            kafka_ready: AtomicBool::new(false),
            storage_ready: AtomicBool::new(false),
        }
    }
}

impl ReadinessProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn set_kafka_ready(&self, ready: bool) {
        self.kafka_ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_storage_ready(&self, ready: bool) {
        self.storage_ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.is_alive()
            && self.kafka_ready.load(Ordering::SeqCst)
            && self.storage_ready.load(Ordering::SeqCst)
    }

    /// Per-dependency status map exposed by the readiness endpoint.
    pub fn checks(&self) -> BTreeMap<&'static str, &'static str> {
        let mut checks = BTreeMap::new();
        checks.insert(
            "kafka",
            if self.kafka_ready.load(Ordering::SeqCst) { "ok" } else { "not ready" },
        );
        checks.insert(
            "storage",
            if self.storage_ready.load(Ordering::SeqCst) { "ok" } else { "not ready" },
        );
        checks
    }
}

async fn liveness(State(probe): State<Arc<ReadinessProbe>>) -> (StatusCode, Json<serde_json::Value>) {
    if probe.is_alive() {
        (
            StatusCode::OK,
            Json(json!({
                "status": "alive",
                "timestamp": chrono::Utc::now().to_rfc3339(),
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not alive",
                "timestamp": chrono::Utc::now().to_rfc3339(),
            })),
        )
    }
}

async fn readiness(State(probe): State<Arc<ReadinessProbe>>) -> (StatusCode, Json<serde_json::Value>) {
    let checks = probe.checks();
    let status = if probe.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if status == StatusCode::OK { "ready" } else { "not ready" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "checks": checks,
    });
    (status, Json(body))
}

async fn metrics_text(State(metrics): State<Arc<MetricsCollector>>) -> String {
    metrics.gather()
}

pub fn health_router(config: &HealthConfig, probe: Arc<ReadinessProbe>) -> Router {
    Router::new()
        .route(&config.liveness_path, get(liveness))
        .route(&config.readiness_path, get(readiness))
        .with_state(probe)
}

pub fn metrics_router(config: &MetricsConfig, metrics: Arc<MetricsCollector>) -> Router {
    Router::new()
        .route(&config.path, get(metrics_text))
        .with_state(metrics)
}

/// Serves the health endpoints until the token is cancelled.
pub async fn serve_health(
    config: HealthConfig,
    probe: Arc<ReadinessProbe>,
    cancel: CancellationToken,
) -> Result<()> {
    let router = health_router(&config, probe);
    serve(router, config.port, "health", cancel).await
}

/// Serves the Prometheus endpoint until the token is cancelled.
pub async fn serve_metrics(
    config: MetricsConfig,
    metrics: Arc<MetricsCollector>,
    cancel: CancellationToken,
) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }
    let router = metrics_router(&config, metrics);
    serve(router, config.port, "metrics", cancel).await
}

async fn serve(router: Router, port: u16, name: &'static str, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| ArchiverError::config(format!("failed to bind {name} server on port {port}: {e}")))?;
    info!(port, "{name} server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(ArchiverError::Io)?;
    Ok(())
}

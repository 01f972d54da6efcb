//! HTTP endpoints for probes and metrics scraping.
//!
//! - `GET /health/live`: the process is up
//! - `GET /health/ready`: the broker connection is usable
//! - `GET /metrics`: Prometheus exposition format

use analysis_orchestrator_runtime::{HealthReport, ReadinessProbe};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Shared state of the health server.
#[derive(Clone, Default)]
pub struct HealthState {
    probes: Vec<Arc<dyn ReadinessProbe>>,
    metrics: Option<PrometheusHandle>,
}

impl HealthState {
    /// State answering readiness with `probes`.
    #[must_use]
    pub fn new(probes: Vec<Arc<dyn ReadinessProbe>>) -> Self {
        Self {
            probes,
            metrics: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Build the health/metrics router.
#[must_use]
pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Liveness probe.
///
/// Always returns 200 OK while the process can answer HTTP.
#[allow(clippy::unused_async)] // Axum handlers must be async
async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Readiness probe.
///
/// Returns 200 OK with the report when every probe is ready,
/// otherwise 503 Service Unavailable.
async fn readiness(State(state): State<HealthState>) -> (StatusCode, Json<HealthReport>) {
    let report = HealthReport::collect(&state.probes).await;

    let status = if report.status.is_healthy() {
        StatusCode::OK
    } else {
        tracing::warn!(status = %report.status, "Readiness check failed");
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(report))
}

#[allow(clippy::unused_async)] // Axum handlers must be async
async fn metrics(State(state): State<HealthState>) -> Response {
    match state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

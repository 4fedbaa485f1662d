//! Admin HTTP handlers for the ingestion worker.
//!
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`): ready while the supervisor is
//!   running and not draining
//! - Prometheus metrics (`/metrics`)
//! - Aggregate counters as JSON (`/stats`)

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::metrics::{self, PipelineMetrics, StatsSnapshot};
use crate::supervisor::{Phase, Supervisor, SupervisorState};

/// Shared state for admin endpoints.
#[derive(Clone)]
pub struct HealthState {
    /// Supervisor lifecycle phase
    pub supervisor: Arc<SupervisorState>,
    /// Pipeline counters
    pub metrics: PipelineMetrics,
    /// Application name.
    pub app_name: String,
    /// Application version.
    pub app_version: String,
}

impl HealthState {
    pub fn new(
        supervisor: Arc<SupervisorState>,
        metrics: PipelineMetrics,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            supervisor,
            metrics,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }

    /// State observing a running supervisor.
    pub fn for_supervisor(
        supervisor: &Supervisor,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self::new(
            supervisor.state(),
            supervisor.metrics().clone(),
            app_name,
            app_version,
        )
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Status (always "healthy" if responding).
    pub status: String,
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
}

/// Liveness probe handler. Always OK while the server responds.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
pub async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    let phase = state.supervisor.phase();
    let ready = phase == Phase::Running;
    let status = if ready { "ready" } else { "not_ready" };
    let body = json!({
        "status": status,
        "phase": phase,
        "in_flight": state.metrics.snapshot().in_flight,
    });

    if ready {
        (StatusCode::OK, Json(body))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        ),
    }
}

/// Aggregate counters as JSON.
pub async fn stats_handler(State(state): State<HealthState>) -> Json<StatsSnapshot> {
    Json(state.metrics.snapshot())
}

/// Create the admin router.
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

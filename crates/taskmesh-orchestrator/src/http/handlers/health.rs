//! Health and metrics handlers.

use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, Json};

use crate::http::responses::HealthResponse;
use crate::orchestrator::Orchestrator;

/// Health check endpoint.
pub async fn health_check(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        active_workers: orchestrator
            .list_workers()
            .iter()
            .filter(|w| w.state.accepts_assignments())
            .count(),
        pending_faults: orchestrator.pending_faults(),
    })
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    let body = crate::metrics::collect_metrics(&orchestrator);
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

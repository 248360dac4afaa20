//! Fault and audit trail handlers.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};

use crate::http::responses::AuditQuery;
use crate::orchestrator::Orchestrator;

/// Every fault supervision has observed.
pub async fn list_faults(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    Json(orchestrator.list_faults())
}

/// Audit entries after `?since=<seq>`.
pub async fn audit_since(
    State(orchestrator): State<Arc<Orchestrator>>,
    Query(query): Query<AuditQuery>,
) -> impl IntoResponse {
    Json(orchestrator.audit_since(query.since))
}

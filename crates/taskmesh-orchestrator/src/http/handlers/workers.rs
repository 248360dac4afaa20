//! Worker list handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};

use taskmesh_core::WorkerId;

use super::not_found;
use crate::http::responses::WorkerResponse;
use crate::orchestrator::Orchestrator;

/// List live workers as JSON.
pub async fn list_workers(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    let response: Vec<WorkerResponse> = orchestrator
        .list_workers()
        .into_iter()
        .map(WorkerResponse::from)
        .collect();
    Json(response)
}

/// Describe one worker, including recently retired ones.
pub async fn get_worker(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(worker_id): Path<String>,
) -> impl IntoResponse {
    match orchestrator.describe_worker(&WorkerId::new(worker_id.clone())) {
        Some(worker) => Json(WorkerResponse::from(worker)).into_response(),
        None => not_found("worker", &worker_id).into_response(),
    }
}

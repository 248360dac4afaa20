//! Task lookup handler.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};

use taskmesh_core::TaskId;

use super::not_found;
use crate::http::responses::TaskResponse;
use crate::orchestrator::Orchestrator;

/// Task status, current assignment and contribution progress.
pub async fn get_task(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    let id = TaskId::new(task_id.clone());
    let Some(task) = orchestrator.get_task(&id) else {
        return not_found("task", &task_id).into_response();
    };
    let assignment = orchestrator.assignment(&id);
    let progress = orchestrator.progress(&id);
    Json(TaskResponse::new(task, assignment, progress)).into_response()
}

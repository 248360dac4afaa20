//! Aggregated result handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use futures_util::stream::{Stream, StreamExt};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::warn;

use taskmesh_core::TaskId;

use super::not_found;
use crate::orchestrator::Orchestrator;

pub async fn get_aggregation(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    match orchestrator.get_aggregation(&TaskId::new(task_id.clone())) {
        Some(result) => Json(result).into_response(),
        None => not_found("aggregation", &task_id).into_response(),
    }
}

/// Server-sent events, one `aggregation` event per completed task.
pub async fn stream_aggregations(
    State(orchestrator): State<Arc<Orchestrator>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(orchestrator.subscribe()).map(|item| {
        let event = match item {
            Ok(result) => Event::default()
                .event("aggregation")
                .json_data(&result)
                .unwrap_or_else(|e| {
                    warn!(task_id = %result.task_id, error = %e, "Failed to encode aggregation");
                    Event::default().comment("encoding failed")
                }),
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                warn!(skipped = n, "Aggregation stream lagged, skipping events");
                Event::default().comment(format!("skipped {n} events"))
            }
        };
        Ok(event)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

//! HTTP request handlers.

mod aggregations;
mod health;
mod supervision;
mod tasks;
mod workers;

pub use aggregations::{get_aggregation, stream_aggregations};
pub use health::{health_check, metrics_handler};
pub use supervision::{audit_since, list_faults};
pub use tasks::get_task;
pub use workers::{get_worker, list_workers};

use axum::{http::StatusCode, Json};

use crate::http::responses::ErrorResponse;

fn not_found(what: &str, id: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("{what} not found: {id}"),
        }),
    )
}

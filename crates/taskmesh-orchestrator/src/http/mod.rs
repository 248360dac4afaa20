//! HTTP server for the orchestrator.
//!
//! Read-only endpoints:
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)
//! - Worker list (`/v1/workers`, `/v1/workers/:id`)
//! - Task lookup with contribution progress (`/v1/tasks/:id`)
//! - Observed faults and audit trail (`/v1/faults`, `/v1/audit?since=`)
//! - Aggregated results (`/v1/aggregations/:task_id`) and their SSE feed
//!   (`/v1/aggregations/stream`)

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::orchestrator::Orchestrator;

mod handlers;
pub mod responses;

/// Create the HTTP router.
pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/workers", get(handlers::list_workers))
        .route("/v1/workers/:worker_id", get(handlers::get_worker))
        .route("/v1/tasks/:task_id", get(handlers::get_task))
        .route("/v1/faults", get(handlers::list_faults))
        .route("/v1/audit", get(handlers::audit_since))
        .route("/v1/aggregations/stream", get(handlers::stream_aggregations))
        .route("/v1/aggregations/:task_id", get(handlers::get_aggregation))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(orchestrator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use taskmesh_core::{Task, TaskId};

    use crate::testing::{test_config, StubBackend};

    fn orchestrator() -> Arc<Orchestrator> {
        Orchestrator::new(test_config(), StubBackend::new()).unwrap()
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_json(create_router(orchestrator()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_workers"], 0);
    }

    #[tokio::test]
    async fn test_metrics_is_prometheus_text() {
        let response = create_router(orchestrator())
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("# TYPE taskmesh_workers gauge"));
    }

    #[tokio::test]
    async fn test_workers_and_task_lookup() {
        let orch = orchestrator();
        let worker_id = orch.spawn_worker("echo", BTreeMap::new()).await.unwrap();
        let task_id = TaskId::new("t-1");
        orch.submit(Task::new("payload").with_id(task_id.clone()).with_expected_contributions(2))
            .unwrap();

        let router = create_router(orch.clone());
        let (status, workers) = get_json(router.clone(), "/v1/workers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(workers.as_array().unwrap().len(), 1);
        assert_eq!(workers[0]["worker_id"], worker_id.as_str());
        assert_eq!(workers[0]["state"], "active");
        assert_eq!(workers[0]["load"], 1);

        let (status, task) = get_json(router.clone(), "/v1/tasks/t-1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(task["status"], "assigned");
        assert_eq!(task["assigned_to"], worker_id.as_str());
        assert_eq!(task["contributions_received"], 0);
        assert_eq!(task["contributions_expected"], 2);

        let (status, _) = get_json(router, "/v1/tasks/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_aggregation_lookup() {
        let orch = orchestrator();
        let worker_id = orch.spawn_worker("echo", BTreeMap::new()).await.unwrap();
        let task_id = TaskId::new("t-2");
        orch.submit(Task::new("payload").with_id(task_id.clone())).unwrap();

        let router = create_router(orch.clone());
        let (status, _) = get_json(router.clone(), "/v1/aggregations/t-2").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        orch.complete(&task_id, &worker_id, "{\"answer\":42}").unwrap();
        let (status, body) = get_json(router, "/v1/aggregations/t-2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["task_id"], "t-2");
        assert_eq!(body["contribution_count"], 1);
    }

    #[tokio::test]
    async fn test_audit_since_filters_by_sequence() {
        let orch = orchestrator();
        orch.spawn_worker("echo", BTreeMap::new()).await.unwrap();
        let total = orch.audit_since(0).len();
        assert!(total >= 2);

        let router = create_router(orch);
        let (status, all) = get_json(router.clone(), "/v1/audit").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(all.as_array().unwrap().len(), total);

        let (_, tail) = get_json(router.clone(), "/v1/audit?since=1").await;
        assert_eq!(tail.as_array().unwrap().len(), total - 1);

        let (_, faults) = get_json(router, "/v1/faults").await;
        assert!(faults.as_array().unwrap().is_empty());
    }
}

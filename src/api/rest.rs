//! REST API Handlers
//!
//! Exposes the orchestrator's three operations over HTTP. Resize and delete
//! block until the operation reaches a terminal state, so clients should use
//! generous request timeouts.

use crate::engine::VolumeOrchestrator;
use crate::error::{Error, ErrorClass, Result};
use axum::{
    extract::{Json, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListVolumesQuery {
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Resize request body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeVolumeRequest {
    /// Requested capacity (e.g., "10Gi", "500M")
    pub size: String,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiErrorResponse {
    /// HTTP status for an engine error
    pub fn status_of(err: &Error) -> StatusCode {
        if err.is_not_found() {
            return StatusCode::NOT_FOUND;
        }
        match err.class() {
            ErrorClass::Input => StatusCode::BAD_REQUEST,
            ErrorClass::Precondition => StatusCode::CONFLICT,
            ErrorClass::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorClass::ControlPlane | ErrorClass::Incomplete => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn from_error(err: &Error) -> Self {
        let error = if err.is_not_found() {
            "not_found".to_string()
        } else {
            err.class().to_string()
        };
        Self {
            error,
            message: err.to_string(),
            details: err.is_retryable().then(|| "retryable".to_string()),
        }
    }
}

fn error_response(err: Error) -> Response {
    let status = ApiErrorResponse::status_of(&err);
    if status.is_server_error() {
        error!(error = %err, "request failed");
    }
    (status, Json(ApiErrorResponse::from_error(&err))).into_response()
}

/// Run an operation on its own task. A client that disconnects drops only
/// the response, never a resize halfway through its irreversible steps.
async fn detached<T: Send + 'static>(
    operation: impl Future<Output = Result<T>> + Send + 'static,
) -> Result<T> {
    tokio::spawn(operation)
        .await
        .map_err(|e| Error::Internal(format!("operation task failed: {}", e)))?
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    orchestrator: Arc<VolumeOrchestrator>,
}

impl RestRouter {
    pub fn new(orchestrator: Arc<VolumeOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            orchestrator: self.orchestrator,
        };

        Router::new()
            // Volume endpoints
            .route("/v1/volumes", get(list_volumes))
            .route("/v1/namespaces/:namespace/volumes/:name", delete(delete_volume))
            .route(
                "/v1/namespaces/:namespace/volumes/:name/resize",
                post(resize_volume),
            )
            // Operational endpoints
            .route("/metrics", get(metrics))
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<VolumeOrchestrator>,
}

// =============================================================================
// Handlers
// =============================================================================

async fn list_volumes(
    State(state): State<AppState>,
    Query(query): Query<ListVolumesQuery>,
) -> Response {
    match state
        .orchestrator
        .list_volumes(query.namespace.as_deref())
        .await
    {
        Ok(volumes) => (StatusCode::OK, Json(volumes)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Resize a volume; returns the report once the claim is back in service
async fn resize_volume(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(request): Json<ResizeVolumeRequest>,
) -> Response {
    info!(namespace, name, size = %request.size, "resize requested");
    let orchestrator = state.orchestrator;
    let operation = detached(async move {
        orchestrator
            .resize_volume(&namespace, &name, &request.size)
            .await
    });
    match operation.await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_volume(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    info!(namespace, name, "delete requested");
    let orchestrator = state.orchestrator;
    let operation =
        detached(async move { orchestrator.delete_volume(&namespace, &name).await });
    match operation.await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.orchestrator.metrics().render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check: the cluster API must answer a list call
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.orchestrator.list_volumes(None).await {
        Ok(_) => (StatusCode::OK, "ready".to_string()),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("cluster unreachable: {}", e),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::{fixtures, ClusterCall, InMemoryCluster};
    use crate::config::MigrationConfig;
    use crate::domain::claim::requested_storage;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn router() -> (Arc<InMemoryCluster>, Router) {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.seed_storage_class("standard", "example.com/csi");
        cluster.seed_bound_claim("ns", "data", "5Gi", "standard", 3 << 30);
        cluster.seed_pod(fixtures::pod_using("ns", "web-0", "data"));
        let orchestrator =
            VolumeOrchestrator::new(MigrationConfig::default(), cluster.clone()).unwrap();
        (cluster, RestRouter::new(orchestrator).build())
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn resize_request(size: &str) -> Request<Body> {
        Request::post("/v1/namespaces/ns/volumes/data/resize")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(format!(r#"{{"size":"{}"}}"#, size)))
            .unwrap()
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (Error::CapacityParse("x".into()), StatusCode::BAD_REQUEST),
            (
                Error::ResourceNotFound {
                    kind: "PersistentVolumeClaim".into(),
                    name: "ns/data".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                Error::MigrationInProgress {
                    volume_name: "ns/data".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                Error::timeout("PVC x to be bound", Duration::from_secs(60)),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                Error::WorkerFailed {
                    worker: "data transfer pod p".into(),
                    logs: "boom".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiErrorResponse::status_of(&err), status, "{}", err);
        }
    }

    #[tokio::test]
    async fn test_list_volumes() {
        let (_, app) = router();
        let response = app
            .oneshot(
                Request::get("/v1/volumes?namespace=ns")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body[0]["name"], "data");
        assert_eq!(body[0]["storageClass"], "standard");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_volume() {
        let (cluster, app) = router();
        let response = app.oneshot(resize_request("10Gi")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["phase"], "Done");
        assert_eq!(body["size"], "10Gi");
        assert_eq!(cluster.claim_used_bytes("ns", "data"), Some(3 << 30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrink_below_usage_is_conflict() {
        let (cluster, app) = router();
        let response = app.oneshot(resize_request("1Gi")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let body = body_json(response).await;
        assert_eq!(body["error"], "precondition");
        assert!(body["message"]
            .as_str()
            .unwrap()
            .contains("cannot shrink volume"));
        assert!(cluster.pod("ns", "web-0").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_survives_client_disconnect() {
        let (cluster, app) = router();
        let request = tokio::spawn(app.oneshot(resize_request("10Gi")));

        // disconnect once the source claim is gone
        let source_deleted = |c: &ClusterCall| {
            matches!(c, ClusterCall::DeleteClaim { name, .. } if name == "data")
        };
        while cluster.journal_position(source_deleted).is_none() {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        request.abort();

        for _ in 0..120 {
            if cluster.claim("ns", "data-new").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert!(cluster.claim("ns", "data-new").is_none());
        let claim = cluster.claim("ns", "data").unwrap();
        assert_eq!(requested_storage(&claim), Some("10Gi"));
        assert_eq!(cluster.claim_used_bytes("ns", "data"), Some(3 << 30));
    }

    #[tokio::test]
    async fn test_malformed_size_is_bad_request() {
        let (_, app) = router();
        let response = app.oneshot(resize_request("ten gigs")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_volume() {
        let (cluster, app) = router();
        let response = app
            .oneshot(
                Request::delete("/v1/namespaces/ns/volumes/data")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["alreadyAbsent"], false);
        assert_eq!(body["deletedPods"][0], "web-0");
        assert!(cluster.claim("ns", "data").is_none());
    }

    #[tokio::test]
    async fn test_metrics_and_health() {
        let (_, app) = router();
        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&text).contains("volume_migrator_operations_in_flight"));
    }
}

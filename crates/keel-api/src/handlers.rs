//! REST API handlers.
//!
//! Reads are served from the scheduler's latest snapshot; writes go through
//! the reconciliation loop and return once it has applied them.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use keel_scheduler::SchedulerError;
use keel_state::{DesiredSpec, ResourceRequirements};

use crate::ApiState;
use crate::prometheus::render_prometheus;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn scheduler_error(e: &SchedulerError) -> axum::response::Response {
    let status = match e {
        SchedulerError::InvalidSpec(_) => StatusCode::BAD_REQUEST,
        SchedulerError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status).into_response()
}

// ── Slots ──────────────────────────────────────────────────────

/// GET /api/v1/slots
pub async fn list_slots(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.scheduler.snapshot().slots)
}

// ── Desired spec ───────────────────────────────────────────────

/// GET /api/v1/desired
pub async fn get_desired(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.scheduler.snapshot().desired)
}

/// Body of `PUT /api/v1/desired`. Omitted resources keep their current value.
#[derive(Debug, Deserialize)]
pub struct DesiredRequest {
    pub count: u32,
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
}

/// PUT /api/v1/desired
pub async fn put_desired(
    State(state): State<ApiState>,
    Json(req): Json<DesiredRequest>,
) -> impl IntoResponse {
    let current = state.scheduler.snapshot().desired;
    let spec = DesiredSpec {
        count: req.count,
        resources: req.resources.unwrap_or(current.resources),
        updated_at: current.updated_at,
    };

    match state.scheduler.reconfigure(spec).await {
        Ok(()) => {
            info!(count = req.count, "desired spec replaced via API");
            ApiResponse::ok(state.scheduler.snapshot().desired).into_response()
        }
        Err(e) => {
            warn!(error = %e, "desired spec rejected");
            scheduler_error(&e)
        }
    }
}

// ── Reconciliation ─────────────────────────────────────────────

/// POST /api/v1/reconcile
pub async fn reconcile(State(state): State<ApiState>) -> impl IntoResponse {
    match state.scheduler.reconcile_now() {
        Ok(()) => {
            (StatusCode::ACCEPTED, ApiResponse::ok("reconciliation requested")).into_response()
        }
        Err(e) => scheduler_error(&e),
    }
}

// ── Liveness ───────────────────────────────────────────────────

#[derive(Serialize)]
struct Liveness {
    running: bool,
    connected: bool,
    store_healthy: bool,
}

/// GET /healthz
pub async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot = state.scheduler.snapshot();
    let body = Liveness {
        running: state.scheduler.is_running(),
        connected: snapshot.connected,
        store_healthy: snapshot.store_healthy,
    };
    let status = if body.running && body.store_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, ApiResponse::ok(body)).into_response()
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let body = render_prometheus(&state.scheduler.snapshot());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use keel_core::KeelConfig;
    use keel_health::{BoxFuture, ProbeResult, ProbeTarget, Prober};
    use keel_scheduler::{LaunchRequest, ResourceManager, SchedulerHandle};
    use keel_state::{StateStore, TaskId};

    struct NullRm;

    impl ResourceManager for NullRm {
        fn launch(&self, _request: LaunchRequest) {}
        fn kill(&self, _task_id: &TaskId) {}
        fn decline(&self, _offer_id: &str) {}
        fn reconcile(&self, _sweep: u64, _known: Vec<TaskId>) {}
        fn revive(&self) {}
    }

    struct AlwaysHealthy;

    impl Prober for AlwaysHealthy {
        fn probe(&self, _target: &ProbeTarget) -> BoxFuture<ProbeResult> {
            Box::pin(async { ProbeResult::Healthy })
        }
    }

    async fn test_state() -> ApiState {
        let settings = KeelConfig::from_toml_str(
            r#"
[executors]
desired_count = 2
"#,
        )
        .unwrap()
        .resolve()
        .unwrap();
        let scheduler = SchedulerHandle::start(
            &settings,
            StateStore::open_in_memory().unwrap(),
            Arc::new(AlwaysHealthy),
            false,
            |_events| Arc::new(NullRm) as Arc<dyn ResourceManager>,
        )
        .await
        .unwrap();
        ApiState { scheduler }
    }

    #[tokio::test]
    async fn list_slots_returns_ok() {
        let state = test_state().await;
        let resp = list_slots(State(state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.scheduler.snapshot().slots.len(), 2);
        state.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn put_desired_applies_count() {
        let state = test_state().await;
        let req = DesiredRequest {
            count: 4,
            resources: None,
        };
        let resp = put_desired(State(state.clone()), Json(req)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let snapshot = state.scheduler.snapshot();
        assert_eq!(snapshot.desired.count, 4);
        assert_eq!(snapshot.slots.len(), 4);
        state.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn put_desired_rejects_invalid_resources() {
        let state = test_state().await;
        let req = DesiredRequest {
            count: 1,
            resources: Some(ResourceRequirements {
                cpus: 0.0,
                mem_mb: 256,
                ports: Vec::new(),
                strict_ports: false,
            }),
        };
        let resp = put_desired(State(state.clone()), Json(req)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.scheduler.snapshot().desired.count, 2);
        state.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn reconcile_is_accepted() {
        let state = test_state().await;
        let resp = reconcile(State(state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        state.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn healthz_reflects_loop_state() {
        let state = test_state().await;
        let resp = healthz(State(state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        state.scheduler.shutdown().await;
        let resp = healthz(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn prometheus_endpoint_returns_text() {
        let state = test_state().await;
        let resp = prometheus_metrics(State(state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.contains("text/plain"));
        state.scheduler.shutdown().await;
    }
}

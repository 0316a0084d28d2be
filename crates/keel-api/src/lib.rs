//! keel-api — REST API for the Keel scheduler.
//!
//! Every handler goes through a [`SchedulerHandle`]: reads come from the
//! latest published snapshot, writes are sent into the reconciliation loop.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/slots` | Executor slots |
//! | GET | `/api/v1/desired` | Current desired spec |
//! | PUT | `/api/v1/desired` | Replace the desired spec |
//! | POST | `/api/v1/reconcile` | Start a reconciliation sweep |
//! | GET | `/healthz` | Scheduler liveness |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;
pub mod prometheus;

use axum::Router;
use axum::routing::{get, post};
use keel_scheduler::SchedulerHandle;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: SchedulerHandle,
}

/// Build the complete API router.
pub fn build_router(scheduler: SchedulerHandle) -> Router {
    let state = ApiState { scheduler };

    let api_routes = Router::new()
        .route("/slots", get(handlers::list_slots))
        .route(
            "/desired",
            get(handlers::get_desired).put(handlers::put_desired),
        )
        .route("/reconcile", post(handlers::reconcile));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::prometheus_metrics))
        .with_state(state)
}

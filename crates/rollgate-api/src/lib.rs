//! rollgate-api — REST API for Rollgate.
//!
//! Provides axum route handlers for starting, inspecting and overriding
//! rollouts, for ingesting request telemetry into the cohort recorder,
//! and for Prometheus exposition.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Liveness |
//! | GET | `/api/v1/rollouts` | List all rollouts |
//! | POST | `/api/v1/rollouts` | Start a rollout (body: rollout spec) |
//! | GET | `/api/v1/rollouts/{id}` | Get rollout status |
//! | POST | `/api/v1/rollouts/{id}/abort` | Abort and roll back |
//! | POST | `/api/v1/rollouts/{id}/promote` | Operator promote to 100% |
//! | POST | `/api/v1/rollouts/{id}/retry` | Retry a rolled-back rollout |
//! | GET | `/api/v1/workloads` | List workload records |
//! | GET | `/api/v1/alerts` | Recent alerts |
//! | POST | `/api/v1/telemetry` | Ingest request observations |
//! | POST | `/api/v1/route/{workload}` | Pick the cohort and backend for one request |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;
pub mod rollout_handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use rollgate_metrics::CohortRecorder;
use rollgate_rollout::{MemoryAlertSink, RolloutController};
use rollgate_traffic::WeightedRouter;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<RolloutController>,
    pub recorder: CohortRecorder,
    pub alerts: MemoryAlertSink,
    /// The router the controller's splitters write weights into.
    pub router: WeightedRouter,
}

/// Build the complete API router (REST + health + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route(
            "/rollouts",
            get(rollout_handlers::list_rollouts).post(rollout_handlers::start_rollout),
        )
        .route("/rollouts/{id}", get(rollout_handlers::get_rollout))
        .route("/rollouts/{id}/abort", post(rollout_handlers::abort_rollout))
        .route("/rollouts/{id}/promote", post(rollout_handlers::promote_rollout))
        .route("/rollouts/{id}/retry", post(rollout_handlers::retry_rollout))
        .route("/workloads", get(handlers::list_workloads))
        .route("/alerts", get(handlers::list_alerts))
        .route("/telemetry", post(handlers::ingest_telemetry))
        .route("/route/{workload}", post(handlers::route_request))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz).with_state(state.clone()))
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use rollgate_analysis::{AnalysisEngine, EngineConfig};
    use rollgate_metrics::CohortRecorder;
    use rollgate_rollout::{MachineSettings, MemoryAlertSink, RolloutController};
    use rollgate_state::StateStore;
    use rollgate_traffic::WeightedRouter;

    use super::{ApiState, build_router};

    /// API state over an in-memory store, driven by the cohort recorder.
    pub fn api_state() -> ApiState {
        let recorder = CohortRecorder::default();
        let alerts = MemoryAlertSink::default();
        let router = WeightedRouter::new();
        let controller = RolloutController::new(
            StateStore::open_in_memory().unwrap(),
            AnalysisEngine::new(Arc::new(recorder.clone()), EngineConfig::default()),
            Arc::new(router.clone()),
            Arc::new(alerts.clone()),
            MachineSettings::default(),
        );
        ApiState {
            controller: Arc::new(controller),
            recorder,
            alerts,
            router,
        }
    }

    pub fn spec_json(workload: &str) -> serde_json::Value {
        serde_json::json!({
            "workload": workload,
            "stable_version": "1.0.0",
            "canary_version": "1.1.0",
            "steps": [
                {"weight": 5, "pause": "30s"},
                {"weight": 10, "pause": "30s"},
                {"weight": 25, "pause": "30s"},
                {"weight": 50, "pause": "30s"},
                {"weight": 75, "pause": "30s"},
                {"weight": 100, "pause": "30s"}
            ],
            "checks": [{
                "name": "success-rate",
                "metric": "success_rate",
                "comparator": ">=",
                "threshold": 99.0,
                "interval": "10s"
            }]
        })
    }

    /// Send a request and decode the JSON envelope.
    pub async fn call(
        state: &ApiState,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = build_router(state.clone())
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }
}

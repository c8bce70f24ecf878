//! REST API handlers for workloads, alerts, telemetry, request routing
//! and exposition.
//!
//! Every JSON endpoint answers with the `{success, data, error}` envelope.

use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use tracing::debug;

use rollgate_core::Cohort;
use rollgate_metrics::cohort_labels;
use rollgate_rollout::ControllerError;
use rollgate_state::WorkloadRecord;

use crate::ApiState;

/// Window used for the cohort series on `/metrics`.
const EXPOSITION_WINDOW: Duration = Duration::from_secs(60);

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// Map a controller error onto its HTTP status.
pub(crate) fn controller_error(e: &ControllerError) -> Response {
    let status = match e {
        ControllerError::Validation(_) => StatusCode::BAD_REQUEST,
        ControllerError::NotFound(_) => StatusCode::NOT_FOUND,
        ControllerError::AlreadyActive { .. } | ControllerError::OverrideConflict(_) => {
            StatusCode::CONFLICT
        }
        ControllerError::Store(_) | ControllerError::Traffic(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(&e.to_string(), status)
}

/// Decode a JSON body. An empty body yields `T::default()`.
pub(crate) fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        error_response(&format!("invalid request body: {e}"), StatusCode::BAD_REQUEST)
    })
}

// ── Health ─────────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    match state.controller.list().await {
        Ok(rollouts) => {
            let active = rollouts.iter().filter(|r| !r.is_terminal()).count();
            ApiResponse::ok(serde_json::json!({
                "status": "ok",
                "active_rollouts": active,
            }))
            .into_response()
        }
        Err(e) => controller_error(&e),
    }
}

// ── Workloads ──────────────────────────────────────────────────

/// GET /api/v1/workloads
pub async fn list_workloads(State(state): State<ApiState>) -> impl IntoResponse {
    match state.controller.workloads() {
        Ok(workloads) => ApiResponse::ok(workloads).into_response(),
        Err(e) => controller_error(&e),
    }
}

// ── Alerts ─────────────────────────────────────────────────────

#[derive(Debug, Default, serde::Deserialize)]
pub struct AlertsQuery {
    pub rollout: Option<String>,
}

/// GET /api/v1/alerts
pub async fn list_alerts(
    State(state): State<ApiState>,
    Query(query): Query<AlertsQuery>,
) -> impl IntoResponse {
    let alerts = match query.rollout {
        Some(id) => state.alerts.for_rollout(&id),
        None => state.alerts.recent(),
    };
    ApiResponse::ok(alerts).into_response()
}

// ── Telemetry ──────────────────────────────────────────────────

/// One observed request.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Observation {
    pub latency_ms: f64,
    pub success: bool,
}

/// Observations for one version of a workload.
#[derive(Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct TelemetryBatch {
    pub workload: String,
    pub version: String,
    #[serde(default)]
    pub observations: Vec<Observation>,
}

/// POST /api/v1/telemetry
///
/// Observations are attributed to the workload's active rollout; the
/// version selects the stable or canary cohort.
pub async fn ingest_telemetry(State(state): State<ApiState>, body: Bytes) -> Response {
    let batch: TelemetryBatch = match parse_body(&body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    if batch.workload.is_empty() {
        return error_response("workload is required", StatusCode::BAD_REQUEST);
    }

    let record = match state.controller.store().get_workload(&batch.workload) {
        Ok(record) => record,
        Err(e) => return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    };
    let Some(rollout_id) = record.and_then(|r| r.active_rollout) else {
        return error_response(
            &format!("no active rollout for workload {}", batch.workload),
            StatusCode::NOT_FOUND,
        );
    };
    let rollout = match state.controller.status(&rollout_id).await {
        Ok(r) => r,
        Err(e) => return controller_error(&e),
    };

    let cohort = if batch.version == rollout.spec.canary_version {
        Cohort::Canary
    } else if batch.version == rollout.spec.stable_version {
        Cohort::Stable
    } else {
        return error_response(
            &format!(
                "version {} is neither stable ({}) nor canary ({})",
                batch.version, rollout.spec.stable_version, rollout.spec.canary_version
            ),
            StatusCode::BAD_REQUEST,
        );
    };

    let labels = cohort_labels(&rollout.id, &rollout.workload, cohort, &batch.version);
    for obs in &batch.observations {
        state.recorder.record(&labels, obs.latency_ms, obs.success).await;
    }
    debug!(
        rollout = %rollout.id,
        workload = %rollout.workload,
        cohort = %cohort,
        count = batch.observations.len(),
        "telemetry ingested"
    );

    ApiResponse::ok(serde_json::json!({
        "rollout_id": rollout.id,
        "cohort": cohort,
        "accepted": batch.observations.len(),
    }))
    .into_response()
}

// ── Routing ────────────────────────────────────────────────────

/// POST /api/v1/route/{workload}
///
/// Routes one request: the workload's canary weight is read once and a
/// cohort and backend are picked. The reported version is the one that
/// cohort runs.
pub async fn route_request(
    State(state): State<ApiState>,
    Path(workload): Path<String>,
) -> Response {
    if state.router.weight(&workload).is_none() {
        return error_response(
            &format!("unknown workload {workload}"),
            StatusCode::NOT_FOUND,
        );
    }
    let Some(decision) = state.router.route(&workload) else {
        return error_response(
            &format!("no healthy backend for workload {workload}"),
            StatusCode::SERVICE_UNAVAILABLE,
        );
    };

    let record = match state.controller.store().get_workload(&workload) {
        Ok(record) => record,
        Err(e) => return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    };
    let (rollout_id, version) = match record {
        Some(WorkloadRecord {
            active_rollout: Some(id),
            ..
        }) => match state.controller.status(&id).await {
            Ok(rollout) => {
                let version = match decision.cohort {
                    Cohort::Canary => rollout.spec.canary_version,
                    Cohort::Stable => rollout.spec.stable_version,
                };
                (Some(rollout.id), Some(version))
            }
            Err(e) => return controller_error(&e),
        },
        // Without a rollout both pools run the workload's stable version.
        Some(record) => (None, Some(record.stable_version)),
        None => (None, None),
    };

    ApiResponse::ok(serde_json::json!({
        "workload": workload,
        "cohort": decision.cohort,
        "backend": decision.backend.endpoint(),
        "version": version,
        "rollout_id": rollout_id,
    }))
    .into_response()
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let rollouts = state.controller.list().await.unwrap_or_default();
    let cohorts = state.recorder.snapshots(EXPOSITION_WINDOW).await;

    let body = rollgate_metrics::render_prometheus(&cohorts, &rollouts);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

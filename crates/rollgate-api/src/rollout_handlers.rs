//! REST API handlers for rollout management.
//!
//! Provides endpoints to start, list, get, abort, promote and retry
//! rollouts. Overrides are forwarded to the rollout's state machine and
//! answered with the rollout's status once the machine has accepted them.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::info;

use rollgate_core::RolloutSpec;

use crate::ApiState;
use crate::handlers::{ApiResponse, controller_error, error_response, parse_body};

/// Request body to abort a rollout.
#[derive(Debug, Default, serde::Deserialize)]
pub struct AbortRequest {
    pub reason: Option<String>,
}

/// Request body to retry a rollout.
#[derive(Debug, Default, serde::Deserialize)]
pub struct RetryRequest {
    pub canary_version: Option<String>,
}

/// GET /api/v1/rollouts
pub async fn list_rollouts(State(state): State<ApiState>) -> impl IntoResponse {
    match state.controller.list().await {
        Ok(rollouts) => ApiResponse::ok(rollouts).into_response(),
        Err(e) => controller_error(&e),
    }
}

/// POST /api/v1/rollouts
pub async fn start_rollout(State(state): State<ApiState>, body: Bytes) -> Response {
    let spec: RolloutSpec = match serde_json::from_slice(&body) {
        Ok(spec) => spec,
        Err(e) => {
            return error_response(
                &format!("invalid rollout spec: {e}"),
                StatusCode::BAD_REQUEST,
            );
        }
    };

    let id = match state.controller.start(spec).await {
        Ok(id) => id,
        Err(e) => return controller_error(&e),
    };
    info!(rollout = %id, "rollout started via API");

    match state.controller.status(&id).await {
        Ok(status) => (StatusCode::CREATED, ApiResponse::ok(status)).into_response(),
        Err(e) => controller_error(&e),
    }
}

/// GET /api/v1/rollouts/{id}
pub async fn get_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.controller.status(&id).await {
        Ok(status) => ApiResponse::ok(status).into_response(),
        Err(e) => controller_error(&e),
    }
}

/// POST /api/v1/rollouts/{id}/abort
pub async fn abort_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let req: AbortRequest = match parse_body(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let reason = req
        .reason
        .unwrap_or_else(|| "aborted by operator".to_string());

    if let Err(e) = state.controller.abort(&id, &reason).await {
        return controller_error(&e);
    }
    status_response(&state, &id).await
}

/// POST /api/v1/rollouts/{id}/promote
pub async fn promote_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Response {
    if let Err(e) = state.controller.promote(&id).await {
        return controller_error(&e);
    }
    status_response(&state, &id).await
}

/// POST /api/v1/rollouts/{id}/retry
pub async fn retry_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let req: RetryRequest = match parse_body(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };

    match state
        .controller
        .retry(&id, req.canary_version.as_deref())
        .await
    {
        Ok(status) => {
            // Telemetry from the previous attempt must not leak into the new one.
            state.recorder.forget_rollout(&id).await;
            ApiResponse::ok(status).into_response()
        }
        Err(e) => controller_error(&e),
    }
}

async fn status_response(state: &ApiState, id: &str) -> Response {
    match state.controller.status(id).await {
        Ok(status) => ApiResponse::ok(status).into_response(),
        Err(e) => controller_error(&e),
    }
}

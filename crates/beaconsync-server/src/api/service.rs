//! Start and stop endpoints.
//!
//! Starting takes an optional partial configuration. Fields it carries are
//! laid over the stored configuration; the result must be complete and valid
//! or the start is refused and nothing is persisted.

use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use beaconsync_core::{ConfigPatch, CycleState};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult, ErrorResponse};
use crate::state::SharedState;

/// Creates the service router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/start", post(start_service))
        .route("/stop", post(stop_service))
}

/// Result of a start or stop command.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceActionResponse {
    /// Whether the command was applied.
    pub success: bool,

    /// Cycle record right after the command.
    pub state: CycleState,
}

fn parse_patch(body: &Bytes) -> ApiResult<ConfigPatch> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ConfigPatch::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request("invalid_body", format!("Invalid JSON body: {e}")))
}

/// Start relaying.
#[utoipa::path(
    post,
    path = "/api/service/start",
    tag = "relay",
    operation_id = "startService",
    summary = "Start relaying",
    description = "Persists the configuration and starts the scan/relay cycle; the \
        first scan begins immediately. The body is optional: any field it \
        carries overrides the stored value.",
    request_body(content = ConfigPatch, description = "Configuration overrides; may be omitted"),
    responses(
        (status = 200, description = "Relaying started", body = ServiceActionResponse),
        (status = 400, description = "Malformed body", body = ErrorResponse),
        (status = 409, description = "Already running", body = ErrorResponse),
        (status = 422, description = "Configuration incomplete or invalid", body = ErrorResponse)
    )
)]
pub async fn start_service(
    State(state): State<SharedState>,
    body: Bytes,
) -> ApiResult<Json<ServiceActionResponse>> {
    let patch = parse_patch(&body)?;
    let config = state.config().snapshot().merged_with(&patch);
    config.validate()?;

    state.scheduler().start(config).await?;
    info!("Relay started via API");

    Ok(Json(ServiceActionResponse {
        success: true,
        state: state.cycle_state().current(),
    }))
}

/// Stop relaying.
#[utoipa::path(
    post,
    path = "/api/service/stop",
    tag = "relay",
    operation_id = "stopService",
    summary = "Stop relaying",
    description = "Cancels the pending wake and any scan in progress, releases the \
        wake lease and resets the persisted record. Stopping a stopped relay \
        succeeds and changes nothing.",
    responses(
        (status = 200, description = "Relaying stopped", body = ServiceActionResponse),
        (status = 503, description = "Scheduler has shut down", body = ErrorResponse)
    )
)]
pub async fn stop_service(
    State(state): State<SharedState>,
) -> ApiResult<Json<ServiceActionResponse>> {
    state.scheduler().stop().await?;
    info!("Relay stopped via API");

    Ok(Json(ServiceActionResponse {
        success: true,
        state: state.cycle_state().current(),
    }))
}

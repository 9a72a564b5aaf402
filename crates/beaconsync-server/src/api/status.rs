//! Relay status endpoint.

use axum::extract::State;
use axum::Json;
use beaconsync_core::{CycleState, SchedulerSnapshot};
use serde::Serialize;
use utoipa::ToSchema;

use crate::api::error::{ApiResult, ErrorResponse};
use crate::state::SharedState;

/// Persisted cycle record plus the live scheduler view.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StatusResponse {
    /// Cycle record as last committed.
    pub state: CycleState,

    /// Scheduler internals.
    pub scheduler: SchedulerSnapshot,

    /// Seconds the daemon has been up.
    #[schema(example = 3600)]
    pub uptime_secs: u64,
}

/// Get relay status.
#[utoipa::path(
    get,
    path = "/api/status",
    tag = "relay",
    operation_id = "getStatus",
    summary = "Get relay status",
    description = "Returns the persisted cycle record (status, last outcome and \
        its argument, next wake time) together with the scheduler's phase, \
        generation and whether the wake lease, timer, scan or send are live.",
    responses(
        (status = 200, description = "Current status", body = StatusResponse),
        (status = 503, description = "Scheduler has shut down", body = ErrorResponse)
    )
)]
pub async fn get_status(State(state): State<SharedState>) -> ApiResult<Json<StatusResponse>> {
    let scheduler = state.scheduler().snapshot().await?;
    Ok(Json(StatusResponse {
        state: state.cycle_state().current(),
        scheduler,
        uptime_secs: state.uptime_secs(),
    }))
}

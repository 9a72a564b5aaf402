//! OpenAPI specification for the beaconsync control API.

use axum::Json;
use beaconsync_core::{
    ConfigPatch, CycleState, HealthResponse, OutcomeKind, Phase, SchedulerSnapshot, ServiceStatus,
};
use utoipa::OpenApi;

use super::config::ConfigResponse;
use super::error::ErrorResponse;
use super::service::ServiceActionResponse;
use super::status::StatusResponse;

/// Serve the OpenAPI specification as JSON at `/api/openapi.json`.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// The OpenAPI document as pretty JSON, for the gen-openapi binary.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// OpenAPI document for beaconsync.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "beaconsync API",
        version = "0.1.0",
        description = r#"
# beaconsync API

Local control API for the beaconsync relay daemon.

On a fixed cadence the daemon wakes, scans for one configured BLE beacon,
POSTs the advertisement bytes it captured to a remote endpoint, records the
outcome and sleeps until the next cycle.

## Lifecycle

1. **Configure** the beacon address, endpoint and application credentials
   with `PUT /api/config`, or pass them to `POST /api/service/start`.
2. **Start** relaying. The first cycle begins immediately.
3. **Watch** progress with `GET /api/status` or the `GET /api/events` stream.
4. **Stop** relaying. Stopping is idempotent.

## Outcomes

`last_outcome` is one of `none`, `success`, `server_error`, `network_error`,
`radio_disabled`, `scan_timeout`, `scan_failed` or `empty_payload`.
`last_outcome_arg` carries the HTTP status, error message or radio error
code where there is one.
"#
    ),
    tags(
        (name = "system", description = "Health checks"),
        (name = "relay", description = "Starting, stopping and observing the relay"),
        (name = "config", description = "Beacon address, endpoint and credentials")
    ),
    paths(
        super::health::health_check,
        super::status::get_status,
        super::service::start_service,
        super::service::stop_service,
        super::config::get_config,
        super::config::update_config,
        super::events::stream_events,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            StatusResponse,
            ServiceActionResponse,
            ConfigResponse,
            ConfigPatch,
            CycleState,
            ServiceStatus,
            OutcomeKind,
            SchedulerSnapshot,
            Phase,
        )
    )
)]
pub struct ApiDoc;

//! Relay configuration endpoints.
//!
//! The application key is write-only: reads report whether one is set.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use beaconsync_core::{ConfigPatch, RelayConfig};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::{ApiResult, ErrorResponse};
use crate::state::SharedState;

/// Creates the config router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(get_config).put(update_config))
}

/// Relay configuration with the secret withheld.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "target_address": "AA:BB:CC:DD:EE:FF",
    "api_url": "https://api.example.com/1.1/classes/Beacon",
    "app_id": "my-app-id",
    "app_key_set": true,
    "complete": true
}))]
pub struct ConfigResponse {
    /// Bluetooth address of the beacon.
    pub target_address: String,

    /// Relay endpoint.
    pub api_url: String,

    /// Application id.
    pub app_id: String,

    /// Whether an application key is stored.
    pub app_key_set: bool,

    /// Whether the configuration is complete enough to start.
    pub complete: bool,
}

impl From<&RelayConfig> for ConfigResponse {
    fn from(config: &RelayConfig) -> Self {
        Self {
            target_address: config.target_address.clone(),
            api_url: config.api_url.clone(),
            app_id: config.app_id.clone(),
            app_key_set: !config.app_key.is_empty(),
            complete: config.is_complete(),
        }
    }
}

/// Get relay configuration.
#[utoipa::path(
    get,
    path = "/api/config",
    tag = "config",
    operation_id = "getConfig",
    summary = "Get relay configuration",
    description = "Returns the stored relay configuration. The application key is \
        never returned; `app_key_set` says whether one is stored.",
    responses(
        (status = 200, description = "Current configuration", body = ConfigResponse)
    )
)]
pub async fn get_config(State(state): State<SharedState>) -> Json<ConfigResponse> {
    Json(ConfigResponse::from(&state.config().snapshot()))
}

/// Update relay configuration.
#[utoipa::path(
    put,
    path = "/api/config",
    tag = "config",
    operation_id = "updateConfig",
    summary = "Update relay configuration",
    description = "Overlays the given fields on the stored configuration and \
        persists the result. A running relay picks the change up at its next \
        cycle; a cycle already in progress finishes with the old values.",
    request_body = ConfigPatch,
    responses(
        (status = 200, description = "Configuration updated", body = ConfigResponse),
        (status = 422, description = "Resulting configuration is invalid", body = ErrorResponse)
    )
)]
pub async fn update_config(
    State(state): State<SharedState>,
    Json(patch): Json<ConfigPatch>,
) -> ApiResult<Json<ConfigResponse>> {
    let config = state.config().snapshot().merged_with(&patch);
    state.scheduler().reconfigure(config).await?;
    Ok(Json(ConfigResponse::from(&state.config().snapshot())))
}

//! Shared response types.
//!
//! Most API types live next to the module that owns them (config, state,
//! scheduler); this holds the few that belong to none of them.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status.
    #[schema(example = "ok")]
    pub status: String,

    /// Service version.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// Radio backend in use.
    #[schema(example = "bluez")]
    pub radio: String,
}

//! HTTP API routes and handlers.
//!
//! - `health` - liveness
//! - `status` - cycle record and scheduler view
//! - `service` - start and stop
//! - `config` - relay configuration
//! - `events` - server-sent state changes
//! - `error` - API error types
//! - `openapi` - OpenAPI specification

use axum::routing::get;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod openapi;
pub mod service;
pub mod status;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                - Health check
/// /api
/// ├── /status            - Cycle record and scheduler view
/// ├── /service/start     - Start relaying
/// ├── /service/stop      - Stop relaying
/// ├── /config            - Relay configuration
/// ├── /events            - Server-sent state changes
/// └── /openapi.json      - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .route("/status", get(status::get_status))
                .route("/events", get(events::stream_events))
                .route("/openapi.json", get(openapi::get_openapi_spec))
                .nest("/service", service::router())
                .nest("/config", config::router()),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

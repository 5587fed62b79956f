//! OpenAPI specification generation for the smartswitch API.
//!
//! The document is served at `/api/openapi.json`, browsable under `/api/docs`,
//! and written to disk by the `gen-openapi` binary.

use axum::Json;
use smartswitch_core::{LoopState, NoticePriority, OngoingNotice};
use utoipa::OpenApi;

use super::error::ErrorResponse;
use super::health::HealthResponse;
use super::keepalive::{
    KeepAliveStatusResponse, LoopStatsResponse, StartKeepAliveRequest, StartKeepAliveResponse,
    StartResult, StopKeepAliveResponse,
};

/// Serve the OpenAPI specification as JSON.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as a pretty-printed string.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for smartswitch.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "smartswitch API",
        version = "0.1.0",
        description = r#"
# smartswitch API

smartswitch keeps a BLE smart switch from falling asleep.

## Overview

A background loop connects to the switch every 15 seconds, writes a single
keep-alive byte to its serial characteristic and disconnects again. Each
attempt has a hard 5 second deadline; failures never stop the loop.

This API is the start/stop bridge:

1. **Start**: begin keeping a switch alive by its Bluetooth address
2. **Stop**: end the loop and release the keep-alive lease
3. **Status**: loop state, ongoing notice and attempt counters
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local smartswitch server")
    ),
    tags(
        (
            name = "system",
            description = "Health checks"
        ),
        (
            name = "keepalive",
            description = "Start, stop and inspect the keep-alive loop"
        )
    ),
    paths(
        super::health::health_check,
        super::keepalive::start_keepalive,
        super::keepalive::stop_keepalive,
        super::keepalive::get_keepalive_status,
    ),
    components(
        schemas(
            // Error types
            ErrorResponse,
            // Health types
            HealthResponse,
            // Keep-alive types
            StartKeepAliveRequest,
            StartKeepAliveResponse,
            StartResult,
            StopKeepAliveResponse,
            KeepAliveStatusResponse,
            LoopStatsResponse,
            LoopState,
            OngoingNotice,
            NoticePriority,
        )
    )
)]
pub struct ApiDoc;

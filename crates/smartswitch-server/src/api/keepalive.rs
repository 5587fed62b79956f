//! Keep-alive control API endpoints.
//!
//! The external start/stop bridge: start the loop for an address, stop it,
//! and read back what the host is doing.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use smartswitch_core::{
    HostStatus, LoopState, LoopStats, OngoingNotice, StartDisposition, TargetAddress,
};
use tracing::info;
use utoipa::ToSchema;

use crate::api::error::{ApiResult, ErrorResponse};
use crate::state::SharedState;

/// Creates the keep-alive router with all endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/start", post(start_keepalive))
        .route("/stop", post(stop_keepalive))
        .route("/status", get(get_keepalive_status))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request to start keeping a peripheral alive.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "address": "AA:BB:CC:DD:EE:FF"
}))]
pub struct StartKeepAliveRequest {
    /// Bluetooth MAC address of the switch (XX:XX:XX:XX:XX:XX format).
    #[schema(example = "AA:BB:CC:DD:EE:FF")]
    pub address: String,
}

/// What a start request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StartResult {
    /// A new loop was started.
    Started,
    /// The loop was already running for this address.
    AlreadyRunning,
    /// The loop was running for another address and has been switched.
    Restarted,
}

/// Counters of the current (or most recent) loop.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "attempts": 12,
    "successes": 11,
    "failures": 1,
    "radio_skips": 0,
    "last_outcome": "success",
    "last_outcome_reason": null,
    "last_attempt_at_utc": "2025-01-15T04:30:00Z"
}))]
pub struct LoopStatsResponse {
    /// Attempts that reached a terminal outcome.
    pub attempts: u64,
    /// Successful attempts.
    pub successes: u64,
    /// Failed attempts (timeout, transport error, disconnect).
    pub failures: u64,
    /// Cycles skipped because Bluetooth was off.
    pub radio_skips: u64,
    /// Outcome of the last attempt: success, timeout, transport_error or disconnected.
    #[schema(example = "success")]
    pub last_outcome: Option<String>,
    /// Failure reason of the last attempt, if any.
    pub last_outcome_reason: Option<String>,
    /// When the last attempt finished (RFC 3339).
    pub last_attempt_at_utc: Option<String>,
}

impl From<LoopStats> for LoopStatsResponse {
    fn from(stats: LoopStats) -> Self {
        let last_outcome_reason = stats
            .last_outcome
            .as_ref()
            .and_then(|o| o.reason().map(str::to_string));
        Self {
            attempts: stats.attempts,
            successes: stats.successes,
            failures: stats.failures,
            radio_skips: stats.radio_skips,
            last_outcome: stats.last_outcome.as_ref().map(|o| o.kind().to_string()),
            last_outcome_reason,
            last_attempt_at_utc: stats.last_attempt_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// Current keep-alive status.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "state": "running",
    "address": "AA:BB:CC:DD:EE:FF",
    "started_at_utc": "2025-01-15T04:00:00Z",
    "lease_held": true,
    "notice": {
        "title": "Smart Dorm Active",
        "body": "Keeping connection alive in background...",
        "priority": "max"
    },
    "stats": {
        "attempts": 12,
        "successes": 11,
        "failures": 1,
        "radio_skips": 0,
        "last_outcome": "success",
        "last_outcome_reason": null,
        "last_attempt_at_utc": "2025-01-15T04:30:00Z"
    }
}))]
pub struct KeepAliveStatusResponse {
    /// Loop state.
    pub state: LoopState,
    /// Address being kept alive while running.
    #[schema(example = "AA:BB:CC:DD:EE:FF")]
    pub address: Option<String>,
    /// When the running loop started (RFC 3339).
    pub started_at_utc: Option<String>,
    /// Whether the OS keep-alive lease is held.
    pub lease_held: bool,
    /// Ongoing notice shown while running.
    pub notice: Option<OngoingNotice>,
    /// Loop counters.
    pub stats: LoopStatsResponse,
}

impl From<HostStatus> for KeepAliveStatusResponse {
    fn from(status: HostStatus) -> Self {
        Self {
            state: status.state,
            address: status.address.map(String::from),
            started_at_utc: status.started_at.map(|t| t.to_rfc3339()),
            lease_held: status.lease_held,
            notice: status.notice,
            stats: status.stats.into(),
        }
    }
}

/// Response after a start request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StartKeepAliveResponse {
    /// What the request did.
    pub result: StartResult,
    /// Address of the loop that was replaced, for `restarted`.
    pub previous_address: Option<String>,
    /// Status after the request.
    pub status: KeepAliveStatusResponse,
}

/// Response after a stop request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StopKeepAliveResponse {
    /// Whether a running loop was stopped.
    pub stopped: bool,
    /// Status after the request.
    pub status: KeepAliveStatusResponse,
}

// ============================================================================
// Handlers
// ============================================================================

/// Start the keep-alive loop.
#[utoipa::path(
    post,
    path = "/api/keepalive/start",
    tag = "keepalive",
    operation_id = "startKeepAlive",
    summary = "Start keeping a switch alive",
    description = "Starts the background loop that connects to the switch every cadence \
        interval and writes the keep-alive value. Starting again with the same address is \
        a no-op; a different address replaces the running loop.",
    request_body = StartKeepAliveRequest,
    responses(
        (status = 200, description = "Loop running", body = StartKeepAliveResponse),
        (status = 400, description = "Invalid Bluetooth address format", body = ErrorResponse),
        (status = 503, description = "Keep-alive lease unavailable", body = ErrorResponse)
    )
)]
pub async fn start_keepalive(
    State(state): State<SharedState>,
    Json(request): Json<StartKeepAliveRequest>,
) -> ApiResult<Json<StartKeepAliveResponse>> {
    let address = TargetAddress::parse(&request.address)?;
    info!(address = %address, "Start requested");

    let disposition = state.host.start(address).await?;
    let (result, previous_address) = match disposition {
        StartDisposition::Started => (StartResult::Started, None),
        StartDisposition::AlreadyRunning => (StartResult::AlreadyRunning, None),
        StartDisposition::Restarted { previous } => {
            (StartResult::Restarted, Some(previous.to_string()))
        }
    };

    Ok(Json(StartKeepAliveResponse {
        result,
        previous_address,
        status: state.host.status().await.into(),
    }))
}

/// Stop the keep-alive loop.
#[utoipa::path(
    post,
    path = "/api/keepalive/stop",
    tag = "keepalive",
    operation_id = "stopKeepAlive",
    summary = "Stop the keep-alive loop",
    description = "Stops the loop, force-closes any in-flight connection and releases the \
        keep-alive lease. Stopping when nothing is running is a no-op.",
    responses(
        (status = 200, description = "Loop stopped", body = StopKeepAliveResponse)
    )
)]
pub async fn stop_keepalive(State(state): State<SharedState>) -> Json<StopKeepAliveResponse> {
    info!("Stop requested");
    let stopped = state.host.stop().await;

    Json(StopKeepAliveResponse {
        stopped,
        status: state.host.status().await.into(),
    })
}

/// Get keep-alive status.
#[utoipa::path(
    get,
    path = "/api/keepalive/status",
    tag = "keepalive",
    operation_id = "getKeepAliveStatus",
    summary = "Get keep-alive status",
    description = "Returns the loop state, target address, ongoing notice and attempt counters.",
    responses(
        (status = 200, description = "Status retrieved", body = KeepAliveStatusResponse)
    )
)]
pub async fn get_keepalive_status(State(state): State<SharedState>) -> Json<KeepAliveStatusResponse> {
    Json(state.host.status().await.into())
}

#[cfg(test)]
mod tests {
    use smartswitch_core::AttemptOutcome;

    use super::*;

    #[test]
    fn test_stats_response_from_stats() {
        let stats = LoopStats {
            attempts: 3,
            successes: 2,
            failures: 1,
            radio_skips: 4,
            last_outcome: Some(AttemptOutcome::Disconnected("unexpected".into())),
            last_attempt_at: None,
        };
        let response = LoopStatsResponse::from(stats);
        assert_eq!(response.last_outcome.as_deref(), Some("disconnected"));
        assert_eq!(response.last_outcome_reason.as_deref(), Some("unexpected"));
        assert_eq!(response.radio_skips, 4);
    }

    #[test]
    fn test_start_result_serialization() {
        let json = serde_json::to_string(&StartResult::AlreadyRunning).unwrap();
        assert_eq!(json, "\"already_running\"");
    }

    #[test]
    fn test_start_request_deserialization() {
        let request: StartKeepAliveRequest =
            serde_json::from_str(r#"{"address":"aa:bb:cc:dd:ee:ff"}"#).unwrap();
        assert_eq!(request.address, "aa:bb:cc:dd:ee:ff");
    }
}

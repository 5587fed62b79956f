//! API error types and response handling.
//!
//! This module provides a unified error type for all API handlers
//! with automatic conversion to appropriate HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use smartswitch_core::SmartSwitchError;
use utoipa::ToSchema;

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Unified API error type.
///
/// Carries the HTTP status chosen by
/// [`SmartSwitchError::http_status_code`] and renders as an [`ErrorResponse`].
#[derive(Debug, Clone)]
pub struct ApiError {
    /// HTTP status of the response.
    pub status: StatusCode,
    /// Machine-readable error code.
    pub error_code: String,
    /// Human-readable error message.
    pub message: String,
}

/// Standard JSON error response body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "invalid_bluetooth_address",
    "message": "Bluetooth address must be in format XX:XX:XX:XX:XX:XX"
}))]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g., "invalid_bluetooth_address").
    #[schema(example = "invalid_bluetooth_address")]
    pub error: String,

    /// Human-readable error message.
    #[schema(example = "Bluetooth address must be in format XX:XX:XX:XX:XX:XX")]
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(
                status = %self.status,
                error_code = %self.error_code,
                message = %self.message,
                "Request failed"
            );
        }

        let body = ErrorResponse {
            error: self.error_code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for ApiError {}

/// Convert from smartswitch_core errors.
impl From<SmartSwitchError> for ApiError {
    fn from(err: SmartSwitchError) -> Self {
        let status = StatusCode::from_u16(err.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = match &err {
            SmartSwitchError::InvalidAddress(_) => {
                "Bluetooth address must be in format XX:XX:XX:XX:XX:XX".to_string()
            }
            _ => err.to_string(),
        };

        Self {
            status,
            error_code: err.error_code().to_ascii_lowercase(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_status() {
        let err = ApiError::from(SmartSwitchError::InvalidAddress("nope".into()));
        assert!(err.to_string().starts_with("400 Bad Request"));
    }

    #[test]
    fn test_invalid_address_maps_to_bad_request() {
        let err = ApiError::from(SmartSwitchError::InvalidAddress("nope".into()));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.error_code, "invalid_bluetooth_address");
    }

    #[test]
    fn test_status_follows_core_mapping() {
        let errors = [
            SmartSwitchError::LeaseUnavailable("spawn failed".into()),
            SmartSwitchError::BluetoothAdapterNotFound,
            SmartSwitchError::ConfigValidationError("timing".into()),
        ];
        for err in errors {
            let expected = err.http_status_code();
            assert_eq!(ApiError::from(err).status.as_u16(), expected);
        }
    }

    #[test]
    fn test_lease_failure_maps_to_service_unavailable() {
        let err = ApiError::from(SmartSwitchError::LeaseUnavailable("spawn failed".into()));
        assert_eq!(err.error_code, "lease_unavailable");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_error_response_serialization() {
        let response = ErrorResponse {
            error: "test_error".to_string(),
            message: "Test message".to_string(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("test_error"));
        assert!(!json.contains("details"));
    }
}

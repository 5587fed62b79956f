//! Unified error types for the smartswitch core library.
//!
//! This module provides a unified error type [`SmartSwitchError`] for everything
//! that can fail *outside* a connection attempt: adapter setup, configuration,
//! keep-alive lease handling and address validation. Each module also has its
//! own specific error type (`TransportError`, `ConfigError`, `LeaseError`) for
//! internal use.
//!
//! Failures *inside* an attempt never surface here. They are folded into an
//! [`AttemptOutcome`](crate::types::AttemptOutcome) by the attempt itself so
//! that the ping loop keeps running.
//!
//! # Example
//!
//! ```rust
//! use smartswitch_core::error::{Result, SmartSwitchError};
//! use std::path::PathBuf;
//!
//! fn load_config(path: &PathBuf) -> Result<()> {
//!     if !path.exists() {
//!         return Err(SmartSwitchError::ConfigNotFound(path.clone()));
//!     }
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// The unified error type for smartswitch operations.
#[derive(Debug, Error)]
pub enum SmartSwitchError {
    // =========================================================================
    // BLUETOOTH ERRORS
    // =========================================================================
    /// No Bluetooth adapter was found on this system.
    #[error(
        "No Bluetooth adapter found. Ensure Bluetooth hardware is present and drivers are loaded."
    )]
    BluetoothAdapterNotFound,

    /// The Bluetooth stack could not be initialised or queried.
    #[error("Bluetooth unavailable: {0}")]
    BluetoothUnavailable(String),

    /// The provided peripheral address is not a valid MAC address.
    #[error("Invalid Bluetooth address: '{0}'. Expected format XX:XX:XX:XX:XX:XX.")]
    InvalidAddress(String),

    // =========================================================================
    // LIFECYCLE ERRORS
    // =========================================================================
    /// The OS keep-alive lease could not be acquired.
    #[error("Failed to acquire keep-alive lease: {0}")]
    LeaseUnavailable(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),
}

/// A specialized [`Result`] type for smartswitch operations.
pub type Result<T> = std::result::Result<T, SmartSwitchError>;

impl SmartSwitchError {
    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - malformed input
            Self::InvalidAddress(_) => 400,

            // 404 Not Found
            Self::ConfigNotFound(_) => 404,

            // 422 Unprocessable Entity - semantic errors
            Self::ConfigParseError(_) | Self::ConfigValidationError(_) => 422,

            // 503 Service Unavailable - Bluetooth hardware or OS lease issues
            Self::BluetoothAdapterNotFound
            | Self::BluetoothUnavailable(_)
            | Self::LeaseUnavailable(_) => 503,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::BluetoothAdapterNotFound => "BLUETOOTH_ADAPTER_NOT_FOUND",
            Self::BluetoothUnavailable(_) => "BLUETOOTH_UNAVAILABLE",
            Self::InvalidAddress(_) => "INVALID_BLUETOOTH_ADDRESS",
            Self::LeaseUnavailable(_) => "LEASE_UNAVAILABLE",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for SmartSwitchError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::Load(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::transport::TransportError> for SmartSwitchError {
    fn from(err: crate::transport::TransportError) -> Self {
        use crate::transport::TransportError;
        match err {
            TransportError::AdapterNotFound => Self::BluetoothAdapterNotFound,
            TransportError::InvalidAddress { address } => Self::InvalidAddress(address),
            TransportError::SessionInitFailed { message }
            | TransportError::ConnectFailed { message } => Self::BluetoothUnavailable(message),
        }
    }
}

impl From<crate::lease::LeaseError> for SmartSwitchError {
    fn from(err: crate::lease::LeaseError) -> Self {
        Self::LeaseUnavailable(err.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_codes() {
        assert_eq!(SmartSwitchError::InvalidAddress("x".into()).http_status_code(), 400);
        assert_eq!(
            SmartSwitchError::ConfigNotFound(PathBuf::new()).http_status_code(),
            404
        );
        assert_eq!(
            SmartSwitchError::ConfigValidationError("e".into()).http_status_code(),
            422
        );
        assert_eq!(
            SmartSwitchError::LeaseUnavailable("e".into()).http_status_code(),
            503
        );
        assert_eq!(
            SmartSwitchError::BluetoothAdapterNotFound.http_status_code(),
            503
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            SmartSwitchError::BluetoothAdapterNotFound.error_code(),
            "BLUETOOTH_ADAPTER_NOT_FOUND"
        );
        assert_eq!(
            SmartSwitchError::InvalidAddress("x".into()).error_code(),
            "INVALID_BLUETOOTH_ADDRESS"
        );
    }

    #[test]
    fn test_from_transport_error() {
        let err: SmartSwitchError = crate::transport::TransportError::AdapterNotFound.into();
        assert!(matches!(err, SmartSwitchError::BluetoothAdapterNotFound));

        let err: SmartSwitchError = crate::transport::TransportError::InvalidAddress {
            address: "zz".into(),
        }
        .into();
        assert!(matches!(err, SmartSwitchError::InvalidAddress(a) if a == "zz"));
    }

    #[test]
    fn test_from_lease_error() {
        let err: SmartSwitchError = crate::lease::LeaseError::Exited {
            program: "systemd-inhibit".into(),
            status: "exit status: 1".into(),
        }
        .into();
        assert!(matches!(err, SmartSwitchError::LeaseUnavailable(ref m) if m.contains("systemd-inhibit")));
        assert_eq!(err.http_status_code(), 503);
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<SmartSwitchError>();
        assert_sync::<SmartSwitchError>();
    }
}

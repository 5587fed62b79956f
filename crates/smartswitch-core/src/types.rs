//! Shared types and OpenAPI schemas.
//!
//! This module contains the small value types that flow between the attempt,
//! the ping loop and the lifecycle host.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::is_valid_mac_address;
use crate::error::{Result, SmartSwitchError};

/// Address of the peripheral being kept alive.
///
/// Normalised to upper case on parse. A running loop holds its own copy, so an
/// address never changes underneath an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetAddress(String);

impl TargetAddress {
    /// Parse and normalise a Bluetooth MAC address (`XX:XX:XX:XX:XX:XX`).
    ///
    /// # Errors
    ///
    /// Returns [`SmartSwitchError::InvalidAddress`] if the input is not a MAC address.
    pub fn parse(raw: &str) -> Result<Self> {
        let normalised = raw.trim().to_uppercase();
        if !is_valid_mac_address(&normalised) {
            return Err(SmartSwitchError::InvalidAddress(raw.to_string()));
        }
        Ok(Self(normalised))
    }

    /// The normalised address string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TargetAddress {
    type Err = SmartSwitchError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TargetAddress {
    type Error = SmartSwitchError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<TargetAddress> for String {
    fn from(address: TargetAddress) -> Self {
        address.0
    }
}

/// Terminal result of one connection attempt.
///
/// Produced exactly once per attempt and only ever logged or observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The keep-alive value was written and acknowledged.
    Success,
    /// The attempt deadline passed before the sequence completed.
    Timeout,
    /// The transport reported a failure (connect, discovery or write).
    TransportError(String),
    /// The peripheral dropped the link before the write completed.
    Disconnected(String),
}

impl AttemptOutcome {
    /// Returns `true` for [`AttemptOutcome::Success`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Short machine-readable label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Timeout => "timeout",
            Self::TransportError(_) => "transport_error",
            Self::Disconnected(_) => "disconnected",
        }
    }

    /// Failure reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Success | Self::Timeout => None,
            Self::TransportError(reason) | Self::Disconnected(reason) => Some(reason),
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{} ({reason})", self.kind()),
            None => f.write_str(self.kind()),
        }
    }
}

/// Lifecycle state of the keep-alive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// No loop has been started in this process.
    #[default]
    NotStarted,
    /// A loop is pinging the target.
    Running,
    /// The loop was stopped; a fresh `start` is required to run again.
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_address_normalises_case() {
        let address = TargetAddress::parse(" aa:bb:cc:dd:ee:ff ").unwrap();
        assert_eq!(address.as_str(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_target_address_rejects_garbage() {
        let err = TargetAddress::parse("not-a-mac").unwrap_err();
        assert!(matches!(err, SmartSwitchError::InvalidAddress(_)));
    }

    #[test]
    fn test_target_address_serde_validates() {
        let ok: TargetAddress = serde_json::from_str("\"11:22:33:44:55:66\"").unwrap();
        assert_eq!(ok.to_string(), "11:22:33:44:55:66");
        assert!(serde_json::from_str::<TargetAddress>("\"11:22\"").is_err());
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(AttemptOutcome::Success.kind(), "success");
        assert!(AttemptOutcome::Success.is_success());
        let outcome = AttemptOutcome::Disconnected("unexpected".into());
        assert_eq!(outcome.reason(), Some("unexpected"));
        assert_eq!(outcome.to_string(), "disconnected (unexpected)");
        assert!(!AttemptOutcome::Timeout.is_success());
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_string(&AttemptOutcome::TransportError("boom".into())).unwrap();
        assert_eq!(json, r#"{"kind":"transport_error","reason":"boom"}"#);
    }

    #[test]
    fn test_loop_state_default() {
        assert_eq!(LoopState::default(), LoopState::NotStarted);
        assert_eq!(LoopState::Running.to_string(), "running");
    }
}

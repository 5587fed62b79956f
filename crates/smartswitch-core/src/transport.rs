//! Transport adapter contract.
//!
//! The platform's BLE stack is modelled the way GATT clients actually behave:
//! every operation is *issued* synchronously and completes later through a
//! [`TransportEvent`] posted to the session's [`EventSink`]. The connection
//! attempt consumes those events as a single ordered stream, which keeps the
//! state machine free of nested callbacks.
//!
//! Backends:
//! - [`bluez`] - BlueZ over D-Bus via `bluer` (feature `bluetooth`)
//! - [`mock`] - scriptable in-process peripheral (feature `mock-bluetooth`, tests)

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::types::TargetAddress;

#[cfg(feature = "bluetooth")]
pub mod bluez;
#[cfg(any(test, feature = "mock-bluetooth", not(feature = "bluetooth")))]
pub mod mock;

/// HM-10 serial service.
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_ffe0_0000_1000_8000_0080_5f9b_34fb);

/// HM-10 serial characteristic, written to activate the switch.
pub const DEFAULT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_ffe1_0000_1000_8000_0080_5f9b_34fb);

/// Errors raised synchronously by a transport backend.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No adapter is present.
    #[error("no Bluetooth adapter found")]
    AdapterNotFound,

    /// The address could not be understood by the backend.
    #[error("invalid Bluetooth address: {address}")]
    InvalidAddress {
        /// The rejected address.
        address: String,
    },

    /// The backend session (D-Bus connection, adapter handle) failed to start.
    #[error("failed to initialise Bluetooth session: {message}")]
    SessionInitFailed {
        /// Backend error text.
        message: String,
    },

    /// The connect request was rejected before any event could be delivered.
    #[error("connect request rejected: {message}")]
    ConnectFailed {
        /// Backend error text.
        message: String,
    },
}

/// GATT status code delivered with completion events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GattStatus(pub u16);

impl GattStatus {
    /// Operation completed successfully.
    pub const SUCCESS: Self = Self(0);
    /// Generic failure.
    pub const FAILURE: Self = Self(0x101);

    /// Returns `true` for [`GattStatus::SUCCESS`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:03x}", self.0)
    }
}

/// Link-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// The link is up.
    Connected,
    /// The link is down (refused, dropped, or closed by us).
    Disconnected,
}

/// A service and the characteristics it exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristic UUIDs under this service.
    pub characteristics: Vec<Uuid>,
}

impl DiscoveredService {
    /// Build a service entry.
    #[must_use]
    pub const fn new(uuid: Uuid, characteristics: Vec<Uuid>) -> Self {
        Self {
            uuid,
            characteristics,
        }
    }
}

/// Returns `true` if `services` contains `characteristic` under `service`.
#[must_use]
pub fn has_characteristic(services: &[DiscoveredService], service: Uuid, characteristic: Uuid) -> bool {
    services
        .iter()
        .filter(|s| s.uuid == service)
        .any(|s| s.characteristics.contains(&characteristic))
}

/// Completion events posted by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connection state changed.
    ConnectionState(LinkState),
    /// Service discovery finished.
    DiscoveryComplete {
        /// Discovery status.
        status: GattStatus,
        /// Discovered service tree (empty on failure).
        services: Vec<DiscoveredService>,
    },
    /// A characteristic write finished.
    WriteComplete {
        /// Write status.
        status: GattStatus,
    },
}

/// Sending half of a session's event stream.
///
/// Cloned into every task a backend spawns for the session. Sends after the
/// attempt has finished are silently dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    /// Post an event. Returns `false` if nobody is listening any more.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Create a connected sink/stream pair for one attempt.
#[must_use]
pub fn event_channel() -> (EventSink, mpsc::UnboundedReceiver<TransportEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, rx)
}

/// Entry point to the platform BLE stack.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the radio is present and powered.
    async fn is_radio_enabled(&self) -> bool;

    /// Begin connecting to `address`.
    ///
    /// Returns immediately; the outcome arrives as a
    /// [`TransportEvent::ConnectionState`] on `events`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not even be issued.
    fn connect(
        &self,
        address: &TargetAddress,
        events: EventSink,
    ) -> Result<Box<dyn Session>, TransportError>;
}

/// One open transport session. Every method only issues the operation.
pub trait Session: Send {
    /// Enumerate services; completes with [`TransportEvent::DiscoveryComplete`].
    fn discover_capabilities(&mut self);

    /// Write `value`; completes with [`TransportEvent::WriteComplete`].
    fn write(&mut self, service: Uuid, characteristic: Uuid, value: &[u8]);

    /// Request link teardown. Idempotent.
    fn disconnect(&mut self);

    /// Release all backend resources. Idempotent; no events follow.
    fn release(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_uuids() {
        assert_eq!(
            DEFAULT_SERVICE_UUID.to_string(),
            "0000ffe0-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            DEFAULT_CHARACTERISTIC_UUID.to_string(),
            "0000ffe1-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_gatt_status() {
        assert!(GattStatus::SUCCESS.is_success());
        assert!(!GattStatus::FAILURE.is_success());
        assert_eq!(GattStatus::FAILURE.to_string(), "0x101");
    }

    #[test]
    fn test_has_characteristic() {
        let services = vec![
            DiscoveredService::new(Uuid::from_u128(1), vec![Uuid::from_u128(2)]),
            DiscoveredService::new(DEFAULT_SERVICE_UUID, vec![DEFAULT_CHARACTERISTIC_UUID]),
        ];
        assert!(has_characteristic(
            &services,
            DEFAULT_SERVICE_UUID,
            DEFAULT_CHARACTERISTIC_UUID
        ));
        // Characteristic present, but under a different service.
        assert!(!has_characteristic(
            &services,
            DEFAULT_SERVICE_UUID,
            Uuid::from_u128(2)
        ));
        assert!(!has_characteristic(&[], DEFAULT_SERVICE_UUID, DEFAULT_CHARACTERISTIC_UUID));
    }

    #[tokio::test]
    async fn test_event_sink_after_receiver_dropped() {
        let (sink, rx) = event_channel();
        assert!(sink.send(TransportEvent::ConnectionState(LinkState::Connected)));
        drop(rx);
        assert!(!sink.send(TransportEvent::ConnectionState(LinkState::Disconnected)));
    }
}

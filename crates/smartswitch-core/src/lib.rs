//! # smartswitch-core
//!
//! Core logic for keeping a BLE smart switch awake.
//!
//! The switch (an HM-10 style peripheral) drops into deep sleep unless it is
//! poked regularly. This crate connects to it on a fixed cadence, writes a
//! single keep-alive byte to its serial characteristic, and disconnects,
//! forever, from a background task.
//!
//! ## Architecture
//!
//! The crate is organized leaf to root:
//!
//! - [`transport`] - Event-driven BLE transport contract, with BlueZ and mock backends
//! - [`attempt`] - One connect/discover/write/disconnect cycle under a hard deadline
//! - [`ping_loop`] - Fixed-cadence repetition of attempts until cancelled
//! - [`host`] - Start/stop lifecycle, keep-alive lease and ongoing notice
//! - [`lease`] - OS keep-alive leases (`systemd-inhibit`, no-op)
//! - [`status`] - Host-visible ongoing notice
//! - [`config`] - Layered configuration loading and validation
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared value types and OpenAPI schemas

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod attempt;
pub mod config;
pub mod error;
pub mod host;
pub mod lease;
pub mod ping_loop;
pub mod status;
pub mod transport;
pub mod types;

// Re-export primary types for convenience
pub use attempt::{run_attempt, AttemptConfig, AttemptError, AttemptReport, AttemptState};
pub use config::{
    is_valid_mac_address, BluetoothConfig, ConfigError, ConfigResult, LeaseConfig, LeaseKind,
    ServerConfig, SmartSwitchConfig, TimingConfig,
};
pub use error::{Result, SmartSwitchError};
pub use host::{HostStatus, KeepAliveHost, StartDisposition};
pub use lease::{CommandLease, KeepAliveLease, LeaseError, NoopLease};
pub use ping_loop::{LoopConfig, LoopStats, PingLoop};
pub use status::{NoticePriority, OngoingNotice, StatusIndicator, TracingIndicator};
#[cfg(feature = "bluetooth")]
pub use transport::bluez::BluezTransport;
#[cfg(any(feature = "mock-bluetooth", not(feature = "bluetooth")))]
pub use transport::mock::{MockScript, MockTransport, Step, TransportCall};
pub use transport::{Session, Transport, TransportError, TransportEvent};
pub use types::{AttemptOutcome, LoopState, TargetAddress};

//! Application configuration management.
//!
//! Configuration is layered with the `config` crate:
//! 1. built-in defaults ([`SmartSwitchConfig::default`])
//! 2. an optional TOML file (`/etc/smartswitch/config.toml` on Linux, the
//!    platform config directory elsewhere, or `$SMARTSWITCH_CONFIG`)
//! 3. `SMARTSWITCH__<SECTION>__<KEY>` environment variables
//!
//! ```toml
//! [bluetooth]
//! target_address = "AA:BB:CC:DD:EE:FF"
//!
//! [timing]
//! cadence_ms = 15000
//! attempt_timeout_ms = 5000
//!
//! [lease]
//! kind = "systemd-inhibit"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::attempt::{
    AttemptConfig, DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_DISCONNECT_GRACE, KEEPALIVE_PAYLOAD,
};
use crate::lease::{CommandLease, KeepAliveLease, NoopLease};
use crate::ping_loop::{LoopConfig, DEFAULT_CADENCE};
use crate::status::OngoingNotice;
use crate::transport::{DEFAULT_CHARACTERISTIC_UUID, DEFAULT_SERVICE_UUID};
use crate::types::TargetAddress;

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "SMARTSWITCH_CONFIG";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "SMARTSWITCH";

static MAC_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").expect("MAC address pattern is valid")
});

/// Returns `true` if `address` looks like `XX:XX:XX:XX:XX:XX`.
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS_RE.is_match(address)
}

// ============================================================================
// Errors
// ============================================================================

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested file does not exist.
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// A source could not be read or deserialized.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// A single field is invalid.
    #[error("invalid {field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields are invalid.
    #[error("{} configuration errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartSwitchConfig {
    /// Adapter and peripheral settings.
    pub bluetooth: BluetoothConfig,
    /// Deadlines and cadence.
    pub timing: TimingConfig,
    /// Ongoing notice shown while running.
    pub notification: OngoingNotice,
    /// OS keep-alive lease.
    pub lease: LeaseConfig,
    /// HTTP control server.
    pub server: ServerConfig,
}

/// Adapter and peripheral settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Adapter name (e.g. `hci0`). Default adapter when unset.
    pub adapter: Option<String>,
    /// Peripheral to start keeping alive as soon as the server is up.
    pub target_address: Option<String>,
    /// Service holding the keep-alive characteristic.
    pub service_uuid: Uuid,
    /// Characteristic written on every attempt.
    pub characteristic_uuid: Uuid,
    /// Value written, as UTF-8 text.
    pub payload: String,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            target_address: None,
            service_uuid: DEFAULT_SERVICE_UUID,
            characteristic_uuid: DEFAULT_CHARACTERISTIC_UUID,
            payload: String::from_utf8_lossy(&KEEPALIVE_PAYLOAD).into_owned(),
        }
    }
}

/// Deadlines and cadence, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait between attempts.
    pub cadence_ms: u64,
    /// Hard deadline for one attempt.
    pub attempt_timeout_ms: u64,
    /// Wait for the disconnect confirmation.
    pub disconnect_grace_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            cadence_ms: millis(DEFAULT_CADENCE),
            attempt_timeout_ms: millis(DEFAULT_ATTEMPT_TIMEOUT),
            disconnect_grace_ms: millis(DEFAULT_DISCONNECT_GRACE),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Which keep-alive lease to hold while running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaseKind {
    /// Track state only.
    #[default]
    None,
    /// Hold a `systemd-inhibit --what=sleep:idle` lock.
    SystemdInhibit,
}

/// Keep-alive lease settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Lease mechanism.
    pub kind: LeaseKind,
    /// Reason reported to the inhibitor.
    pub why: String,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            kind: LeaseKind::None,
            why: "Keeping BLE switch awake".to_string(),
        }
    }
}

impl LeaseConfig {
    /// Build the configured lease.
    #[must_use]
    pub fn build(&self) -> Box<dyn KeepAliveLease> {
        match self.kind {
            LeaseKind::None => Box::new(NoopLease::new()),
            LeaseKind::SystemdInhibit => Box::new(CommandLease::systemd_inhibit(&self.why)),
        }
    }
}

/// HTTP control server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub bind: String,
    /// JSON file logging instead of pretty stdout.
    pub production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
            production: false,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl SmartSwitchConfig {
    /// Load defaults, the config file if present, then environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the result is invalid.
    pub fn load() -> ConfigResult<Self> {
        let path = Self::config_path();
        tracing::debug!(path = %path.display(), exists = path.exists(), "Loading configuration");
        Self::build(Some(File::from(path).format(FileFormat::Toml).required(false)), env_source())
    }

    /// Load defaults, `path` (which must exist), then environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if `path` does not exist, or an error
    /// if it cannot be parsed or the result is invalid.
    pub fn load_from(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Self::build(
            Some(File::from(path).format(FileFormat::Toml).required(true)),
            env_source(),
        )
    }

    fn build(
        file: Option<File<config::FileSourceFile, FileFormat>>,
        env: Environment,
    ) -> ConfigResult<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);
        if let Some(file) = file {
            builder = builder.add_source(file);
        }
        let config: Self = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Location of the config file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
            return PathBuf::from(path);
        }
        // On the target board: /etc/smartswitch/config.toml
        // For development: the platform config directory
        #[cfg(target_os = "linux")]
        {
            PathBuf::from("/etc/smartswitch/config.toml")
        }
        #[cfg(not(target_os = "linux"))]
        {
            directories::ProjectDirs::from("", "", "smartswitch").map_or_else(
                || PathBuf::from("smartswitch.toml"),
                |dirs| dirs.config_dir().join("config.toml"),
            )
        }
    }

    /// Check every field, collecting all problems.
    ///
    /// # Errors
    ///
    /// Returns a single [`ConfigError::ValidationError`] or a
    /// [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if let Some(address) = &self.bluetooth.target_address {
            if !is_valid_mac_address(address.trim()) {
                errors.push(ConfigError::invalid(
                    "bluetooth.target_address",
                    format!("'{address}' is not in XX:XX:XX:XX:XX:XX format"),
                ));
            }
        }
        if self.bluetooth.payload.is_empty() {
            errors.push(ConfigError::invalid("bluetooth.payload", "must not be empty"));
        }

        let timing = &self.timing;
        if timing.cadence_ms == 0 {
            errors.push(ConfigError::invalid("timing.cadence_ms", "must be greater than 0"));
        }
        if timing.attempt_timeout_ms == 0 {
            errors.push(ConfigError::invalid(
                "timing.attempt_timeout_ms",
                "must be greater than 0",
            ));
        } else if timing.attempt_timeout_ms >= timing.cadence_ms && timing.cadence_ms > 0 {
            errors.push(ConfigError::invalid(
                "timing.attempt_timeout_ms",
                "must be shorter than timing.cadence_ms",
            ));
        }
        if timing.disconnect_grace_ms > timing.attempt_timeout_ms {
            errors.push(ConfigError::invalid(
                "timing.disconnect_grace_ms",
                "must not exceed timing.attempt_timeout_ms",
            ));
        }

        if self.notification.title.trim().is_empty() {
            errors.push(ConfigError::invalid("notification.title", "must not be empty"));
        }

        if self.server.bind.parse::<SocketAddr>().is_err() {
            errors.push(ConfigError::invalid(
                "server.bind",
                format!("'{}' is not a socket address", self.server.bind),
            ));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Loop settings derived from the `timing` and `bluetooth` sections.
    #[must_use]
    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            cadence: Duration::from_millis(self.timing.cadence_ms),
            attempt: AttemptConfig {
                timeout: Duration::from_millis(self.timing.attempt_timeout_ms),
                disconnect_grace: Duration::from_millis(self.timing.disconnect_grace_ms),
                service_uuid: self.bluetooth.service_uuid,
                characteristic_uuid: self.bluetooth.characteristic_uuid,
                payload: self.bluetooth.payload.as_bytes().to_vec(),
            },
        }
    }

    /// The auto-start target, if configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured address is not a MAC address.
    pub fn target_address(&self) -> crate::error::Result<Option<TargetAddress>> {
        self.bluetooth
            .target_address
            .as_deref()
            .map(TargetAddress::parse)
            .transpose()
    }

    /// Parsed listen address.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `server.bind` is not a socket address.
    pub fn bind_addr(&self) -> ConfigResult<SocketAddr> {
        self.server
            .bind
            .parse()
            .map_err(|_| ConfigError::invalid("server.bind", "not a socket address"))
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Instant;

use smartswitch_core::KeepAliveHost;

/// Shared application state.
pub type SharedState = Arc<AppState>;

/// Handles every request needs.
#[derive(Debug)]
pub struct AppState {
    /// The process-wide keep-alive host.
    pub host: Arc<KeepAliveHost>,
    started_at: Instant,
}

impl AppState {
    /// Wrap `host` for use by the router.
    #[must_use]
    pub fn new(host: Arc<KeepAliveHost>) -> SharedState {
        Arc::new(Self {
            host,
            started_at: Instant::now(),
        })
    }

    /// Seconds since the state was created.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

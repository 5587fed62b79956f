//! Fixed-cadence keep-alive loop.
//!
//! Runs one attempt at a time against a single address, then sleeps the
//! cadence, forever. Outcomes are recorded but never change the schedule; the
//! only way out is the cancellation token.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::attempt::{run_attempt, AttemptConfig};
use crate::transport::Transport;
use crate::types::{AttemptOutcome, TargetAddress};

/// Wait between the end of one attempt and the start of the next.
pub const DEFAULT_CADENCE: Duration = Duration::from_millis(15_000);

/// Loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// Interval between attempts.
    pub cadence: Duration,
    /// Settings applied to every attempt.
    pub attempt: AttemptConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            cadence: DEFAULT_CADENCE,
            attempt: AttemptConfig::default(),
        }
    }
}

/// Running counters for one loop. In memory only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    /// Attempts that reached a terminal outcome.
    pub attempts: u64,
    /// Attempts that ended in [`AttemptOutcome::Success`].
    pub successes: u64,
    /// Attempts that ended in any other outcome.
    pub failures: u64,
    /// Cycles skipped because the radio was off.
    pub radio_skips: u64,
    /// Outcome of the most recent attempt.
    pub last_outcome: Option<AttemptOutcome>,
    /// When the most recent attempt finished.
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl LoopStats {
    fn record(&mut self, outcome: AttemptOutcome) {
        self.attempts += 1;
        if outcome.is_success() {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.last_outcome = Some(outcome);
        self.last_attempt_at = Some(Utc::now());
    }
}

/// Keep-alive loop bound to one address.
pub struct PingLoop {
    transport: Arc<dyn Transport>,
    address: TargetAddress,
    config: LoopConfig,
    stats: watch::Sender<LoopStats>,
}

impl PingLoop {
    /// Create a loop and the receiver its stats are published on.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        address: TargetAddress,
        config: LoopConfig,
    ) -> (Self, watch::Receiver<LoopStats>) {
        let (stats, receiver) = watch::channel(LoopStats::default());
        (
            Self {
                transport,
                address,
                config,
                stats,
            },
            receiver,
        )
    }

    /// Run until `cancel` fires.
    ///
    /// Cancellation drops any in-flight attempt, which closes its transport
    /// handle on the spot.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            address = %self.address,
            cadence_ms = self.config.cadence.as_millis(),
            "Ping loop started"
        );

        while self.cycle(&cancel).await {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.cadence) => {}
            }
        }

        info!(address = %self.address, "Ping loop stopped");
    }

    /// One radio check plus at most one attempt. Returns `false` once cancelled.
    async fn cycle(&self, cancel: &CancellationToken) -> bool {
        let radio_enabled = tokio::select! {
            biased;
            () = cancel.cancelled() => return false,
            enabled = self.transport.is_radio_enabled() => enabled,
        };

        if !radio_enabled {
            warn!(address = %self.address, "Bluetooth is off, skipping ping");
            self.stats.send_modify(|stats| stats.radio_skips += 1);
            return true;
        }

        let report = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(address = %self.address, "In-flight attempt cancelled");
                return false;
            }
            report = run_attempt(self.transport.as_ref(), &self.address, &self.config.attempt) => report,
        };

        debug!(
            address = %self.address,
            outcome = %report.outcome,
            elapsed_ms = report.elapsed.as_millis(),
            "Attempt finished"
        );
        self.stats.send_modify(|stats| stats.record(report.outcome));
        true
    }
}

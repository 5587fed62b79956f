//! Lifecycle host.
//!
//! Owns everything that lives for the duration of the Running state: the loop
//! task and its cancellation token, the keep-alive lease, and the ongoing
//! notice. All of it sits in one [`HostContext`] behind a single async mutex,
//! so start, stop and teardown are the only code that ever touches the lease.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::lease::{KeepAliveLease, LeaseError};
use crate::ping_loop::{LoopConfig, LoopStats, PingLoop};
use crate::status::{OngoingNotice, StatusIndicator};
use crate::transport::Transport;
use crate::types::{LoopState, TargetAddress};

/// How long `stop` waits for the loop task before aborting it.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// What a call to [`KeepAliveHost::start`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartDisposition {
    /// A new loop was started.
    Started,
    /// A loop for the same address was already running; nothing changed.
    AlreadyRunning,
    /// A loop for another address was stopped and a new one started.
    Restarted {
        /// Address of the loop that was replaced.
        previous: TargetAddress,
    },
}

/// Point-in-time view of the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostStatus {
    /// Current loop state.
    pub state: LoopState,
    /// Address of the running loop.
    pub address: Option<TargetAddress>,
    /// When the running loop was started.
    pub started_at: Option<DateTime<Utc>>,
    /// Notice on display while running.
    pub notice: Option<OngoingNotice>,
    /// Whether the keep-alive lease is held.
    pub lease_held: bool,
    /// Counters of the running loop, or of the last one after a stop.
    pub stats: LoopStats,
}

/// Keeps acquire and release of the lease balanced.
struct LeaseGuard {
    lease: Box<dyn KeepAliveLease>,
    held: bool,
}

impl LeaseGuard {
    async fn acquire(&mut self) -> std::result::Result<(), LeaseError> {
        if self.held {
            return Ok(());
        }
        self.lease.acquire().await?;
        self.held = true;
        Ok(())
    }

    async fn release(&mut self) {
        if self.held {
            self.lease.release().await;
            self.held = false;
        }
    }

    fn is_held(&mut self) -> bool {
        self.held && self.lease.is_held()
    }
}

struct RunningLoop {
    address: TargetAddress,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    stats: watch::Receiver<LoopStats>,
}

struct HostContext {
    state: LoopState,
    lease: LeaseGuard,
    running: Option<RunningLoop>,
    last_stats: LoopStats,
}

/// Process-wide owner of the keep-alive loop.
pub struct KeepAliveHost {
    transport: Arc<dyn Transport>,
    indicator: Arc<dyn StatusIndicator>,
    config: LoopConfig,
    notice: OngoingNotice,
    context: Mutex<HostContext>,
}

impl std::fmt::Debug for KeepAliveHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAliveHost")
            .field("config", &self.config)
            .field("notice", &self.notice)
            .finish_non_exhaustive()
    }
}

impl KeepAliveHost {
    /// Create a host in the `NotStarted` state.
    pub fn new(
        transport: Arc<dyn Transport>,
        lease: Box<dyn KeepAliveLease>,
        indicator: Arc<dyn StatusIndicator>,
        config: LoopConfig,
        notice: OngoingNotice,
    ) -> Self {
        Self {
            transport,
            indicator,
            config,
            notice,
            context: Mutex::new(HostContext {
                state: LoopState::NotStarted,
                lease: LeaseGuard { lease, held: false },
                running: None,
                last_stats: LoopStats::default(),
            }),
        }
    }

    /// Start keeping `address` alive.
    ///
    /// Idempotent for the address already running. A different address stops
    /// the current loop first.
    ///
    /// # Errors
    ///
    /// Returns [`SmartSwitchError::LeaseUnavailable`](crate::error::SmartSwitchError::LeaseUnavailable)
    /// if the keep-alive lease cannot be acquired. No loop is running afterwards.
    pub async fn start(&self, address: TargetAddress) -> Result<StartDisposition> {
        let mut ctx = self.context.lock().await;

        let previous = match &ctx.running {
            Some(running) if running.address == address => {
                debug!(address = %address, "Keep-alive already running");
                return Ok(StartDisposition::AlreadyRunning);
            }
            Some(running) => Some(running.address.clone()),
            None => None,
        };

        if let Some(previous) = previous {
            info!(from = %previous, to = %address, "Switching keep-alive target");
            self.stop_locked(&mut ctx).await;
            self.start_locked(&mut ctx, address).await?;
            return Ok(StartDisposition::Restarted { previous });
        }

        self.start_locked(&mut ctx, address).await?;
        Ok(StartDisposition::Started)
    }

    /// Stop the loop and release everything it held.
    ///
    /// An in-flight attempt is force-closed. Returns `false` if nothing was running.
    pub async fn stop(&self) -> bool {
        let mut ctx = self.context.lock().await;
        self.stop_locked(&mut ctx).await
    }

    /// Teardown hook for the embedding process. Same cleanup as [`stop`](Self::stop).
    pub async fn shutdown(&self) {
        info!("Keep-alive host shutting down");
        let mut ctx = self.context.lock().await;
        self.stop_locked(&mut ctx).await;
    }

    /// Current state, address and counters.
    pub async fn status(&self) -> HostStatus {
        let mut ctx = self.context.lock().await;
        let lease_held = ctx.lease.is_held();
        let running = ctx.running.as_ref();
        HostStatus {
            state: ctx.state,
            address: running.map(|r| r.address.clone()),
            started_at: running.map(|r| r.started_at),
            notice: running.map(|_| self.notice.clone()),
            lease_held,
            stats: running.map_or_else(|| ctx.last_stats.clone(), |r| r.stats.borrow().clone()),
        }
    }

    /// Loop settings every started loop uses.
    #[must_use]
    pub const fn loop_config(&self) -> &LoopConfig {
        &self.config
    }

    async fn start_locked(&self, ctx: &mut HostContext, address: TargetAddress) -> Result<()> {
        ctx.lease.acquire().await.map_err(|e| {
            warn!(address = %address, error = %e, "Cannot acquire keep-alive lease");
            e
        })?;

        let (ping_loop, stats) =
            PingLoop::new(Arc::clone(&self.transport), address.clone(), self.config.clone());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(ping_loop.run(cancel.clone()));

        self.indicator.show(&self.notice);
        ctx.state = LoopState::Running;
        ctx.running = Some(RunningLoop {
            address: address.clone(),
            started_at: Utc::now(),
            cancel,
            task,
            stats,
        });

        info!(address = %address, "Keep-alive started");
        Ok(())
    }

    async fn stop_locked(&self, ctx: &mut HostContext) -> bool {
        let Some(mut running) = ctx.running.take() else {
            debug!("Keep-alive not running");
            return false;
        };

        running.cancel.cancel();
        match tokio::time::timeout(STOP_TIMEOUT, &mut running.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Ping loop task ended abnormally"),
            Err(_) => {
                warn!("Ping loop did not stop in time, aborting");
                running.task.abort();
            }
        }

        ctx.last_stats = running.stats.borrow().clone();
        ctx.lease.release().await;
        self.indicator.clear();
        ctx.state = LoopState::Stopped;

        info!(address = %running.address, "Keep-alive stopped");
        true
    }
}

// The lease goes with the context; lease helpers are killed on drop.
impl Drop for KeepAliveHost {
    fn drop(&mut self) {
        let ctx = self.context.get_mut();
        if let Some(running) = ctx.running.take() {
            warn!(address = %running.address, "Keep-alive host dropped while running");
            running.cancel.cancel();
            running.task.abort();
            self.indicator.clear();
            ctx.state = LoopState::Stopped;
        }
    }
}

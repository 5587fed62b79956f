//! One connect → discover → write → disconnect cycle.
//!
//! An attempt owns its [`ConnectionHandle`] and reports exactly one
//! [`AttemptOutcome`]. The handle is closed before the outcome is returned on
//! every path, and closing also happens in `Drop`, so cancelling an attempt by
//! dropping its future force-closes the transport synchronously.
//!
//! ```text
//! Idle ─► Connecting ─► Discovering ─► Writing ─► Disconnecting ─► Closed
//!            │              │             │             │
//!            └──────────────┴─────────────┴─────────────┴──► Failed
//! ```
//!
//! A single deadline covers the whole sequence. When it fires the handle is
//! closed without waiting for any pending event.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::transport::{
    event_channel, has_characteristic, GattStatus, LinkState, Session, Transport, TransportEvent,
    DEFAULT_CHARACTERISTIC_UUID, DEFAULT_SERVICE_UUID,
};
use crate::types::{AttemptOutcome, TargetAddress};

/// Hard deadline for a full attempt.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(5000);

/// How long to wait for the peripheral to confirm our own disconnect.
pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_millis(1000);

/// Value written to activate the switch (ASCII `"1"`).
pub const KEEPALIVE_PAYLOAD: [u8; 1] = [b'1'];

/// Per-attempt settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptConfig {
    /// Deadline measured from the connect request.
    pub timeout: Duration,
    /// Upper bound on waiting for the disconnect confirmation.
    pub disconnect_grace: Duration,
    /// Service holding the keep-alive characteristic.
    pub service_uuid: Uuid,
    /// Characteristic that receives the payload.
    pub characteristic_uuid: Uuid,
    /// Bytes written on every attempt.
    pub payload: Vec<u8>,
}

impl Default for AttemptConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_ATTEMPT_TIMEOUT,
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
            service_uuid: DEFAULT_SERVICE_UUID,
            characteristic_uuid: DEFAULT_CHARACTERISTIC_UUID,
            payload: KEEPALIVE_PAYLOAD.to_vec(),
        }
    }
}

/// Attempt state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// Nothing issued yet.
    Idle,
    /// Waiting for the link.
    Connecting,
    /// Waiting for the service tree.
    Discovering,
    /// Waiting for the write acknowledgement.
    Writing,
    /// Disconnect issued, waiting for confirmation.
    Disconnecting,
    /// Completed successfully, handle closed.
    Closed,
    /// Terminated with a failure, handle closed.
    Failed,
}

/// Why an attempt failed. Converted into an [`AttemptOutcome`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptError {
    /// The transport refused to issue the connect.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The link went down before the write completed.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// Discovery completed with a failure status.
    #[error("service discovery failed with status {0}")]
    Discovery(GattStatus),

    /// The expected service/characteristic pair is absent.
    #[error("characteristic not found")]
    CharacteristicNotFound,

    /// The write completed with a failure status.
    #[error("write failed with status {0}")]
    Write(GattStatus),

    /// The backend dropped every event sender.
    #[error("transport event stream closed")]
    EventStreamClosed,
}

impl From<AttemptError> for AttemptOutcome {
    fn from(err: AttemptError) -> Self {
        match err {
            AttemptError::Disconnected(reason) => Self::Disconnected(reason),
            AttemptError::CharacteristicNotFound => {
                Self::TransportError("characteristic not found".to_string())
            }
            other => Self::TransportError(other.to_string()),
        }
    }
}

/// Result of a finished attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    /// The single terminal outcome.
    pub outcome: AttemptOutcome,
    /// [`AttemptState::Closed`] on success, [`AttemptState::Failed`] otherwise.
    pub final_state: AttemptState,
    /// Time from the connect request until the handle was closed.
    pub elapsed: Duration,
}

/// Exclusive owner of one transport session.
///
/// `disconnect` is issued at most once and `release` exactly once, whichever
/// path closes the handle first.
pub struct ConnectionHandle {
    session: Box<dyn Session>,
    disconnect_requested: bool,
    released: bool,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("disconnect_requested", &self.disconnect_requested)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// Take ownership of an open session.
    #[must_use]
    pub fn new(session: Box<dyn Session>) -> Self {
        Self {
            session,
            disconnect_requested: false,
            released: false,
        }
    }

    /// Issue service discovery.
    pub fn discover_capabilities(&mut self) {
        if !self.released {
            self.session.discover_capabilities();
        }
    }

    /// Issue a characteristic write.
    pub fn write(&mut self, service: Uuid, characteristic: Uuid, value: &[u8]) {
        if !self.released {
            self.session.write(service, characteristic, value);
        }
    }

    /// Issue a disconnect unless one was already requested.
    pub fn request_disconnect(&mut self) {
        if self.disconnect_requested || self.released {
            return;
        }
        self.disconnect_requested = true;
        self.session.disconnect();
    }

    /// Disconnect (if still needed) and release the session.
    pub fn close(&mut self) {
        if self.released {
            return;
        }
        self.request_disconnect();
        self.released = true;
        self.session.release();
    }

    /// Whether the session has been released.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.released
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

struct Attempt<'a> {
    address: &'a TargetAddress,
    config: &'a AttemptConfig,
    handle: ConnectionHandle,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    state: AttemptState,
}

impl Attempt<'_> {
    /// Drive events until the write completes or the attempt fails.
    ///
    /// Returns with the state at `Disconnecting` (disconnect already issued)
    /// or `Failed`.
    async fn exchange(&mut self) -> Result<(), AttemptError> {
        loop {
            let Some(event) = self.events.recv().await else {
                self.state = AttemptState::Failed;
                return Err(AttemptError::EventStreamClosed);
            };

            match (self.state, event) {
                (
                    AttemptState::Connecting,
                    TransportEvent::ConnectionState(LinkState::Connected),
                ) => {
                    info!(address = %self.address, "Connected");
                    self.state = AttemptState::Discovering;
                    info!(address = %self.address, "Discovering services");
                    self.handle.discover_capabilities();
                }
                (
                    AttemptState::Connecting | AttemptState::Discovering | AttemptState::Writing,
                    TransportEvent::ConnectionState(LinkState::Disconnected),
                ) => {
                    self.state = AttemptState::Failed;
                    return Err(AttemptError::Disconnected("unexpected".to_string()));
                }
                (
                    AttemptState::Discovering,
                    TransportEvent::DiscoveryComplete { status, services },
                ) => {
                    if !status.is_success() {
                        return Err(self.abort(AttemptError::Discovery(status)));
                    }
                    if !has_characteristic(
                        &services,
                        self.config.service_uuid,
                        self.config.characteristic_uuid,
                    ) {
                        return Err(self.abort(AttemptError::CharacteristicNotFound));
                    }
                    self.state = AttemptState::Writing;
                    self.handle.write(
                        self.config.service_uuid,
                        self.config.characteristic_uuid,
                        &self.config.payload,
                    );
                }
                (AttemptState::Writing, TransportEvent::WriteComplete { status }) => {
                    // A write is always followed by a disconnect, whatever its status.
                    self.handle.request_disconnect();
                    self.state = AttemptState::Disconnecting;
                    if status.is_success() {
                        info!(address = %self.address, "Keep-alive write succeeded");
                        return Ok(());
                    }
                    return Err(AttemptError::Write(status));
                }
                (state, event) => {
                    debug!(address = %self.address, ?state, ?event, "Ignoring transport event");
                }
            }
        }
    }

    fn abort(&mut self, error: AttemptError) -> AttemptError {
        self.handle.request_disconnect();
        self.state = AttemptState::Disconnecting;
        error
    }

    /// Wait for the link-down event that our own disconnect triggers.
    async fn await_disconnect(&mut self, until: Instant) {
        let confirmed = tokio::time::timeout_at(until, async {
            while let Some(event) = self.events.recv().await {
                if event == TransportEvent::ConnectionState(LinkState::Disconnected) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);

        if confirmed {
            info!(address = %self.address, "Disconnected");
        } else {
            debug!(address = %self.address, "Disconnect not confirmed, releasing anyway");
        }
    }
}

/// Run one attempt against `address`.
///
/// Never fails: every error is folded into the report's outcome. Dropping the
/// returned future closes the transport handle immediately.
pub async fn run_attempt(
    transport: &dyn Transport,
    address: &TargetAddress,
    config: &AttemptConfig,
) -> AttemptReport {
    let started = Instant::now();
    let deadline = started + config.timeout;
    info!(address = %address, "Ping attempt started");

    let (sink, events) = event_channel();
    let session = match transport.connect(address, sink) {
        Ok(session) => session,
        Err(e) => {
            let error = AttemptError::Connect(e.to_string());
            warn!(address = %address, error = %error, "Transport error");
            return AttemptReport {
                outcome: error.into(),
                final_state: AttemptState::Failed,
                elapsed: started.elapsed(),
            };
        }
    };

    let mut attempt = Attempt {
        address,
        config,
        handle: ConnectionHandle::new(session),
        events,
        state: AttemptState::Connecting,
    };

    let exchanged = tokio::time::timeout_at(deadline, attempt.exchange()).await;
    let outcome = match exchanged {
        Err(_) => {
            warn!(
                address = %address,
                state = ?attempt.state,
                timeout_ms = config.timeout.as_millis(),
                "Attempt timed out, forcing disconnect"
            );
            AttemptOutcome::Timeout
        }
        Ok(result) => {
            if attempt.state == AttemptState::Disconnecting {
                let until = deadline.min(Instant::now() + config.disconnect_grace);
                attempt.await_disconnect(until).await;
            }
            match result {
                Ok(()) => AttemptOutcome::Success,
                Err(error) => {
                    if let AttemptError::Disconnected(_) = error {
                        warn!(address = %address, "Disconnected before write completed");
                    } else {
                        warn!(address = %address, error = %error, "Transport error");
                    }
                    error.into()
                }
            }
        }
    };

    attempt.handle.close();
    attempt.state = if outcome.is_success() {
        AttemptState::Closed
    } else {
        AttemptState::Failed
    };

    AttemptReport {
        outcome,
        final_state: attempt.state,
        elapsed: started.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockScript, MockTransport, Step, TransportCall};
    use crate::transport::DiscoveredService;

    fn address() -> TargetAddress {
        TargetAddress::parse("AA:BB:CC:DD:EE:FF").unwrap()
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn assert_closed_once(transport: &MockTransport) {
        assert_eq!(transport.count(|c| *c == TransportCall::Release), 1);
        assert_eq!(transport.count(|c| *c == TransportCall::Disconnect), 1);
        assert_eq!(transport.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_attempt_sequence() {
        let transport = MockTransport::new();
        let report = run_attempt(&transport, &address(), &AttemptConfig::default()).await;

        assert_eq!(report.outcome, AttemptOutcome::Success);
        assert_eq!(report.final_state, AttemptState::Closed);
        assert_eq!(
            transport.calls(),
            vec![
                TransportCall::Connect(address()),
                TransportCall::Discover,
                TransportCall::Write {
                    service: DEFAULT_SERVICE_UUID,
                    characteristic: DEFAULT_CHARACTERISTIC_UUID,
                    value: vec![0x31],
                },
                TransportCall::Disconnect,
                TransportCall::Release,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_hang_times_out_at_deadline() {
        let transport = MockTransport::with_script(MockScript {
            discover: Step::Hang,
            ..MockScript::default()
        });
        let report = run_attempt(&transport, &address(), &AttemptConfig::default()).await;

        assert_eq!(report.outcome, AttemptOutcome::Timeout);
        assert_eq!(report.final_state, AttemptState::Failed);
        assert!(report.elapsed >= DEFAULT_ATTEMPT_TIMEOUT);
        assert!(report.elapsed < DEFAULT_ATTEMPT_TIMEOUT + ms(5));
        assert_closed_once(&transport);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_hang_times_out() {
        let transport = MockTransport::with_script(MockScript {
            connect: Step::Hang,
            ..MockScript::default()
        });
        let report = run_attempt(&transport, &address(), &AttemptConfig::default()).await;

        assert_eq!(report.outcome, AttemptOutcome::Timeout);
        assert!(report.elapsed <= DEFAULT_ATTEMPT_TIMEOUT + ms(1));
        assert_closed_once(&transport);
        assert_eq!(transport.count(|c| *c == TransportCall::Discover), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_covers_whole_sequence() {
        // Each step alone is well within the deadline; together they are not.
        let transport = MockTransport::with_script(MockScript {
            connect: Step::Succeed(ms(2000)),
            discover: Step::Succeed(ms(2000)),
            write: Step::Succeed(ms(2000)),
            ..MockScript::default()
        });
        let report = run_attempt(&transport, &address(), &AttemptConfig::default()).await;

        assert_eq!(report.outcome, AttemptOutcome::Timeout);
        assert!(transport
            .calls()
            .iter()
            .any(|c| matches!(c, TransportCall::Write { .. })));
        assert_closed_once(&transport);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_connecting_is_failure() {
        let transport = MockTransport::with_script(MockScript {
            connect: Step::Fail(ms(50)),
            ..MockScript::default()
        });
        let report = run_attempt(&transport, &address(), &AttemptConfig::default()).await;

        assert_eq!(
            report.outcome,
            AttemptOutcome::Disconnected("unexpected".to_string())
        );
        assert_eq!(report.final_state, AttemptState::Failed);
        assert_closed_once(&transport);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_discovering_is_never_success() {
        let transport = MockTransport::with_script(MockScript {
            discover: Step::DropLink(ms(50)),
            ..MockScript::default()
        });
        let report = run_attempt(&transport, &address(), &AttemptConfig::default()).await;

        assert!(matches!(report.outcome, AttemptOutcome::Disconnected(_)));
        assert_eq!(transport.count(|c| matches!(c, TransportCall::Write { .. })), 0);
        assert_closed_once(&transport);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_writing_is_failure() {
        let transport = MockTransport::with_script(MockScript {
            write: Step::DropLink(ms(50)),
            ..MockScript::default()
        });
        let report = run_attempt(&transport, &address(), &AttemptConfig::default()).await;

        assert!(matches!(report.outcome, AttemptOutcome::Disconnected(_)));
        assert_closed_once(&transport);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_characteristic_aborts_with_disconnect() {
        let transport = MockTransport::with_script(MockScript {
            services: vec![DiscoveredService::new(DEFAULT_SERVICE_UUID, Vec::new())],
            ..MockScript::default()
        });
        let report = run_attempt(&transport, &address(), &AttemptConfig::default()).await;

        assert_eq!(
            report.outcome,
            AttemptOutcome::TransportError("characteristic not found".to_string())
        );
        assert_eq!(report.final_state, AttemptState::Failed);
        assert_eq!(
            transport.calls(),
            vec![
                TransportCall::Connect(address()),
                TransportCall::Discover,
                TransportCall::Disconnect,
                TransportCall::Release,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_failure_status_aborts() {
        let transport = MockTransport::with_script(MockScript {
            discover: Step::Fail(ms(20)),
            ..MockScript::default()
        });
        let report = run_attempt(&transport, &address(), &AttemptConfig::default()).await;

        assert!(matches!(report.outcome, AttemptOutcome::TransportError(ref r) if r.contains("discovery")));
        assert_eq!(transport.count(|c| matches!(c, TransportCall::Write { .. })), 0);
        assert_closed_once(&transport);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_still_disconnects() {
        let transport = MockTransport::with_script(MockScript {
            write: Step::Fail(ms(20)),
            ..MockScript::default()
        });
        let report = run_attempt(&transport, &address(), &AttemptConfig::default()).await;

        assert!(matches!(report.outcome, AttemptOutcome::TransportError(ref r) if r.contains("write failed")));
        let calls = transport.calls();
        let write_at = calls
            .iter()
            .position(|c| matches!(c, TransportCall::Write { .. }))
            .unwrap();
        assert_eq!(calls[write_at + 1], TransportCall::Disconnect);
        assert_closed_once(&transport);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_disconnect_is_released_after_grace() {
        let transport = MockTransport::with_script(MockScript {
            confirm_disconnect: None,
            ..MockScript::default()
        });
        let report = run_attempt(&transport, &address(), &AttemptConfig::default()).await;

        assert_eq!(report.outcome, AttemptOutcome::Success);
        // 3 steps of 10 ms, then the full grace period.
        assert!(report.elapsed >= ms(30) + DEFAULT_DISCONNECT_GRACE);
        assert!(report.elapsed < ms(40) + DEFAULT_DISCONNECT_GRACE);
        assert_closed_once(&transport);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connect_reports_transport_error() {
        let transport = MockTransport::with_script(MockScript {
            refuse_connect: true,
            ..MockScript::default()
        });
        let report = run_attempt(&transport, &address(), &AttemptConfig::default()).await;

        assert!(matches!(report.outcome, AttemptOutcome::TransportError(ref r) if r.starts_with("connect failed")));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_attempt_force_closes_handle() {
        let transport = MockTransport::with_script(MockScript {
            discover: Step::Hang,
            ..MockScript::default()
        });
        let addr = address();
        let config = AttemptConfig::default();

        let cancelled =
            tokio::time::timeout(ms(100), run_attempt(&transport, &addr, &config)).await;

        assert!(cancelled.is_err());
        assert_closed_once(&transport);
    }

    #[test]
    fn test_connection_handle_closes_exactly_once() {
        struct CountingSession {
            disconnects: std::sync::Arc<std::sync::atomic::AtomicUsize>,
            releases: std::sync::Arc<std::sync::atomic::AtomicUsize>,
        }
        impl Session for CountingSession {
            fn discover_capabilities(&mut self) {}
            fn write(&mut self, _: Uuid, _: Uuid, _: &[u8]) {}
            fn disconnect(&mut self) {
                self.disconnects
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
            fn release(&mut self) {
                self.releases.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let disconnects = std::sync::Arc::default();
        let releases = std::sync::Arc::default();
        {
            let mut handle = ConnectionHandle::new(Box::new(CountingSession {
                disconnects: std::sync::Arc::clone(&disconnects),
                releases: std::sync::Arc::clone(&releases),
            }));
            handle.request_disconnect();
            handle.request_disconnect();
            handle.close();
            handle.close();
            assert!(handle.is_closed());
        }
        assert_eq!(disconnects.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(releases.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_attempt_error_to_outcome() {
        assert_eq!(
            AttemptOutcome::from(AttemptError::Disconnected("unexpected".into())),
            AttemptOutcome::Disconnected("unexpected".into())
        );
        assert_eq!(
            AttemptOutcome::from(AttemptError::Write(GattStatus::FAILURE)),
            AttemptOutcome::TransportError("write failed with status 0x101".into())
        );
    }
}

//! Scriptable in-process transport.
//!
//! Used by the test suites and by `--features mock-bluetooth` builds of the
//! server, which then keep a simulated switch alive. Each step of the GATT
//! sequence follows a [`Step`] from the current [`MockScript`]; every call the
//! attempt makes is appended to an ordered log.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{
    DiscoveredService, EventSink, GattStatus, LinkState, Session, Transport, TransportError,
    TransportEvent, DEFAULT_CHARACTERISTIC_UUID, DEFAULT_SERVICE_UUID,
};
use crate::types::TargetAddress;

/// How a scripted step completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Complete successfully after the delay.
    Succeed(Duration),
    /// Complete with [`GattStatus::FAILURE`] after the delay.
    /// A failed connect surfaces as a disconnection.
    Fail(Duration),
    /// Drop the link after the delay instead of completing.
    DropLink(Duration),
    /// Never complete.
    Hang,
}

/// Behaviour for one attempt's worth of transport operations.
#[derive(Debug, Clone)]
pub struct MockScript {
    /// Connect step.
    pub connect: Step,
    /// Discovery step.
    pub discover: Step,
    /// Write step.
    pub write: Step,
    /// Delay before a requested disconnect is confirmed, `None` to never confirm.
    pub confirm_disconnect: Option<Duration>,
    /// Service tree reported by a successful discovery.
    pub services: Vec<DiscoveredService>,
    /// Refuse `connect` synchronously.
    pub refuse_connect: bool,
}

const STEP_DELAY: Duration = Duration::from_millis(10);

impl Default for MockScript {
    fn default() -> Self {
        Self {
            connect: Step::Succeed(STEP_DELAY),
            discover: Step::Succeed(STEP_DELAY),
            write: Step::Succeed(STEP_DELAY),
            confirm_disconnect: Some(STEP_DELAY),
            services: vec![DiscoveredService::new(
                DEFAULT_SERVICE_UUID,
                vec![DEFAULT_CHARACTERISTIC_UUID],
            )],
            refuse_connect: false,
        }
    }
}

/// A transport call as observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    /// `Transport::connect`.
    Connect(TargetAddress),
    /// `Session::discover_capabilities`.
    Discover,
    /// `Session::write`.
    Write {
        /// Target service.
        service: Uuid,
        /// Target characteristic.
        characteristic: Uuid,
        /// Written bytes.
        value: Vec<u8>,
    },
    /// `Session::disconnect`.
    Disconnect,
    /// `Session::release`.
    Release,
}

#[derive(Debug, Default)]
struct Shared {
    calls: Mutex<Vec<TransportCall>>,
}

impl Shared {
    fn record(&self, call: TransportCall) {
        lock(&self.calls).push(call);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock BLE stack.
#[derive(Debug)]
pub struct MockTransport {
    radio_enabled: AtomicBool,
    radio_checks: AtomicU64,
    script: Mutex<MockScript>,
    shared: Arc<Shared>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A powered radio and a peripheral that answers every step.
    #[must_use]
    pub fn new() -> Self {
        Self::with_script(MockScript::default())
    }

    /// A powered radio following `script`.
    #[must_use]
    pub fn with_script(script: MockScript) -> Self {
        Self {
            radio_enabled: AtomicBool::new(true),
            radio_checks: AtomicU64::new(0),
            script: Mutex::new(script),
            shared: Arc::new(Shared::default()),
        }
    }

    /// Switch the simulated radio on or off.
    pub fn set_radio_enabled(&self, enabled: bool) {
        self.radio_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Replace the script used by subsequent connects.
    pub fn set_script(&self, script: MockScript) {
        *lock(&self.script) = script;
    }

    /// Snapshot of every call so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.shared.calls).clone()
    }

    /// Number of recorded calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        lock(&self.shared.calls).iter().filter(|c| predicate(c)).count()
    }

    /// Number of sessions opened and not yet released.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        let connects = self.count(|c| matches!(c, TransportCall::Connect(_)));
        let releases = self.count(|c| matches!(c, TransportCall::Release));
        connects.saturating_sub(releases)
    }

    /// How many times the radio state was queried.
    #[must_use]
    pub fn radio_checks(&self) -> u64 {
        self.radio_checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn is_radio_enabled(&self) -> bool {
        self.radio_checks.fetch_add(1, Ordering::SeqCst);
        self.radio_enabled.load(Ordering::SeqCst)
    }

    fn connect(
        &self,
        address: &TargetAddress,
        events: EventSink,
    ) -> Result<Box<dyn Session>, TransportError> {
        let script = lock(&self.script).clone();
        if script.refuse_connect {
            return Err(TransportError::ConnectFailed {
                message: format!("mock refused connection to {address}"),
            });
        }
        self.shared.record(TransportCall::Connect(address.clone()));

        let mut session = MockSession {
            events,
            script,
            shared: Arc::clone(&self.shared),
            tasks: Vec::new(),
            released: false,
        };
        let on_success = TransportEvent::ConnectionState(LinkState::Connected);
        let on_failure = TransportEvent::ConnectionState(LinkState::Disconnected);
        session.schedule(session.script.connect, on_success, on_failure);
        Ok(Box::new(session))
    }
}

struct MockSession {
    events: EventSink,
    script: MockScript,
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
    released: bool,
}

impl MockSession {
    fn schedule(&mut self, step: Step, on_success: TransportEvent, on_failure: TransportEvent) {
        let (delay, event) = match step {
            Step::Succeed(delay) => (delay, on_success),
            Step::Fail(delay) => (delay, on_failure),
            Step::DropLink(delay) => (
                delay,
                TransportEvent::ConnectionState(LinkState::Disconnected),
            ),
            Step::Hang => return,
        };
        self.post_after(delay, event);
    }

    fn post_after(&mut self, delay: Duration, event: TransportEvent) {
        let events = self.events.clone();
        self.tasks.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            events.send(event);
        }));
    }
}

impl Session for MockSession {
    fn discover_capabilities(&mut self) {
        self.shared.record(TransportCall::Discover);
        let on_success = TransportEvent::DiscoveryComplete {
            status: GattStatus::SUCCESS,
            services: self.script.services.clone(),
        };
        let on_failure = TransportEvent::DiscoveryComplete {
            status: GattStatus::FAILURE,
            services: Vec::new(),
        };
        self.schedule(self.script.discover, on_success, on_failure);
    }

    fn write(&mut self, service: Uuid, characteristic: Uuid, value: &[u8]) {
        self.shared.record(TransportCall::Write {
            service,
            characteristic,
            value: value.to_vec(),
        });
        let on_success = TransportEvent::WriteComplete {
            status: GattStatus::SUCCESS,
        };
        let on_failure = TransportEvent::WriteComplete {
            status: GattStatus::FAILURE,
        };
        self.schedule(self.script.write, on_success, on_failure);
    }

    fn disconnect(&mut self) {
        self.shared.record(TransportCall::Disconnect);
        if let Some(delay) = self.script.confirm_disconnect {
            self.post_after(delay, TransportEvent::ConnectionState(LinkState::Disconnected));
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.shared.record(TransportCall::Release);
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

//! BlueZ backend built on `bluer`.
//!
//! `bluer` exposes awaitable D-Bus calls, so each issued operation runs in its
//! own tokio task and reports back through the session's [`EventSink`].
//! Releasing a session aborts whatever is still in flight.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, Address, AddressType, Device, DeviceEvent, DeviceProperty};
use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    DiscoveredService, EventSink, GattStatus, LinkState, Session, Transport, TransportError,
    TransportEvent,
};
use crate::types::TargetAddress;

/// Poll interval while waiting for BlueZ to finish resolving services.
const SERVICES_RESOLVED_POLL: Duration = Duration::from_millis(100);

type CharacteristicMap = Arc<Mutex<HashMap<(Uuid, Uuid), Characteristic>>>;

/// Transport backed by a local BlueZ adapter.
pub struct BluezTransport {
    // Keeps the D-Bus connection alive for the adapter's lifetime.
    _session: bluer::Session,
    adapter: Adapter,
}

impl std::fmt::Debug for BluezTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BluezTransport")
            .field("adapter", &self.adapter.name())
            .finish_non_exhaustive()
    }
}

impl BluezTransport {
    /// Open a BlueZ session on `adapter_name`, or the default adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if bluetoothd is unreachable or the adapter is missing.
    pub async fn new(adapter_name: Option<&str>) -> Result<Self, TransportError> {
        let session = bluer::Session::new()
            .await
            .map_err(|e| TransportError::SessionInitFailed {
                message: e.to_string(),
            })?;

        let adapter = match adapter_name {
            Some(name) => session.adapter(name),
            None => session.default_adapter().await,
        }
        .map_err(|e| {
            debug!(error = %e, "adapter lookup failed");
            TransportError::AdapterNotFound
        })?;

        info!(adapter = %adapter.name(), "Using Bluetooth adapter");
        Ok(Self {
            _session: session,
            adapter,
        })
    }
}

#[async_trait]
impl Transport for BluezTransport {
    async fn is_radio_enabled(&self) -> bool {
        match self.adapter.is_powered().await {
            Ok(powered) => powered,
            Err(e) => {
                warn!(error = %e, "Failed to query adapter power state");
                false
            }
        }
    }

    fn connect(
        &self,
        address: &TargetAddress,
        events: EventSink,
    ) -> Result<Box<dyn Session>, TransportError> {
        let parsed: Address =
            address
                .as_str()
                .parse()
                .map_err(|_| TransportError::InvalidAddress {
                    address: address.to_string(),
                })?;
        let device = self
            .adapter
            .device(parsed)
            .map_err(|e| TransportError::ConnectFailed {
                message: e.to_string(),
            })?;

        let mut session = BluezSession {
            adapter: self.adapter.clone(),
            address: parsed,
            device,
            events,
            characteristics: Arc::default(),
            tasks: Vec::new(),
            disconnect_requested: false,
            released: false,
        };
        session.spawn_connect();
        Ok(Box::new(session))
    }
}

struct BluezSession {
    adapter: Adapter,
    address: Address,
    device: Device,
    events: EventSink,
    characteristics: CharacteristicMap,
    tasks: Vec<JoinHandle<()>>,
    disconnect_requested: bool,
    released: bool,
}

impl BluezSession {
    /// Connect, then keep watching the device so a remote drop is reported.
    ///
    /// `Device::connect` only works for peripherals bluetoothd already knows
    /// (paired or seen in a scan). Unknown addresses go through
    /// `Adapter::connect_device` as LE public addresses, which needs bluetoothd
    /// running with experimental interfaces enabled (`-E`).
    fn spawn_connect(&mut self) {
        let adapter = self.adapter.clone();
        let address = self.address;
        let device = self.device.clone();
        let events = self.events.clone();
        self.tasks.push(tokio::spawn(async move {
            let known = match adapter.device_addresses().await {
                Ok(addresses) => addresses.contains(&address),
                Err(e) => {
                    debug!(error = %e, "Cannot list known devices");
                    true
                }
            };

            let connected = if known {
                device.connect().await.map(|()| device)
            } else {
                debug!(address = %address, "Device unknown to bluetoothd, connecting directly");
                adapter.connect_device(address, AddressType::LePublic).await
            };
            let device = match connected {
                Ok(device) => device,
                Err(e) => {
                    debug!(error = %e, "Connect failed");
                    events.send(TransportEvent::ConnectionState(LinkState::Disconnected));
                    return;
                }
            };

            let changes = match device.events().await {
                Ok(changes) => changes,
                Err(e) => {
                    debug!(error = %e, "Cannot subscribe to device events");
                    events.send(TransportEvent::ConnectionState(LinkState::Disconnected));
                    return;
                }
            };
            events.send(TransportEvent::ConnectionState(LinkState::Connected));

            let mut changes = pin!(changes);
            while let Some(change) = changes.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = change {
                    events.send(TransportEvent::ConnectionState(LinkState::Disconnected));
                    break;
                }
            }
        }));
    }
}

async fn resolve_services(
    device: &Device,
    characteristics: &CharacteristicMap,
) -> bluer::Result<Vec<DiscoveredService>> {
    while !device.is_services_resolved().await? {
        tokio::time::sleep(SERVICES_RESOLVED_POLL).await;
    }

    let mut discovered = Vec::new();
    for service in device.services().await? {
        let service_uuid = service.uuid().await?;
        let mut uuids = Vec::new();
        for characteristic in service.characteristics().await? {
            let uuid = characteristic.uuid().await?;
            uuids.push(uuid);
            characteristics
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert((service_uuid, uuid), characteristic);
        }
        discovered.push(DiscoveredService::new(service_uuid, uuids));
    }
    Ok(discovered)
}

impl Session for BluezSession {
    fn discover_capabilities(&mut self) {
        let device = self.device.clone();
        let events = self.events.clone();
        let characteristics = Arc::clone(&self.characteristics);
        self.tasks.push(tokio::spawn(async move {
            let event = match resolve_services(&device, &characteristics).await {
                Ok(services) => TransportEvent::DiscoveryComplete {
                    status: GattStatus::SUCCESS,
                    services,
                },
                Err(e) => {
                    debug!(error = %e, "Service discovery failed");
                    TransportEvent::DiscoveryComplete {
                        status: GattStatus::FAILURE,
                        services: Vec::new(),
                    }
                }
            };
            events.send(event);
        }));
    }

    fn write(&mut self, service: Uuid, characteristic: Uuid, value: &[u8]) {
        let target = self
            .characteristics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(service, characteristic))
            .cloned();
        let events = self.events.clone();
        let value = value.to_vec();
        self.tasks.push(tokio::spawn(async move {
            let status = match target {
                Some(target) => match target.write(&value).await {
                    Ok(()) => GattStatus::SUCCESS,
                    Err(e) => {
                        debug!(error = %e, "Characteristic write failed");
                        GattStatus::FAILURE
                    }
                },
                None => GattStatus::FAILURE,
            };
            events.send(TransportEvent::WriteComplete { status });
        }));
    }

    fn disconnect(&mut self) {
        if self.disconnect_requested {
            return;
        }
        self.disconnect_requested = true;

        // Fire and forget: the teardown must outlive `release`.
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let device = self.device.clone();
        runtime.spawn(async move {
            if let Err(e) = device.disconnect().await {
                debug!(error = %e, "Disconnect request failed");
            }
        });
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.characteristics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for BluezSession {
    fn drop(&mut self) {
        self.release();
    }
}

//! Session manager for BLE central-role sessions.
//!
//! Owns the device registry, one [`Connection`] per device, the event bus and
//! the discovery controller. GATT calls are routed to the target device's
//! command queue; calls for devices without a live connection fail with
//! [`Error::NotConnected`] without touching any queue.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::connection::{Connection, ConnectionState};
use crate::ble::discovery::DiscoveryController;
use crate::ble::gatt::{Characteristic, Service};
use crate::ble::uuids::to_short_string;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::event_bus::{Event, EventBus, EventKind, ListenerId};
use crate::native::{AdapterInfo, BtleplugStack, NativeEvent, NativeStack};
use crate::queue::{Command, CommandKind, CommandOutput, PendingResult};
use crate::registry::{Device, DeviceRegistry};

/// Snapshot of the local adapter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdapterState {
    /// Adapter address or platform identifier.
    pub address: String,
    /// Adapter name.
    pub name: String,
    /// Whether the radio is powered.
    pub enabled: bool,
    /// Whether a scan is running.
    pub discovering: bool,
}

type ConnectionMap = Arc<RwLock<HashMap<String, Arc<Connection>>>>;

/// Central manager for discovery, connections and GATT traffic.
pub struct SessionManager {
    native: Arc<dyn NativeStack>,
    config: SessionConfig,
    registry: Arc<DeviceRegistry>,
    bus: Arc<EventBus>,
    discovery: Arc<DiscoveryController>,
    /// Connections by device address; entries are never removed.
    connections: ConnectionMap,
    /// Last adapter description seen, used to fill adapter events.
    adapter: Arc<RwLock<AdapterState>>,
    /// Native event pump.
    pump_handle: tokio::task::JoinHandle<()>,
}

impl SessionManager {
    /// Create a session manager on the first Bluetooth adapter of this system.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let stack = BtleplugStack::new().await?;
        Ok(Self::with_stack(Arc::new(stack), SessionConfig::default()))
    }

    /// Create a session manager over any native stack.
    ///
    /// Must be called from within a Tokio runtime: the native event pump is
    /// spawned immediately.
    pub fn with_stack(native: Arc<dyn NativeStack>, config: SessionConfig) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let bus = Arc::new(EventBus::new(config.event_capacity));
        let discovery = Arc::new(DiscoveryController::new(
            native.clone(),
            registry.clone(),
            bus.clone(),
            config.report_duplicates,
        ));
        let connections: ConnectionMap = Arc::new(RwLock::new(HashMap::new()));
        let adapter = Arc::new(RwLock::new(AdapterState {
            enabled: true,
            ..Default::default()
        }));

        let pump_handle = tokio::spawn(Self::pump_events(
            native.events(),
            discovery.clone(),
            connections.clone(),
            bus.clone(),
            adapter.clone(),
        ));

        Self {
            native,
            config,
            registry,
            bus,
            discovery,
            connections,
            adapter,
            pump_handle,
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // === Adapter ===

    /// Check whether a usable Bluetooth radio is present.
    pub async fn is_supported(&self) -> bool {
        self.native.adapter_info().await.is_ok()
    }

    /// Describe the local adapter.
    pub async fn adapter_state(&self) -> Result<AdapterState> {
        let info = self.native.adapter_info().await?;
        Ok(self.record_adapter(info))
    }

    fn record_adapter(&self, info: AdapterInfo) -> AdapterState {
        let state = AdapterState {
            address: info.address,
            name: info.name,
            enabled: info.enabled,
            discovering: self.discovery.is_scanning(),
        };
        *self.adapter.write() = state.clone();
        state
    }

    async fn publish_adapter_state(&self) {
        let state = match self.native.adapter_info().await {
            Ok(info) => self.record_adapter(info),
            Err(_) => AdapterState {
                discovering: self.discovery.is_scanning(),
                ..self.adapter.read().clone()
            },
        };
        self.bus.publish(Event::AdapterStateChanged(state));
    }

    // === Discovery ===

    /// Start scanning. Discovered devices are published as `deviceAdded`.
    pub async fn start_discovery(&self) -> Result<()> {
        if self.discovery.start().await? {
            self.publish_adapter_state().await;
        }
        Ok(())
    }

    /// Stop scanning. Stopping when not scanning is a no-op.
    pub async fn stop_discovery(&self) -> Result<()> {
        if self.discovery.stop().await? {
            self.publish_adapter_state().await;
        }
        Ok(())
    }

    /// Check if scanning is active.
    pub fn is_discovering(&self) -> bool {
        self.discovery.is_scanning()
    }

    // === Events ===

    /// Register a listener for an event.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.bus.on(kind, listener)
    }

    /// Remove one listener, or all listeners of `kind` when `id` is `None`.
    pub fn off(&self, kind: EventKind, id: Option<ListenerId>) -> usize {
        self.bus.off(kind, id)
    }

    /// Receive every event asynchronously.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    // === Devices ===

    /// Get a known device by address.
    pub fn device(&self, address: &str) -> Option<Device> {
        self.registry.get(address)
    }

    /// Get all known devices.
    pub fn devices(&self) -> Vec<Device> {
        self.registry.devices()
    }

    /// Get the nearest known device by signal strength.
    pub fn nearest_device(&self) -> Option<Device> {
        self.registry.devices_by_signal().into_iter().next()
    }

    // === Connections ===

    /// Connect to a device.
    ///
    /// # Errors
    ///
    /// - [`Error::InProgress`] if a connect or disconnect is already running
    /// - [`Error::ConnectionFailed`] if the radio rejects the connection
    pub async fn connect(&self, address: &str) -> Result<()> {
        info!("Connecting to {}", address);
        self.registry.get_or_insert(address);

        let connection = self
            .connections
            .write()
            .entry(address.to_string())
            .or_insert_with(|| {
                Connection::new(address, self.native.clone(), self.registry.clone())
            })
            .clone();

        connection
            .connect(self.config.connect_attempts, self.config.reconnect_delay)
            .await
    }

    /// Disconnect from a device, cancelling all of its pending commands.
    ///
    /// Concurrent calls share one native teardown.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if the device was never connected.
    pub async fn disconnect(&self, address: &str) -> Result<()> {
        info!("Disconnecting from {}", address);
        let connection = self.connection(address).ok_or(Error::NotConnected)?;
        connection.disconnect().await
    }

    /// Check if a device is connected.
    pub fn is_connected(&self, address: &str) -> bool {
        self.connection_state(address).is_connected()
    }

    /// Get the connection state of a device.
    pub fn connection_state(&self, address: &str) -> ConnectionState {
        self.connection(address)
            .map(|c| c.state())
            .unwrap_or_default()
    }

    fn connection(&self, address: &str) -> Option<Arc<Connection>> {
        self.connections.read().get(address).cloned()
    }

    // === GATT ===

    /// Queue a command without waiting for it.
    ///
    /// The command is in the device's queue when this returns; the handle
    /// resolves with its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if the device has no live connection.
    pub fn submit(&self, address: &str, command: Command) -> Result<PendingResult> {
        let connection = self.connection(address).ok_or(Error::NotConnected)?;
        connection.enqueue(command)
    }

    /// Queue a command and wait for its outcome.
    pub async fn execute(&self, address: &str, command: Command) -> Result<CommandOutput> {
        self.submit(address, command)?.await
    }

    /// Discover the services of a device.
    pub async fn services(&self, address: &str) -> Result<Vec<Service>> {
        match self.execute(address, Command::discover_services()).await? {
            CommandOutput::Services(services) => Ok(services),
            other => Err(unexpected(CommandKind::DiscoverServices, other)),
        }
    }

    /// Find one service of a device.
    pub async fn service(&self, address: &str, service: Uuid) -> Result<Service> {
        self.services(address)
            .await?
            .into_iter()
            .find(|s| s.uuid == service)
            .ok_or_else(|| Error::ServiceNotFound {
                uuid: to_short_string(&service),
            })
    }

    /// Discover the characteristics of a service.
    pub async fn characteristics(&self, address: &str, service: Uuid) -> Result<Vec<Characteristic>> {
        match self
            .execute(address, Command::discover_characteristics(service))
            .await?
        {
            CommandOutput::Characteristics(characteristics) => Ok(characteristics),
            other => Err(unexpected(CommandKind::DiscoverCharacteristics, other)),
        }
    }

    /// Find one characteristic of a service.
    pub async fn characteristic(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Characteristic> {
        self.characteristics(address, service)
            .await?
            .into_iter()
            .find(|c| c.uuid == characteristic)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: to_short_string(&characteristic),
            })
    }

    /// Read a characteristic value.
    pub async fn read_characteristic_value(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>> {
        match self
            .execute(address, Command::read(service, characteristic))
            .await?
        {
            CommandOutput::Value(value) => Ok(value),
            other => Err(unexpected(CommandKind::Read, other)),
        }
    }

    /// Write a characteristic value.
    ///
    /// # Arguments
    ///
    /// * `with_response` - Wait for the device's acknowledgement
    pub async fn write_characteristic_value(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        value: impl Into<Bytes>,
        with_response: bool,
    ) -> Result<()> {
        let command = Command::write(service, characteristic, value, with_response);
        self.execute(address, command).await.map(|_| ())
    }

    /// Enable notifications; values arrive as `characteristicValueChanged`.
    pub async fn start_characteristic_notifications(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        self.execute(address, Command::subscribe(service, characteristic))
            .await
            .map(|_| ())
    }

    /// Disable notifications.
    pub async fn stop_characteristic_notifications(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        self.execute(address, Command::unsubscribe(service, characteristic))
            .await
            .map(|_| ())
    }

    // === Lifecycle ===

    /// Stop scanning and disconnect every device.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down session manager");

        if let Err(e) = self.stop_discovery().await {
            warn!("Error stopping discovery: {}", e);
        }

        let connections: Vec<_> = self.connections.read().values().cloned().collect();
        for connection in connections {
            if connection.state() == ConnectionState::Disconnected {
                continue;
            }
            if let Err(e) = connection.disconnect().await {
                warn!("Error disconnecting {}: {}", connection.address(), e);
            }
        }

        Ok(())
    }

    /// Route native events to the registry, connections and the bus.
    async fn pump_events(
        mut events: broadcast::Receiver<NativeEvent>,
        discovery: Arc<DiscoveryController>,
        connections: ConnectionMap,
        bus: Arc<EventBus>,
        adapter: Arc<RwLock<AdapterState>>,
    ) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(missed)) => {
                    warn!("Native event pump lagged, {} event(s) dropped", missed);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            match event {
                NativeEvent::Advertisement(report) => discovery.handle_advertisement(&report),
                NativeEvent::AdapterStateChanged { enabled } => {
                    let state = {
                        let mut adapter = adapter.write();
                        adapter.enabled = enabled;
                        adapter.discovering = discovery.is_scanning();
                        adapter.clone()
                    };
                    info!("Adapter {}", if enabled { "powered on" } else { "powered off" });
                    bus.publish(Event::AdapterStateChanged(state));
                }
                NativeEvent::DeviceDisconnected { address, link } => {
                    let connection = connections.read().get(&address).cloned();
                    if connection.is_some_and(|c| c.handle_link_loss(link)) {
                        bus.publish(Event::DeviceDisconnected { address });
                    }
                }
                NativeEvent::ValueChanged {
                    address,
                    service,
                    characteristic,
                    value,
                } => {
                    let properties = connections
                        .read()
                        .get(&address)
                        .map(|c| c.cached_properties(&service, &characteristic))
                        .unwrap_or_default();
                    bus.publish(Event::CharacteristicValueChanged {
                        address,
                        characteristic: Characteristic {
                            uuid: characteristic,
                            service,
                            properties,
                            value,
                        },
                    });
                }
            }
        }

        debug!("Native event pump ended");
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.pump_handle.abort();
    }
}

fn unexpected(kind: CommandKind, output: CommandOutput) -> Error {
    Error::NativeFailure {
        reason: format!("unexpected result for {}: {:?}", kind, output),
    }
}

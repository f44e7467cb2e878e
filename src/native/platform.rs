//! btleplug-backed radio.
//!
//! Maps [`NativeStack`] onto the first adapter reported by btleplug. Devices
//! are addressed by their `PeripheralId` string, which is stable for the
//! lifetime of the process on every platform btleplug supports.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic as BtCharacteristic,
    Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::ble::advertising::AdvertisementReport;
use crate::ble::gatt::{Characteristic, Property, Service};
use crate::ble::uuids::to_short_string;
use crate::error::{Error, Result};
use crate::native::{AdapterInfo, LinkId, NativeEvent, NativeStack};
use crate::queue::{Command, CommandKind, CommandOutput};

type PeripheralMap = Arc<RwLock<HashMap<String, Peripheral>>>;
type LinkMap = Arc<RwLock<HashMap<String, LinkId>>>;

/// [`NativeStack`] over a btleplug adapter.
pub struct BtleplugStack {
    /// The BLE adapter in use.
    adapter: Adapter,
    /// Platform description of the adapter.
    adapter_name: String,
    /// Peripherals seen so far, by id string.
    peripherals: PeripheralMap,
    /// Links we consider up, by id string. Removed before a local teardown so
    /// the platform's echo of it is not reported as a link loss.
    live_links: LinkMap,
    /// Source of link ids.
    next_link: AtomicU64,
    /// Whether the adapter reports itself powered on.
    enabled: Arc<AtomicBool>,
    /// Channel for native events.
    event_tx: broadcast::Sender<NativeEvent>,
    /// Adapter event pump.
    event_handle: JoinHandle<()>,
    /// Notification forwarders, one per connected peripheral.
    notification_handles: RwLock<HashMap<String, JoinHandle<()>>>,
}

impl BtleplugStack {
    /// Open the first Bluetooth adapter of this system.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSupported`] if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.map_err(|e| Error::NotSupported {
            operation: format!("Bluetooth manager unavailable: {}", e),
        })?;

        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotSupported {
                operation: "no Bluetooth adapter".to_string(),
            })?;

        Self::with_adapter(adapter).await
    }

    /// Use a specific adapter.
    pub async fn with_adapter(adapter: Adapter) -> Result<Self> {
        let adapter_name = adapter
            .adapter_info()
            .await
            .unwrap_or_else(|_| "unknown adapter".to_string());
        info!("Using Bluetooth adapter: {}", adapter_name);

        let (event_tx, _) = broadcast::channel(256);
        let peripherals: PeripheralMap = Arc::new(RwLock::new(HashMap::new()));
        let live_links: LinkMap = Arc::new(RwLock::new(HashMap::new()));
        let enabled = Arc::new(AtomicBool::new(true));

        let mut events = adapter.events().await?;
        let event_handle = {
            let adapter = adapter.clone();
            let peripherals = peripherals.clone();
            let live_links = live_links.clone();
            let enabled = enabled.clone();
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    Self::handle_event(event, &adapter, &peripherals, &live_links, &enabled, &event_tx)
                        .await;
                }
                debug!("Adapter event stream ended");
            })
        };

        Ok(Self {
            adapter,
            adapter_name,
            peripherals,
            live_links,
            next_link: AtomicU64::new(0),
            enabled,
            event_tx,
            event_handle,
            notification_handles: RwLock::new(HashMap::new()),
        })
    }

    /// Handle a BLE central event.
    async fn handle_event(
        event: CentralEvent,
        adapter: &Adapter,
        peripherals: &PeripheralMap,
        live_links: &LinkMap,
        enabled: &AtomicBool,
        event_tx: &broadcast::Sender<NativeEvent>,
    ) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                trace!("Device seen: {:?}", id);
                Self::process_peripheral(adapter, id, peripherals, event_tx).await;
            }
            CentralEvent::DeviceConnected(id) => {
                debug!("Device connected: {:?}", id);
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
                Self::process_disconnect(adapter, id, live_links, event_tx).await;
            }
            CentralEvent::ManufacturerDataAdvertisement { id, .. }
            | CentralEvent::ServiceDataAdvertisement { id, .. }
            | CentralEvent::ServicesAdvertisement { id, .. } => {
                Self::process_peripheral(adapter, id, peripherals, event_tx).await;
            }
            CentralEvent::StateUpdate(state) => {
                let powered = matches!(state, CentralState::PoweredOn);
                enabled.store(powered, Ordering::SeqCst);
                let _ = event_tx.send(NativeEvent::AdapterStateChanged { enabled: powered });
            }
        }
    }

    /// Report the loss of a live link.
    ///
    /// Local teardowns have already retired their link, and a peripheral that
    /// is connected again by the time the event arrives belongs to a newer
    /// link; neither is reported.
    async fn process_disconnect(
        adapter: &Adapter,
        id: PeripheralId,
        live_links: &LinkMap,
        event_tx: &broadcast::Sender<NativeEvent>,
    ) {
        if let Ok(peripheral) = adapter.peripheral(&id).await {
            if peripheral.is_connected().await.unwrap_or(false) {
                debug!("Ignoring stale disconnect of {:?}, link is up again", id);
                return;
            }
        }

        let address = id.to_string();
        let Some(link) = live_links.write().remove(&address) else {
            debug!("Ignoring disconnect of {} with no live link", address);
            return;
        };

        let _ = event_tx.send(NativeEvent::DeviceDisconnected { address, link });
    }

    /// Turn a peripheral's advertised properties into a report.
    async fn process_peripheral(
        adapter: &Adapter,
        id: PeripheralId,
        peripherals: &PeripheralMap,
        event_tx: &broadcast::Sender<NativeEvent>,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        let address = id.to_string();
        let report = AdvertisementReport {
            address: address.clone(),
            name: properties.local_name,
            rssi: properties.rssi,
            services: properties.services,
            manufacturer_data: properties.manufacturer_data,
        };

        peripherals.write().insert(address, peripheral);
        let _ = event_tx.send(NativeEvent::Advertisement(report));
    }

    async fn peripheral(&self, address: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self.peripherals.read().get(address).cloned() {
            return Ok(peripheral);
        }

        let peripheral = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == address)
            .ok_or_else(|| Error::UnknownDevice {
                address: address.to_string(),
            })?;

        self.peripherals
            .write()
            .insert(address.to_string(), peripheral.clone());
        Ok(peripheral)
    }

    /// Forward value notifications of a connected peripheral.
    async fn start_notifications(&self, address: &str, peripheral: &Peripheral) -> Result<()> {
        let mut notifications = peripheral.notifications().await?;
        let peripheral = peripheral.clone();
        let event_tx = self.event_tx.clone();
        let owner = address.to_string();

        let handle = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let service = peripheral
                    .characteristics()
                    .into_iter()
                    .find(|c| c.uuid == notification.uuid)
                    .map(|c| c.service_uuid)
                    .unwrap_or_default();

                trace!(
                    "Notification from {} on {}: {} bytes",
                    owner,
                    notification.uuid,
                    notification.value.len()
                );

                let _ = event_tx.send(NativeEvent::ValueChanged {
                    address: owner.clone(),
                    service,
                    characteristic: notification.uuid,
                    value: notification.value,
                });
            }
            debug!("Notification listener for {} stopped", owner);
        });

        if let Some(previous) = self
            .notification_handles
            .write()
            .insert(address.to_string(), handle)
        {
            previous.abort();
        }
        Ok(())
    }

    fn stop_notifications(&self, address: &str) {
        if let Some(handle) = self.notification_handles.write().remove(address) {
            handle.abort();
        }
    }
}

fn find_characteristic(peripheral: &Peripheral, command: &Command) -> Result<BtCharacteristic> {
    let service = command.require_service()?;
    let uuid = command.require_characteristic()?;

    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid && c.service_uuid == service)
        .ok_or_else(|| Error::CharacteristicNotFound {
            uuid: to_short_string(&uuid),
        })
}

fn properties_from(flags: CharPropFlags) -> Vec<Property> {
    [
        (CharPropFlags::BROADCAST, Property::Broadcast),
        (CharPropFlags::READ, Property::Read),
        (CharPropFlags::WRITE_WITHOUT_RESPONSE, Property::WriteWithoutResponse),
        (CharPropFlags::WRITE, Property::Write),
        (CharPropFlags::NOTIFY, Property::Notify),
        (CharPropFlags::INDICATE, Property::Indicate),
        (
            CharPropFlags::AUTHENTICATED_SIGNED_WRITES,
            Property::AuthenticatedSignedWrites,
        ),
        (CharPropFlags::EXTENDED_PROPERTIES, Property::ExtendedProperties),
    ]
    .into_iter()
    .filter(|(flag, _)| flags.contains(*flag))
    .map(|(_, property)| property)
    .collect()
}

#[async_trait]
impl NativeStack for BtleplugStack {
    async fn adapter_info(&self) -> Result<AdapterInfo> {
        // btleplug only exposes a platform description, not the adapter address.
        Ok(AdapterInfo {
            address: String::new(),
            name: self.adapter_name.clone(),
            enabled: self.enabled.load(Ordering::SeqCst),
        })
    }

    async fn connect(&self, address: &str) -> Result<LinkId> {
        let peripheral = self.peripheral(address).await?;

        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral.connect().await?;
        } else {
            info!("Peripheral {} already connected at BLE level", address);
        }

        if let Err(e) = peripheral.discover_services().await {
            warn!("Failed to discover services on {}: {}", address, e);
        }

        self.start_notifications(address, &peripheral).await?;

        let link = self.next_link.fetch_add(1, Ordering::SeqCst) + 1;
        self.live_links.write().insert(address.to_string(), link);
        debug!("Link {} to {} up", link, address);
        Ok(link)
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        self.live_links.write().remove(address);
        self.stop_notifications(address);
        let peripheral = self.peripheral(address).await?;

        peripheral.disconnect().await.map_err(|e| {
            error!("Failed to disconnect {}: {}", address, e);
            Error::from(e)
        })
    }

    async fn dispatch(&self, address: &str, command: &Command) -> Result<CommandOutput> {
        let peripheral = self.peripheral(address).await?;

        match command.kind {
            CommandKind::DiscoverServices => {
                peripheral.discover_services().await?;
                let services = peripheral
                    .services()
                    .into_iter()
                    .enumerate()
                    .map(|(index, s)| Service::new(address, s.uuid, s.primary, index))
                    .collect();
                Ok(CommandOutput::Services(services))
            }
            CommandKind::DiscoverCharacteristics => {
                let service_uuid = command.require_service()?;
                if peripheral.services().is_empty() {
                    peripheral.discover_services().await?;
                }

                let service = peripheral
                    .services()
                    .into_iter()
                    .find(|s| s.uuid == service_uuid)
                    .ok_or_else(|| Error::ServiceNotFound {
                        uuid: to_short_string(&service_uuid),
                    })?;

                debug!(
                    "Service {} on {} has {} characteristic(s)",
                    service_uuid,
                    address,
                    service.characteristics.len()
                );

                let characteristics = service
                    .characteristics
                    .into_iter()
                    .map(|c| Characteristic {
                        uuid: c.uuid,
                        service: service_uuid,
                        properties: properties_from(c.properties),
                        value: Vec::new(),
                    })
                    .collect();
                Ok(CommandOutput::Characteristics(characteristics))
            }
            CommandKind::Read => {
                let characteristic = find_characteristic(&peripheral, command)?;
                let data = peripheral.read(&characteristic).await?;
                trace!("Read {} bytes from characteristic {}", data.len(), characteristic.uuid);
                Ok(CommandOutput::Value(data))
            }
            CommandKind::Write | CommandKind::WriteWithoutResponse => {
                let characteristic = find_characteristic(&peripheral, command)?;
                let write_type = if command.kind == CommandKind::Write {
                    WriteType::WithResponse
                } else {
                    WriteType::WithoutResponse
                };
                let data = command.payload.as_deref().unwrap_or_default();
                peripheral.write(&characteristic, data, write_type).await?;
                trace!("Wrote {} bytes to characteristic {}", data.len(), characteristic.uuid);
                Ok(CommandOutput::Done)
            }
            CommandKind::Subscribe => {
                let characteristic = find_characteristic(&peripheral, command)?;
                peripheral.subscribe(&characteristic).await?;
                debug!("Subscribed to notifications from {}", characteristic.uuid);
                Ok(CommandOutput::Done)
            }
            CommandKind::Unsubscribe => {
                let characteristic = find_characteristic(&peripheral, command)?;
                peripheral.unsubscribe(&characteristic).await?;
                debug!("Unsubscribed from notifications from {}", characteristic.uuid);
                Ok(CommandOutput::Done)
            }
        }
    }

    async fn start_scan(&self) -> Result<()> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<NativeEvent> {
        self.event_tx.subscribe()
    }
}

impl Drop for BtleplugStack {
    fn drop(&mut self) {
        self.event_handle.abort();
        for (_, handle) in self.notification_handles.write().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_from_flags() {
        let properties = properties_from(CharPropFlags::READ | CharPropFlags::NOTIFY);
        assert_eq!(properties, vec![Property::Read, Property::Notify]);

        let properties = properties_from(CharPropFlags::WRITE_WITHOUT_RESPONSE);
        assert_eq!(properties, vec![Property::WriteWithoutResponse]);
        assert!(properties_from(CharPropFlags::empty()).is_empty());
    }

    #[test]
    fn test_missing_target_is_invalid_parameter() {
        let command = Command::discover_services();
        assert!(matches!(
            command.require_characteristic(),
            Err(Error::InvalidParameter { .. })
        ));
    }
}

//! In-memory radio.
//!
//! [`SimulatedStack`] behaves like a small peripheral farm: it advertises,
//! accepts connections, stores written values and notifies subscribers. It
//! also exposes knobs for the situations hardware makes hard to reproduce:
//! failed connects, slow links, dispatches that stay in flight until
//! released, and unsolicited link loss.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::advertising::{self, AdvertisementReport};
use crate::ble::gatt::{Characteristic, Property, Service};
use crate::ble::uuids::*;
use crate::error::{Error, Result};
use crate::native::{AdapterInfo, LinkId, NativeEvent, NativeStack};
use crate::queue::{Command, CommandKind, CommandOutput};

/// A simulated characteristic.
#[derive(Debug, Clone)]
pub struct SimCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Supported operations.
    pub properties: Vec<Property>,
    /// Current value.
    pub value: Vec<u8>,
}

/// A simulated service.
#[derive(Debug, Clone)]
pub struct SimService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Whether the service is primary.
    pub primary: bool,
    /// Characteristics of the service.
    pub characteristics: Vec<SimCharacteristic>,
}

/// A simulated peripheral.
#[derive(Debug, Clone)]
pub struct SimPeripheral {
    /// Device address.
    pub address: String,
    /// Advertised name.
    pub name: Option<String>,
    /// Reported signal strength.
    pub rssi: i16,
    /// 16-bit service UUIDs put in the advertisement.
    pub advertised: Vec<u16>,
    /// GATT table.
    pub services: Vec<SimService>,
}

impl SimPeripheral {
    /// The BLE plugin test peripheral: a Heart Rate service with a notifying
    /// measurement, and a test service with one write-with-response and one
    /// write-without-response characteristic.
    pub fn ble_plugin_sim(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: Some("BlePluginSim".to_string()),
            rssi: -55,
            advertised: vec![0x180d, 0xfff0],
            services: vec![
                SimService {
                    uuid: HEART_RATE_SERVICE_UUID,
                    primary: true,
                    characteristics: vec![SimCharacteristic {
                        uuid: HEART_RATE_MEASUREMENT_UUID,
                        properties: vec![Property::Read, Property::Notify],
                        value: vec![0x00, 60],
                    }],
                },
                SimService {
                    uuid: TEST_SERVICE_UUID,
                    primary: true,
                    characteristics: vec![
                        SimCharacteristic {
                            uuid: TEST_WRITE_UUID,
                            properties: vec![Property::Read, Property::Write],
                            value: vec![0],
                        },
                        SimCharacteristic {
                            uuid: TEST_WRITE_NO_RESPONSE_UUID,
                            properties: vec![Property::Read, Property::WriteWithoutResponse],
                            value: vec![0],
                        },
                    ],
                },
            ],
        }
    }

    fn characteristic_mut(&mut self, service: Uuid, characteristic: Uuid) -> Result<&mut SimCharacteristic> {
        let service = self
            .services
            .iter_mut()
            .find(|s| s.uuid == service)
            .ok_or_else(|| Error::ServiceNotFound {
                uuid: to_short_string(&service),
            })?;
        service
            .characteristics
            .iter_mut()
            .find(|c| c.uuid == characteristic)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: to_short_string(&characteristic),
            })
    }
}

#[derive(Default)]
struct SimState {
    peripherals: HashMap<String, SimPeripheral>,
    connected: HashSet<String>,
    links: HashMap<String, LinkId>,
    next_link: LinkId,
    subscriptions: HashSet<(String, Uuid, Uuid)>,
    in_flight: HashMap<String, usize>,
    dispatch_log: Vec<(String, CommandKind)>,
}

type HeldDispatch = (String, oneshot::Sender<Result<()>>);

/// In-memory [`NativeStack`].
pub struct SimulatedStack {
    state: Mutex<SimState>,
    event_tx: broadcast::Sender<NativeEvent>,
    powered: AtomicBool,
    fail_next_connect: AtomicBool,
    hold_dispatches: AtomicBool,
    held: Mutex<VecDeque<HeldDispatch>>,
    connect_delay: RwLock<Duration>,
    disconnect_delay: RwLock<Duration>,
    disconnect_echo: RwLock<Option<Duration>>,
    native_connects: AtomicUsize,
    native_disconnects: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SimulatedStack {
    /// Create a stack hosting `peripherals`.
    pub fn new(peripherals: Vec<SimPeripheral>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let state = SimState {
            peripherals: peripherals
                .into_iter()
                .map(|p| (p.address.clone(), p))
                .collect(),
            ..Default::default()
        };

        Self {
            state: Mutex::new(state),
            event_tx,
            powered: AtomicBool::new(true),
            fail_next_connect: AtomicBool::new(false),
            hold_dispatches: AtomicBool::new(false),
            held: Mutex::new(VecDeque::new()),
            connect_delay: RwLock::new(Duration::ZERO),
            disconnect_delay: RwLock::new(Duration::ZERO),
            disconnect_echo: RwLock::new(None),
            native_connects: AtomicUsize::new(0),
            native_disconnects: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    // === Knobs ===

    /// Power the simulated adapter on or off.
    pub fn set_powered(&self, powered: bool) {
        self.powered.store(powered, Ordering::SeqCst);
        let _ = self
            .event_tx
            .send(NativeEvent::AdapterStateChanged { enabled: powered });
    }

    /// Make the next native connect fail.
    pub fn fail_next_connect(&self) {
        self.fail_next_connect.store(true, Ordering::SeqCst);
    }

    /// Delay every native connect.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.write() = delay;
    }

    /// Delay every native disconnect.
    pub fn set_disconnect_delay(&self, delay: Duration) {
        *self.disconnect_delay.write() = delay;
    }

    /// Also report local disconnects as link events, `delay` after the
    /// teardown, the way platform stacks do. `None` turns this off.
    pub fn set_disconnect_echo(&self, delay: Option<Duration>) {
        *self.disconnect_echo.write() = delay;
    }

    /// Keep dispatched commands in flight until [`release_next`](Self::release_next).
    pub fn set_hold_dispatches(&self, hold: bool) {
        self.hold_dispatches.store(hold, Ordering::SeqCst);
    }

    /// Let the oldest held dispatch run. Returns `false` if none is held.
    pub fn release_next(&self) -> bool {
        match self.held.lock().pop_front() {
            Some((_, release)) => {
                let _ = release.send(Ok(()));
                true
            }
            None => false,
        }
    }

    /// Number of dispatches waiting for release.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Drop the link to a device as if it went out of range.
    pub fn drop_link(&self, address: &str) {
        if let Some(link) = self.terminate_link(address) {
            let _ = self.event_tx.send(NativeEvent::DeviceDisconnected {
                address: address.to_string(),
                link,
            });
        }
    }

    /// Push a notification for a subscribed characteristic.
    ///
    /// Returns `false` if the device is not connected or not subscribed.
    pub fn notify(&self, address: &str, service: Uuid, characteristic: Uuid, value: Vec<u8>) -> bool {
        {
            let mut state = self.state.lock();
            let key = (address.to_string(), service, characteristic);
            if !state.connected.contains(address) || !state.subscriptions.contains(&key) {
                return false;
            }
            if let Some(peripheral) = state.peripherals.get_mut(address) {
                if let Ok(target) = peripheral.characteristic_mut(service, characteristic) {
                    target.value = value.clone();
                }
            }
        }

        let _ = self.event_tx.send(NativeEvent::ValueChanged {
            address: address.to_string(),
            service,
            characteristic,
            value,
        });
        true
    }

    // === Counters ===

    /// Native connects performed.
    pub fn native_connects(&self) -> usize {
        self.native_connects.load(Ordering::SeqCst)
    }

    /// Native disconnects performed.
    pub fn native_disconnects(&self) -> usize {
        self.native_disconnects.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous dispatches seen for any one device.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every dispatch received, in arrival order.
    pub fn dispatch_log(&self) -> Vec<(String, CommandKind)> {
        self.state.lock().dispatch_log.clone()
    }

    fn terminate_link(&self, address: &str) -> Option<LinkId> {
        let link = {
            let mut state = self.state.lock();
            state.connected.remove(address);
            state.subscriptions.retain(|(a, _, _)| a != address);
            state.links.remove(address)
        };

        let mut held = self.held.lock();
        let mut kept = VecDeque::with_capacity(held.len());
        for (held_address, release) in held.drain(..) {
            if held_address == address {
                let _ = release.send(Err(Error::NativeFailure {
                    reason: "link terminated".to_string(),
                }));
            } else {
                kept.push_back((held_address, release));
            }
        }
        *held = kept;
        link
    }

    async fn wait_for_release(&self, address: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.held.lock().push_back((address.to_string(), tx));
        rx.await.unwrap_or_else(|_| {
            Err(Error::NativeFailure {
                reason: "dispatch abandoned".to_string(),
            })
        })
    }

    fn execute(&self, address: &str, command: &Command) -> Result<CommandOutput> {
        let mut state = self.state.lock();
        if !state.connected.contains(address) {
            return Err(Error::NotConnected);
        }
        let peripheral = state
            .peripherals
            .get_mut(address)
            .ok_or_else(|| Error::UnknownDevice {
                address: address.to_string(),
            })?;

        let output = match command.kind {
            CommandKind::DiscoverServices => CommandOutput::Services(
                peripheral
                    .services
                    .iter()
                    .enumerate()
                    .map(|(index, s)| Service::new(address, s.uuid, s.primary, index))
                    .collect(),
            ),
            CommandKind::DiscoverCharacteristics => {
                let service_uuid = command.require_service()?;
                let service = peripheral
                    .services
                    .iter()
                    .find(|s| s.uuid == service_uuid)
                    .ok_or_else(|| Error::ServiceNotFound {
                        uuid: to_short_string(&service_uuid),
                    })?;
                CommandOutput::Characteristics(
                    service
                        .characteristics
                        .iter()
                        .map(|c| Characteristic {
                            uuid: c.uuid,
                            service: service_uuid,
                            properties: c.properties.clone(),
                            value: c.value.clone(),
                        })
                        .collect(),
                )
            }
            CommandKind::Read => {
                let target = peripheral
                    .characteristic_mut(command.require_service()?, command.require_characteristic()?)?;
                require(target, Property::Read)?;
                CommandOutput::Value(target.value.clone())
            }
            CommandKind::Write | CommandKind::WriteWithoutResponse => {
                let target = peripheral
                    .characteristic_mut(command.require_service()?, command.require_characteristic()?)?;
                let property = if command.kind == CommandKind::Write {
                    Property::Write
                } else {
                    Property::WriteWithoutResponse
                };
                require(target, property)?;
                target.value = command.payload.as_deref().unwrap_or_default().to_vec();
                CommandOutput::Done
            }
            CommandKind::Subscribe | CommandKind::Unsubscribe => {
                let service = command.require_service()?;
                let characteristic = command.require_characteristic()?;
                let target = peripheral.characteristic_mut(service, characteristic)?;
                if !target.properties.contains(&Property::Notify)
                    && !target.properties.contains(&Property::Indicate)
                {
                    return Err(Error::NativeFailure {
                        reason: format!("{} does not notify", to_short_string(&characteristic)),
                    });
                }

                let key = (address.to_string(), service, characteristic);
                if command.kind == CommandKind::Subscribe {
                    state.subscriptions.insert(key);
                } else {
                    state.subscriptions.remove(&key);
                }
                CommandOutput::Done
            }
        };

        Ok(output)
    }
}

fn require(characteristic: &SimCharacteristic, property: Property) -> Result<()> {
    if characteristic.properties.contains(&property) {
        Ok(())
    } else {
        Err(Error::NativeFailure {
            reason: format!(
                "{} not permitted on {}",
                property,
                to_short_string(&characteristic.uuid)
            ),
        })
    }
}

#[async_trait]
impl NativeStack for SimulatedStack {
    async fn adapter_info(&self) -> Result<AdapterInfo> {
        Ok(AdapterInfo {
            address: "00:00:5E:00:53:00".to_string(),
            name: "Simulated Adapter".to_string(),
            enabled: self.powered.load(Ordering::SeqCst),
        })
    }

    async fn connect(&self, address: &str) -> Result<LinkId> {
        let delay = *self.connect_delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.native_connects.fetch_add(1, Ordering::SeqCst);

        if !self.powered.load(Ordering::SeqCst) {
            return Err(Error::NotSupported {
                operation: "connect while powered off".to_string(),
            });
        }
        if self.fail_next_connect.swap(false, Ordering::SeqCst) {
            return Err(Error::NativeFailure {
                reason: "connection rejected by peer".to_string(),
            });
        }

        let mut state = self.state.lock();
        if !state.peripherals.contains_key(address) {
            return Err(Error::UnknownDevice {
                address: address.to_string(),
            });
        }
        state.next_link += 1;
        let link = state.next_link;
        state.connected.insert(address.to_string());
        state.links.insert(address.to_string(), link);
        debug!("Simulated link {} to {} up", link, address);
        Ok(link)
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        let delay = *self.disconnect_delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.native_disconnects.fetch_add(1, Ordering::SeqCst);
        let link = self.terminate_link(address);
        debug!("Simulated link to {} down", address);

        let echo = *self.disconnect_echo.read();
        if let (Some(delay), Some(link)) = (echo, link) {
            let event_tx = self.event_tx.clone();
            let address = address.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = event_tx.send(NativeEvent::DeviceDisconnected { address, link });
            });
        }
        Ok(())
    }

    async fn dispatch(&self, address: &str, command: &Command) -> Result<CommandOutput> {
        {
            let mut state = self.state.lock();
            state.dispatch_log.push((address.to_string(), command.kind));
            let in_flight = state.in_flight.entry(address.to_string()).or_insert(0);
            *in_flight += 1;
            self.max_in_flight.fetch_max(*in_flight, Ordering::SeqCst);
        }
        trace!("Simulated {} on {}", command.kind, address);

        let outcome = if self.hold_dispatches.load(Ordering::SeqCst) {
            match self.wait_for_release(address).await {
                Ok(()) => self.execute(address, command),
                Err(e) => Err(e),
            }
        } else {
            // Complete on a later poll, like a radio round trip.
            tokio::task::yield_now().await;
            self.execute(address, command)
        };

        if let Some(in_flight) = self.state.lock().in_flight.get_mut(address) {
            *in_flight = in_flight.saturating_sub(1);
        }
        outcome
    }

    async fn start_scan(&self) -> Result<()> {
        if !self.powered.load(Ordering::SeqCst) {
            return Err(Error::NotSupported {
                operation: "scan while powered off".to_string(),
            });
        }

        let peripherals: Vec<SimPeripheral> = self.state.lock().peripherals.values().cloned().collect();
        for peripheral in peripherals {
            let payload = advertising::encode(peripheral.name.as_deref(), &peripheral.advertised);
            match AdvertisementReport::parse(peripheral.address.clone(), Some(peripheral.rssi), &payload) {
                Ok(report) => {
                    let _ = self.event_tx.send(NativeEvent::Advertisement(report));
                }
                Err(e) => debug!("Dropping simulated advertisement: {}", e),
            }
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<NativeEvent> {
        self.event_tx.subscribe()
    }
}

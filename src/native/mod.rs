//! Boundary to the platform radio stack.
//!
//! The session manager only needs three things from a radio: run one GATT
//! operation and report exactly one outcome, connect/disconnect a device, and
//! stream asynchronous events. [`NativeStack`] captures that contract.

pub mod platform;
pub mod simulated;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ble::advertising::AdvertisementReport;
use crate::error::Result;
use crate::queue::{Command, CommandOutput};

pub use self::platform::BtleplugStack;
pub use self::simulated::{SimCharacteristic, SimPeripheral, SimService, SimulatedStack};

/// Identifies one established native link. Unique per device across reconnects.
pub type LinkId = u64;

/// Identity and power state of the local adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    /// Adapter address. Empty when the platform does not expose it.
    pub address: String,
    /// Human readable adapter name.
    pub name: String,
    /// Whether the radio is powered.
    pub enabled: bool,
}

/// Asynchronous event raised by the radio.
#[derive(Debug, Clone)]
pub enum NativeEvent {
    /// An advertisement was received.
    Advertisement(AdvertisementReport),
    /// The adapter was powered on or off.
    AdapterStateChanged {
        /// New power state.
        enabled: bool,
    },
    /// The link to a device dropped.
    DeviceDisconnected {
        /// Device address.
        address: String,
        /// The link that dropped, as returned by [`NativeStack::connect`].
        link: LinkId,
    },
    /// A subscribed characteristic notified a value.
    ValueChanged {
        /// Device address.
        address: String,
        /// Service containing the characteristic.
        service: Uuid,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Notified value.
        value: Vec<u8>,
    },
}

/// Platform radio contract.
///
/// Every method resolves exactly once. `dispatch` is only ever called with
/// one command in flight per address.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NativeStack: Send + Sync {
    /// Describe the local adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSupported`](crate::Error::NotSupported) if there is no usable radio.
    async fn adapter_info(&self) -> Result<AdapterInfo>;

    /// Establish a link to a device.
    ///
    /// Disconnect events for this link carry the returned id, so a late
    /// report about an earlier link can be told apart from the current one.
    async fn connect(&self, address: &str) -> Result<LinkId>;

    /// Tear down the link to a device. Best effort; always eventually returns.
    async fn disconnect(&self, address: &str) -> Result<()>;

    /// Execute one GATT command.
    async fn dispatch(&self, address: &str, command: &Command) -> Result<CommandOutput>;

    /// Start scanning for advertisements.
    async fn start_scan(&self) -> Result<()>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<()>;

    /// Receive radio events.
    fn events(&self) -> broadcast::Receiver<NativeEvent>;
}

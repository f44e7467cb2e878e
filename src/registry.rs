//! Known devices and their connection state.
//!
//! The registry is a keyed store. Every update takes the write lock once and
//! applies fully, so readers never observe a half-merged device.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};
use uuid::Uuid;

use crate::ble::advertising::AdvertisementReport;
use crate::ble::connection::ConnectionState;

/// A remote device known to this session.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Device {
    /// Platform address, stable for the session.
    pub address: String,
    /// Advertised name, if any.
    pub name: Option<String>,
    /// Last-seen signal strength in dBm.
    pub rssi: Option<i16>,
    /// Every service UUID the device has advertised.
    pub uuids: BTreeSet<Uuid>,
    /// Current connection state.
    pub state: ConnectionState,
    /// When the device was last heard from.
    pub last_seen: DateTime<Utc>,
}

impl Device {
    /// Create a record for an address with nothing else known.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
            rssi: None,
            uuids: BTreeSet::new(),
            state: ConnectionState::Disconnected,
            last_seen: Utc::now(),
        }
    }

    /// Fold an advertisement into this record.
    ///
    /// Names and signal strength are replaced when present; advertised
    /// services accumulate.
    pub fn merge(&mut self, report: &AdvertisementReport) {
        if let Some(name) = &report.name {
            self.name = Some(name.clone());
        }
        if report.rssi.is_some() {
            self.rssi = report.rssi;
        }
        self.uuids.extend(report.services.iter().copied());
        self.last_seen = Utc::now();
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }
}

/// Outcome of merging an advertisement.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Snapshot of the device after the merge.
    pub device: Device,
    /// Whether the device was seen for the first time.
    pub is_new: bool,
}

/// Keyed store of devices by address.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an advertisement, creating the device on first sight.
    ///
    /// Returns `None` for reports that do not identify a device.
    pub fn merge_advertisement(&self, report: &AdvertisementReport) -> Option<MergeOutcome> {
        if !report.is_well_formed() {
            debug!("Dropping advertisement without an address");
            return None;
        }

        let mut devices = self.devices.write();
        let is_new = !devices.contains_key(&report.address);
        let device = devices
            .entry(report.address.clone())
            .or_insert_with(|| Device::new(report.address.clone()));
        device.merge(report);

        if is_new {
            info!(
                "Discovered new device: {} ({})",
                report.address,
                device.name.as_deref().unwrap_or("unnamed")
            );
        }

        Some(MergeOutcome {
            device: device.clone(),
            is_new,
        })
    }

    /// Get a device, creating a bare record if the address is new.
    pub fn get_or_insert(&self, address: &str) -> Device {
        self.devices
            .write()
            .entry(address.to_string())
            .or_insert_with(|| Device::new(address))
            .clone()
    }

    /// Record a connection state change.
    pub fn set_state(&self, address: &str, state: ConnectionState) {
        self.devices
            .write()
            .entry(address.to_string())
            .or_insert_with(|| Device::new(address))
            .state = state;
    }

    /// Get a device by address.
    pub fn get(&self, address: &str) -> Option<Device> {
        self.devices.read().get(address).cloned()
    }

    /// Get all known devices.
    pub fn devices(&self) -> Vec<Device> {
        self.devices.read().values().cloned().collect()
    }

    /// Get all devices sorted by signal strength (strongest first).
    pub fn devices_by_signal(&self) -> Vec<Device> {
        let mut devices = self.devices();
        devices.sort_by_key(|d| std::cmp::Reverse(d.rssi.unwrap_or(i16::MIN)));
        devices
    }

    /// Get the number of known devices.
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Check if no devices are known.
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

//! GATT attribute records.
//!
//! Plain descriptions of services and characteristics as reported to callers.
//! They carry no handle into the native stack; every operation on them goes
//! back through the device's command queue.

use std::fmt;
use uuid::Uuid;

/// A GATT service discovered on a remote device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Service {
    /// Service UUID.
    pub uuid: Uuid,
    /// Whether this is a primary service.
    pub is_primary: bool,
    /// Identifier distinguishing multiple instances of the same UUID.
    pub instance_id: String,
    /// Address of the device that hosts the service.
    pub device_address: String,
}

impl Service {
    /// Build a service record, deriving the instance id from its position in
    /// the device's service table.
    pub fn new(device_address: &str, uuid: Uuid, is_primary: bool, index: usize) -> Self {
        Self {
            uuid,
            is_primary,
            instance_id: format!("{}/{}/{}", device_address, uuid, index),
            device_address: device_address.to_string(),
        }
    }
}

/// A GATT characteristic property bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Property {
    /// Value may be broadcast in advertisements.
    Broadcast,
    /// Value may be read.
    Read,
    /// Value may be written without a response.
    WriteWithoutResponse,
    /// Value may be written with a response.
    Write,
    /// Value changes are notified.
    Notify,
    /// Value changes are indicated (acknowledged notifications).
    Indicate,
    /// Signed writes are allowed.
    AuthenticatedSignedWrites,
    /// Extended properties descriptor is present.
    ExtendedProperties,
}

impl Property {
    /// Name of the property as exposed to event consumers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broadcast => "broadcast",
            Self::Read => "read",
            Self::WriteWithoutResponse => "writeWithoutResponse",
            Self::Write => "write",
            Self::Notify => "notify",
            Self::Indicate => "indicate",
            Self::AuthenticatedSignedWrites => "authenticatedSignedWrites",
            Self::ExtendedProperties => "extendedProperties",
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A GATT characteristic and its last known value.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Characteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// UUID of the service containing this characteristic.
    pub service: Uuid,
    /// Supported operations.
    pub properties: Vec<Property>,
    /// Last known value; empty until read or notified.
    pub value: Vec<u8>,
}

impl Characteristic {
    /// Check whether the characteristic supports a property.
    pub fn has_property(&self, property: Property) -> bool {
        self.properties.contains(&property)
    }

    /// Property names in declaration order.
    pub fn property_names(&self) -> Vec<&'static str> {
        self.properties.iter().map(Property::as_str).collect()
    }
}

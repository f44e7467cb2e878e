//! BLE Service and Characteristic UUIDs.
//!
//! Helpers for the Bluetooth SIG short forms (`"180d"`, `"2a37"`) and a few
//! well-known identifiers used by the simulated stack and the demos.

use uuid::Uuid;

use crate::error::{Error, Result};

/// The Bluetooth SIG base UUID (`0000xxxx-0000-1000-8000-00805f9b34fb`).
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x0000_0000_0000_1000_8000_00805f9b34fb);

/// Standard BLE Device Information Service UUID.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = short_uuid(0x180a);
/// Standard BLE Heart Rate Service UUID.
pub const HEART_RATE_SERVICE_UUID: Uuid = short_uuid(0x180d);
/// Heart Rate Measurement characteristic UUID (Notify).
pub const HEART_RATE_MEASUREMENT_UUID: Uuid = short_uuid(0x2a37);
/// Vendor test service exposed by the BLE plugin simulator.
pub const TEST_SERVICE_UUID: Uuid = short_uuid(0xfff0);
/// Test characteristic accepting writes with response.
pub const TEST_WRITE_UUID: Uuid = short_uuid(0xfff1);
/// Test characteristic accepting writes without response.
pub const TEST_WRITE_NO_RESPONSE_UUID: Uuid = short_uuid(0xfff2);

/// Expand a 16- or 32-bit SIG assigned number into a full UUID.
pub const fn short_uuid(value: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((value as u128) << 96))
}

/// Parse a UUID given either as a short form (`"180d"`, `"0000180d"`) or as a
/// full 128-bit string.
pub fn parse_uuid(input: &str) -> Result<Uuid> {
    let trimmed = input.trim();
    let invalid = || Error::InvalidParameter {
        name: "uuid".to_string(),
        value: input.to_string(),
    };

    match trimmed.len() {
        4 | 8 => u32::from_str_radix(trimmed, 16)
            .map(short_uuid)
            .map_err(|_| invalid()),
        _ => Uuid::parse_str(trimmed).map_err(|_| invalid()),
    }
}

/// Render a UUID in its shortest form: four hex digits for SIG UUIDs, the full
/// hyphenated string otherwise.
pub fn to_short_string(uuid: &Uuid) -> String {
    let value = uuid.as_u128();
    let assigned = (value >> 96) as u32;
    if value & !(0xffff_ffff_u128 << 96) == BLUETOOTH_BASE_UUID.as_u128() && assigned <= 0xffff {
        format!("{:04x}", assigned)
    } else {
        uuid.to_string()
    }
}

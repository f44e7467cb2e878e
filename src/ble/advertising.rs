//! Advertisement reports.
//!
//! A report is what the native stack tells us about one received
//! advertisement. Stacks that hand over raw advertising payloads can build a
//! report with [`AdvertisementReport::parse`], which decodes the standard AD
//! structures (length, type, data).

use std::collections::HashMap;
use uuid::Uuid;

use crate::ble::uuids::short_uuid;
use crate::error::{Error, Result};

/// AD type: incomplete list of 16-bit service UUIDs.
const AD_INCOMPLETE_UUID16: u8 = 0x02;
/// AD type: complete list of 16-bit service UUIDs.
const AD_COMPLETE_UUID16: u8 = 0x03;
/// AD type: incomplete list of 32-bit service UUIDs.
const AD_INCOMPLETE_UUID32: u8 = 0x04;
/// AD type: complete list of 32-bit service UUIDs.
const AD_COMPLETE_UUID32: u8 = 0x05;
/// AD type: incomplete list of 128-bit service UUIDs.
const AD_INCOMPLETE_UUID128: u8 = 0x06;
/// AD type: complete list of 128-bit service UUIDs.
const AD_COMPLETE_UUID128: u8 = 0x07;
/// AD type: shortened local name.
const AD_SHORT_NAME: u8 = 0x08;
/// AD type: complete local name.
const AD_COMPLETE_NAME: u8 = 0x09;
/// AD type: manufacturer specific data.
const AD_MANUFACTURER_DATA: u8 = 0xff;

/// One advertisement as seen by the radio.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdvertisementReport {
    /// Platform address of the advertiser.
    pub address: String,
    /// Advertised local name.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
    /// Manufacturer specific data by company identifier.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

impl AdvertisementReport {
    /// Create a report carrying only an address and signal strength.
    pub fn new(address: impl Into<String>, rssi: Option<i16>) -> Self {
        Self {
            address: address.into(),
            rssi,
            ..Default::default()
        }
    }

    /// Decode a raw advertising payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if an AD structure runs past the
    /// end of the payload or a UUID list has a ragged length.
    pub fn parse(address: impl Into<String>, rssi: Option<i16>, data: &[u8]) -> Result<Self> {
        let mut report = Self::new(address, rssi);
        let mut offset = 0;

        while offset < data.len() {
            let length = data[offset] as usize;
            if length == 0 {
                // Zero-length structure terminates significant data.
                break;
            }
            let end = offset + 1 + length;
            if end > data.len() {
                return Err(malformed(format!(
                    "AD structure at {} overruns payload of {} bytes",
                    offset,
                    data.len()
                )));
            }

            let ad_type = data[offset + 1];
            let value = &data[offset + 2..end];
            report.apply(ad_type, value)?;
            offset = end;
        }

        Ok(report)
    }

    fn apply(&mut self, ad_type: u8, value: &[u8]) -> Result<()> {
        match ad_type {
            AD_INCOMPLETE_UUID16 | AD_COMPLETE_UUID16 => {
                for chunk in exact_chunks(value, 2)? {
                    let assigned = u16::from_le_bytes([chunk[0], chunk[1]]);
                    self.services.push(short_uuid(assigned as u32));
                }
            }
            AD_INCOMPLETE_UUID32 | AD_COMPLETE_UUID32 => {
                for chunk in exact_chunks(value, 4)? {
                    let assigned = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    self.services.push(short_uuid(assigned));
                }
            }
            AD_INCOMPLETE_UUID128 | AD_COMPLETE_UUID128 => {
                for chunk in exact_chunks(value, 16)? {
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(chunk);
                    self.services.push(Uuid::from_bytes_le(bytes));
                }
            }
            AD_COMPLETE_NAME => {
                self.name = Some(String::from_utf8_lossy(value).into_owned());
            }
            AD_SHORT_NAME => {
                if self.name.is_none() {
                    self.name = Some(String::from_utf8_lossy(value).into_owned());
                }
            }
            AD_MANUFACTURER_DATA if value.len() >= 2 => {
                let company = u16::from_le_bytes([value[0], value[1]]);
                self.manufacturer_data.insert(company, value[2..].to_vec());
            }
            _ => {}
        }
        Ok(())
    }

    /// Check whether the report identifies a device at all.
    pub fn is_well_formed(&self) -> bool {
        !self.address.trim().is_empty()
    }
}

fn exact_chunks(value: &[u8], size: usize) -> Result<std::slice::ChunksExact<'_, u8>> {
    if value.len() % size != 0 {
        return Err(malformed(format!(
            "UUID list of {} bytes is not a multiple of {}",
            value.len(),
            size
        )));
    }
    Ok(value.chunks_exact(size))
}

fn malformed(context: String) -> Error {
    Error::InvalidParameter {
        name: "advertisement".to_string(),
        value: context,
    }
}

/// Largest payload one AD structure can carry: its length byte also counts
/// the type byte.
const MAX_AD_PAYLOAD: usize = u8::MAX as usize - 1;

/// Encode a minimal advertising payload (name, 16-bit service list).
///
/// Used by the simulated stack so that its reports travel the same decoding
/// path as raw payloads from hardware. Names and service lists that do not
/// fit one AD structure are truncated, names on a character boundary.
pub fn encode(name: Option<&str>, services16: &[u16]) -> Vec<u8> {
    let mut data = Vec::new();
    if !services16.is_empty() {
        let services = &services16[..services16.len().min(MAX_AD_PAYLOAD / 2)];
        data.push((1 + services.len() * 2) as u8);
        data.push(AD_COMPLETE_UUID16);
        for assigned in services {
            data.extend_from_slice(&assigned.to_le_bytes());
        }
    }
    if let Some(name) = name {
        let mut end = name.len().min(MAX_AD_PAYLOAD);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let bytes = &name.as_bytes()[..end];
        data.push((1 + bytes.len()) as u8);
        data.push(AD_COMPLETE_NAME);
        data.extend_from_slice(bytes);
    }
    data
}

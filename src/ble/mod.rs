//! BLE building blocks.
//!
//! Advertisement parsing, GATT value types, UUID helpers, per-device
//! connections and the discovery controller.

pub mod advertising;
pub mod connection;
pub mod discovery;
pub mod gatt;
pub mod uuids;

pub use advertising::AdvertisementReport;
pub use connection::{Connection, ConnectionState};
pub use discovery::DiscoveryController;
pub use gatt::{Characteristic, Property, Service};
pub use uuids::*;

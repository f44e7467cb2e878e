// Allow derivable impls for clarity
#![allow(clippy::derivable_impls)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-central
//!
//! An asynchronous Bluetooth Low Energy central-role session manager.
//!
//! The crate turns a callback-style radio into a small set of awaitable
//! calls: discover devices, connect, browse GATT services and
//! characteristics, read, write and subscribe. Every device gets its own
//! command queue so at most one GATT operation is in flight per device, and
//! a disconnect cancels everything still pending for that device before it
//! returns.
//!
//! ## Features
//!
//! - **Discovery**: `deviceAdded` events while scanning, with a registry of everything seen
//! - **Sessions**: Connect, disconnect and link-loss handling per device
//! - **Serialized GATT**: FIFO command queue with one in-flight operation per device
//! - **Events**: Synchronous listeners and a broadcast stream for async consumers
//! - **Simulation**: An in-memory radio for tests and demos
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_central::{uuids, Result, SessionManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = SessionManager::new().await?;
//!     manager.start_discovery().await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!     manager.stop_discovery().await?;
//!
//!     if let Some(device) = manager.nearest_device() {
//!         manager.connect(&device.address).await?;
//!
//!         for service in manager.services(&device.address).await? {
//!             println!("Service {}", uuids::to_short_string(&service.uuid));
//!         }
//!
//!         manager.disconnect(&device.address).await?;
//!     }
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod native;
pub mod queue;
pub mod registry;
pub mod session_manager;

// Re-exports for convenience
pub use config::SessionConfig;
pub use error::{Error, Result};
pub use event_bus::{Event, EventBus, EventKind, ListenerId};
pub use queue::{Command, CommandKind, CommandOutput, PendingResult};
pub use registry::{Device, DeviceRegistry};
pub use session_manager::{AdapterState, SessionManager};

// Re-export commonly used types from submodules
pub use ble::advertising::AdvertisementReport;
pub use ble::connection::ConnectionState;
pub use ble::gatt::{Characteristic, Property, Service};
pub use ble::uuids;
pub use native::{AdapterInfo, BtleplugStack, NativeEvent, NativeStack, SimulatedStack};

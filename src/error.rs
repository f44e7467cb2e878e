//! Error types for the ble-central crate.

use thiserror::Error;

/// The main error type for this crate.
///
/// Errors are `Clone` so a single outcome can be handed to every caller that
/// joined the same operation (for example concurrent `disconnect` calls).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Bluetooth is not available on this system, or the operation is not
    /// supported by the native stack.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// Operation requires a connection but the device is not connected.
    #[error("Device not connected")]
    NotConnected,

    /// A connect or disconnect for the same device is already running.
    #[error("Connection state change already in progress")]
    InProgress,

    /// The native stack rejected the connection attempt.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The command was drained from its queue by a disconnect.
    #[error("Command cancelled by disconnect")]
    Cancelled,

    /// The radio or the remote device rejected a dispatched command.
    #[error("Native failure: {reason}")]
    NativeFailure {
        /// The failure reported by the native stack.
        reason: String,
    },

    /// Reserved for watchdog policies layered on top of the session manager.
    #[error("Operation timed out")]
    Timeout,

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// The native stack has never seen a device with this address.
    #[error("Unknown device: {address}")]
    UnknownDevice {
        /// The address that was looked up.
        address: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },
}

impl From<btleplug::Error> for Error {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::NotConnected => Error::NotConnected,
            btleplug::Error::NotSupported(operation) => Error::NotSupported { operation },
            other => Error::NativeFailure {
                reason: other.to_string(),
            },
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for the pitprobe-ble crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The specified device was not found in the scan results.
    #[error("Device not found: {identifier}")]
    DeviceNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// The advertised name did not match any profile in the catalog.
    #[error("No profile matches advertised name: {name}")]
    ProfileUnmatched {
        /// The advertised name that failed to match.
        name: String,
    },

    /// Operation requires a connection but the device is not connected.
    #[error("Device not connected")]
    NotConnected,

    /// Failed to establish a connection to the device.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The connection to the device was lost.
    #[error("Connection lost")]
    ConnectionLost,

    /// A second connection attempt was made while one is already in flight.
    #[error("Connection attempt already in flight")]
    ConnectionInFlight,

    /// Service discovery did not find the profile's service.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// Characteristic discovery failed for the active profile.
    ///
    /// Carries a description of what was required and what was found so the
    /// failure surfaces to the caller instead of silently proceeding.
    #[error("Characteristic discovery failed: {context}")]
    CharacteristicDiscovery {
        /// What was required and what was actually discovered.
        context: String,
    },

    /// Invalid data was received from the device.
    #[error("Invalid data received: {context}")]
    InvalidData {
        /// Description of what was invalid about the data.
        context: String,
    },

    /// CRC check failed for a framed message.
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch {
        /// The expected CRC value.
        expected: u16,
        /// The actual CRC value received.
        actual: u16,
    },

    /// A tracked command did not receive a matching response in time.
    #[error("Command timeout: command {command:#04x}")]
    CommandTimeout {
        /// The command code that timed out.
        command: u8,
    },

    /// The device refused a command that requires authentication.
    #[error("Authentication refused by device {identifier}")]
    AuthenticationRefused {
        /// Identity of the refusing device.
        identifier: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

//! BLE communication module.
//!
//! Low-level Bluetooth Low Energy functionality: scanning with profile
//! matching, per-connection link management, and the vendor UUID tables.

pub mod connection;
pub mod scanner;
pub mod uuids;

pub use connection::{select_characteristics, DeviceLink, ResolvedCharacteristics};
pub use scanner::{DiscoveryEvent, ProbeScanner, ScannedDevice};
pub use uuids::*;

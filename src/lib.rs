// Allow holding locks across await points - we use parking_lot which is designed for this
#![allow(clippy::await_holding_lock)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # pitprobe-ble
//!
//! A cross-platform Rust library for talking to multi-vendor tire-temperature
//! probe thermometers via Bluetooth Low Energy.
//!
//! Several incompatible probe product lines share one low-energy transport
//! but disagree on everything above it: ASCII push notifications, 9-byte
//! SOH-framed polls, multi-block fragmented transfers with wake sequences
//! and checksums. This crate resolves the right protocol per device at
//! connect time and turns every vendor's byte stream into one uniform
//! temperature-sample stream.
//!
//! ## Features
//!
//! - **Profile catalog**: name-prefix matching with catalog-order precedence
//! - **Scanning**: advertisement filtering with identity-based dedupe
//! - **Characteristic selection**: UUID preference with capability fallback
//!   across vendor firmware revisions
//! - **Four protocol families**: continuous ASCII notify, single-frame SOH
//!   polled, wake/break polled, and multi-block fragmented with an
//!   authentication sub-flow
//! - **Unified streams**: one `TemperatureFrame` stream and one
//!   `ConnectionState` stream regardless of vendor
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pitprobe_ble::{AutoConnect, MemoryRegistry, Orchestrator, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let registry = Arc::new(MemoryRegistry::new());
//!     let engine = Orchestrator::new(registry).await?;
//!
//!     // Connect to the first probe we recognize.
//!     engine.set_auto_connect(AutoConnect {
//!         enabled: true,
//!         preferred: Default::default(),
//!     });
//!
//!     let mut frames = engine.subscribe_frames();
//!     engine.start_scanning().await?;
//!
//!     while let Ok(frame) = frames.recv().await {
//!         println!("{}: {:.1}°C", frame.device_id, frame.celsius);
//!     }
//!
//!     engine.shutdown().await?;
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
pub mod data;
pub mod device;
pub mod error;
pub mod orchestrator;
pub mod profile;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod utils;

// Re-exports for convenience
pub use data::TemperatureFrame;
pub use error::{Error, Result};
pub use orchestrator::{AutoConnect, ConnectionState, Orchestrator};
pub use profile::{match_profile, DeviceProfile, ProfileKey, PROFILES};
pub use registry::{DeviceRecord, DeviceRegistry, MemoryRegistry};
pub use utils::{celsius_to_fahrenheit, fahrenheit_to_celsius};

// Re-export commonly used types from submodules
pub use ble::connection::{DeviceLink, ResolvedCharacteristics};
pub use ble::scanner::{DiscoveryEvent, ProbeScanner, ScannedDevice};
pub use device::{DeviceEvent, DeviceProtocol, LinkAction};
pub use protocol::{CommandRouter, SohFrame};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<Orchestrator>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<TemperatureFrame>();
        let _ = std::any::TypeId::of::<ConnectionState>();
        let _ = std::any::TypeId::of::<DeviceProfile>();
        let _ = std::any::TypeId::of::<SohFrame>();
    }

    #[test]
    fn test_temperature_conversion() {
        assert!((celsius_to_fahrenheit(100.0) - 212.0).abs() < 0.001);
        assert!((fahrenheit_to_celsius(212.0) - 100.0).abs() < 0.001);
    }
}

//! BLE Service and Characteristic UUIDs.
//!
//! Contains the UUID constants for every supported probe vendor family.

use uuid::Uuid;

// Anritsu Meter surface probes (ASCII push over an HM-1x style serial module).
// The notify/write characteristics moved between module firmware revisions,
// so the alternates below are real fallbacks, not decoration.
/// Anritsu serial service UUID.
pub const ANRITSU_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_ffe0_0000_1000_8000_00805f9b34fb);
/// Anritsu notify characteristic UUID (current firmware).
pub const ANRITSU_NOTIFY_UUID: Uuid = Uuid::from_u128(0x0000_ffe4_0000_1000_8000_00805f9b34fb);
/// Anritsu write characteristic UUID (current firmware).
pub const ANRITSU_WRITE_UUID: Uuid = Uuid::from_u128(0x0000_ffe9_0000_1000_8000_00805f9b34fb);
/// Anritsu notify characteristic UUID (legacy firmware).
pub const ANRITSU_NOTIFY_ALT_UUID: Uuid = Uuid::from_u128(0x0000_ffe1_0000_1000_8000_00805f9b34fb);
/// Anritsu write characteristic UUID (legacy firmware).
pub const ANRITSU_WRITE_ALT_UUID: Uuid = Uuid::from_u128(0x0000_ffe3_0000_1000_8000_00805f9b34fb);

// T&D TR4x recorders (Nordic UART style serial service).
/// TR4x serial service UUID.
pub const TR4X_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e);
/// TR4x write characteristic UUID (central writes commands here).
pub const TR4X_WRITE_UUID: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e24dcca9e);
/// TR4x notify characteristic UUID (replies arrive here).
pub const TR4X_NOTIFY_UUID: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e24dcca9e);

// Chino MD8000 handheld thermometers (16-bit vendor block).
/// MD8000 service UUID.
pub const MD8000_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_ff00_0000_1000_8000_00805f9b34fb);
/// MD8000 notify characteristic UUID.
pub const MD8000_NOTIFY_UUID: Uuid = Uuid::from_u128(0x0000_ff01_0000_1000_8000_00805f9b34fb);
/// MD8000 write characteristic UUID.
pub const MD8000_WRITE_UUID: Uuid = Uuid::from_u128(0x0000_ff02_0000_1000_8000_00805f9b34fb);
/// MD8000 notify characteristic UUID on early units.
pub const MD8000_NOTIFY_ALT_UUID: Uuid = Uuid::from_u128(0x0000_ff03_0000_1000_8000_00805f9b34fb);
/// MD8000 write characteristic UUID on early units.
pub const MD8000_WRITE_ALT_UUID: Uuid = Uuid::from_u128(0x0000_ff04_0000_1000_8000_00805f9b34fb);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        let anritsu = ANRITSU_SERVICE_UUID.to_string();
        assert!(anritsu.contains("ffe0"));

        let tr4x = TR4X_SERVICE_UUID.to_string();
        assert!(tr4x.contains("6e400001"));

        let md8000 = MD8000_NOTIFY_UUID.to_string();
        assert!(md8000.contains("ff01"));
    }

    #[test]
    fn test_family_uuids_distinct() {
        assert_ne!(ANRITSU_SERVICE_UUID, TR4X_SERVICE_UUID);
        assert_ne!(TR4X_SERVICE_UUID, MD8000_SERVICE_UUID);
        assert_ne!(MD8000_NOTIFY_UUID, MD8000_WRITE_UUID);
    }
}

//! Per-device metadata lookup.
//!
//! The engine reads aliases and stored registration codes through this
//! collaborator and never writes it; persistence and editing belong to the
//! settings layer, which passes an implementation in at construction time.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Read-only lookup of per-device metadata, keyed by device identity.
pub trait DeviceRegistry: Send + Sync {
    /// Display alias for a device, if the user assigned one.
    fn alias(&self, device_id: &str) -> Option<String>;

    /// Stored registration code for a device requiring authentication.
    fn registration_code(&self, device_id: &str) -> Option<String>;
}

/// A registration code is well-formed when it is exactly 8 ASCII digits.
pub fn is_valid_registration_code(code: &str) -> bool {
    code.len() == 8 && code.bytes().all(|b| b.is_ascii_digit())
}

/// Parse a well-formed registration code into its wire form.
pub fn registration_code_to_u32(code: &str) -> Option<u32> {
    if !is_valid_registration_code(code) {
        return None;
    }
    code.parse::<u32>().ok()
}

/// Metadata stored for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRecord {
    /// User-assigned display alias.
    pub alias: Option<String>,
    /// Registration code for authenticated probes.
    pub registration_code: Option<String>,
}

/// In-memory registry, useful standalone and as the test double.
#[derive(Default)]
pub struct MemoryRegistry {
    entries: RwLock<HashMap<String, DeviceRecord>>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for a device.
    pub fn insert(&self, device_id: impl Into<String>, record: DeviceRecord) {
        self.entries.write().insert(device_id.into(), record);
    }

    /// Set the alias for a device, creating the record if needed.
    pub fn set_alias(&self, device_id: &str, alias: impl Into<String>) {
        self.entries
            .write()
            .entry(device_id.to_string())
            .or_default()
            .alias = Some(alias.into());
    }

    /// Set the registration code for a device, creating the record if needed.
    pub fn set_registration_code(&self, device_id: &str, code: impl Into<String>) {
        self.entries
            .write()
            .entry(device_id.to_string())
            .or_default()
            .registration_code = Some(code.into());
    }
}

impl DeviceRegistry for MemoryRegistry {
    fn alias(&self, device_id: &str) -> Option<String> {
        self.entries.read().get(device_id).and_then(|r| r.alias.clone())
    }

    fn registration_code(&self, device_id: &str) -> Option<String> {
        self.entries
            .read()
            .get(device_id)
            .and_then(|r| r.registration_code.clone())
    }
}

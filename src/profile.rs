//! Vendor profile catalog and advertised-name matching.
//!
//! Each supported probe product line is described by one immutable
//! [`DeviceProfile`]. Profiles are fixed at build time; everything the engine
//! needs to talk to a device — name matching rule, GATT identifiers, polling
//! behavior — is resolved from the catalog at scan time.

use uuid::Uuid;

use crate::ble::uuids::*;

/// Catalog key identifying one vendor protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProfileKey {
    /// Anritsu Meter surface probe (continuous ASCII notify).
    AnritsuMeter,
    /// T&D TR45 power-saving recorder (wake/break polled).
    Tr45,
    /// T&D TR4 recorder (single-frame polled).
    Tr4,
    /// Chino MD8000 handheld (multi-block fragmented).
    Md8000,
}

impl std::fmt::Display for ProfileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AnritsuMeter => write!(f, "anritsu"),
            Self::Tr45 => write!(f, "tr45"),
            Self::Tr4 => write!(f, "tr4"),
            Self::Md8000 => write!(f, "md8000"),
        }
    }
}

/// Immutable description of one vendor's device family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    /// Catalog key.
    pub key: ProfileKey,
    /// Advertised-name prefixes accepted for this profile.
    pub name_prefixes: &'static [&'static str],
    /// Primary service UUID.
    pub service_uuid: Uuid,
    /// Preferred notify characteristic UUID.
    pub notify_uuid: Uuid,
    /// Preferred write characteristic UUID.
    pub write_uuid: Uuid,
    /// Alternate notify UUIDs seen on other firmware revisions.
    pub alt_notify_uuids: &'static [Uuid],
    /// Alternate write UUIDs seen on other firmware revisions.
    pub alt_write_uuids: &'static [Uuid],
    /// Whether realtime data must be actively polled.
    pub requires_polling: bool,
}

/// The static profile catalog.
///
/// Order matters: it is the tie-break when prefixes overlap, so "TR45" must
/// stay ahead of the generic "TR4".
pub const PROFILES: &[DeviceProfile] = &[
    DeviceProfile {
        key: ProfileKey::AnritsuMeter,
        name_prefixes: &["AnritsuM-", "AnritsuMeter"],
        service_uuid: ANRITSU_SERVICE_UUID,
        notify_uuid: ANRITSU_NOTIFY_UUID,
        write_uuid: ANRITSU_WRITE_UUID,
        alt_notify_uuids: &[ANRITSU_NOTIFY_ALT_UUID],
        alt_write_uuids: &[ANRITSU_WRITE_ALT_UUID],
        requires_polling: false,
    },
    DeviceProfile {
        key: ProfileKey::Tr45,
        name_prefixes: &["TR45"],
        service_uuid: TR4X_SERVICE_UUID,
        notify_uuid: TR4X_NOTIFY_UUID,
        write_uuid: TR4X_WRITE_UUID,
        alt_notify_uuids: &[],
        alt_write_uuids: &[],
        requires_polling: true,
    },
    DeviceProfile {
        key: ProfileKey::Tr4,
        name_prefixes: &["TR4"],
        service_uuid: TR4X_SERVICE_UUID,
        notify_uuid: TR4X_NOTIFY_UUID,
        write_uuid: TR4X_WRITE_UUID,
        alt_notify_uuids: &[],
        alt_write_uuids: &[],
        requires_polling: true,
    },
    DeviceProfile {
        key: ProfileKey::Md8000,
        name_prefixes: &["MD8000", "MD8W"],
        service_uuid: MD8000_SERVICE_UUID,
        notify_uuid: MD8000_NOTIFY_UUID,
        write_uuid: MD8000_WRITE_UUID,
        alt_notify_uuids: &[MD8000_NOTIFY_ALT_UUID],
        alt_write_uuids: &[MD8000_WRITE_ALT_UUID],
        requires_polling: true,
    },
];

/// Resolve an advertised name against the catalog.
///
/// Returns the first entry whose prefix list contains a prefix of the name;
/// catalog order is the tie-break. No match means the advertisement is
/// ignored entirely.
pub fn match_profile(advertised_name: &str) -> Option<&'static DeviceProfile> {
    PROFILES.iter().find(|profile| {
        profile
            .name_prefixes
            .iter()
            .any(|prefix| advertised_name.starts_with(prefix))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_anritsu() {
        let profile = match_profile("AnritsuM-7").unwrap();
        assert_eq!(profile.key, ProfileKey::AnritsuMeter);
        assert!(!profile.requires_polling);
    }

    #[test]
    fn test_match_precedence_specific_before_generic() {
        // "TR45-001" must resolve to the TR45 profile, not the generic TR4,
        // because TR45 is listed first.
        let profile = match_profile("TR45-001").unwrap();
        assert_eq!(profile.key, ProfileKey::Tr45);

        let profile = match_profile("TR41-002").unwrap();
        assert_eq!(profile.key, ProfileKey::Tr4);
    }

    #[test]
    fn test_catalog_order_guards_overlap() {
        // Guard against reordering: every prefix that is itself prefixed by
        // another catalog prefix must come first.
        let tr45_pos = PROFILES.iter().position(|p| p.key == ProfileKey::Tr45);
        let tr4_pos = PROFILES.iter().position(|p| p.key == ProfileKey::Tr4);
        assert!(tr45_pos < tr4_pos);
    }

    #[test]
    fn test_no_match_is_ignored() {
        assert!(match_profile("JBL Flip 5").is_none());
        assert!(match_profile("").is_none());
    }

    #[test]
    fn test_match_md8000_aliases() {
        assert_eq!(match_profile("MD8000-12").unwrap().key, ProfileKey::Md8000);
        assert_eq!(match_profile("MD8W0034").unwrap().key, ProfileKey::Md8000);
    }
}

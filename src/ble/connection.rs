//! Per-connection link management.
//!
//! Drives the connect/discover sequence for one peripheral and holds the
//! characteristics resolved for the active profile. Characteristic
//! selection prefers the profile's declared UUIDs (including firmware
//! alternates) and falls back to capability bits, because vendor firmware
//! revisions expose slightly different characteristic sets.

use btleplug::api::{CharPropFlags, Characteristic, Peripheral as _, ValueNotification, WriteType};
use btleplug::platform::Peripheral;
use futures::stream::Stream;
use parking_lot::RwLock;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::profile::DeviceProfile;

/// The characteristics selected for the active profile.
#[derive(Debug, Clone)]
pub struct ResolvedCharacteristics {
    /// Characteristic the device pushes data on.
    pub notify: Characteristic,
    /// Characteristic commands are written to.
    pub write: Characteristic,
}

/// Pick a characteristic: exact UUID preference first (primary, then the
/// profile's alternates), then any characteristic with the required
/// capability, then a descriptive failure.
fn pick_characteristic(
    preferred: &[Uuid],
    required: CharPropFlags,
    candidates: &[Characteristic],
    what: &str,
) -> Result<Characteristic> {
    for uuid in preferred {
        if let Some(c) = candidates
            .iter()
            .find(|c| c.uuid == *uuid && c.properties.intersects(required))
        {
            return Ok(c.clone());
        }
    }

    // Firmware revision with unexpected UUIDs: fall back to the first
    // characteristic that can do the job.
    if let Some(c) = candidates.iter().find(|c| c.properties.intersects(required)) {
        warn!(
            "No exact {} match; falling back to {} by capability",
            what, c.uuid
        );
        return Ok(c.clone());
    }

    let found: Vec<String> = candidates
        .iter()
        .map(|c| format!("{} ({:?})", c.uuid, c.properties))
        .collect();
    Err(Error::CharacteristicDiscovery {
        context: format!(
            "no {} characteristic with {:?}; preferred {:?}, found [{}]",
            what,
            required,
            preferred,
            found.join(", ")
        ),
    })
}

/// Run the selection algorithm for a profile over the discovered
/// characteristics.
pub fn select_characteristics(
    profile: &DeviceProfile,
    characteristics: &[Characteristic],
) -> Result<ResolvedCharacteristics> {
    let on_service: Vec<Characteristic> = characteristics
        .iter()
        .filter(|c| c.service_uuid == profile.service_uuid)
        .cloned()
        .collect();

    if on_service.is_empty() {
        return Err(Error::ServiceNotFound {
            uuid: profile.service_uuid.to_string(),
        });
    }

    let mut notify_preference = vec![profile.notify_uuid];
    notify_preference.extend_from_slice(profile.alt_notify_uuids);
    let notify = pick_characteristic(
        &notify_preference,
        CharPropFlags::NOTIFY | CharPropFlags::INDICATE,
        &on_service,
        "notify",
    )?;

    let mut write_preference = vec![profile.write_uuid];
    write_preference.extend_from_slice(profile.alt_write_uuids);
    let write = pick_characteristic(
        &write_preference,
        CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE,
        &on_service,
        "write",
    )?;

    Ok(ResolvedCharacteristics { notify, write })
}

/// Manages one connection: connect with retries, service/characteristic
/// discovery, notification subscription, and writes.
pub struct DeviceLink {
    peripheral: Peripheral,
    profile: &'static DeviceProfile,
    resolved: RwLock<Option<ResolvedCharacteristics>>,
    /// Ensures the notify subscription is enabled exactly once.
    notify_enabled: AtomicBool,
    max_connect_attempts: u32,
    connect_retry_delay: Duration,
}

impl DeviceLink {
    /// Create a link for a peripheral resolved to a profile.
    pub fn new(peripheral: Peripheral, profile: &'static DeviceProfile) -> Self {
        Self {
            peripheral,
            profile,
            resolved: RwLock::new(None),
            notify_enabled: AtomicBool::new(false),
            max_connect_attempts: 3,
            connect_retry_delay: Duration::from_secs(1),
        }
    }

    /// The profile this link speaks.
    pub fn profile(&self) -> &'static DeviceProfile {
        self.profile
    }

    /// Attempt to connect, retrying on transient failures.
    pub async fn connect(&self) -> Result<()> {
        if self.peripheral.is_connected().await.unwrap_or(false) {
            info!("Peripheral already connected at BLE level");
            return Ok(());
        }

        let mut attempts = 0;
        while attempts < self.max_connect_attempts {
            attempts += 1;
            debug!(
                "Connection attempt {} of {}",
                attempts, self.max_connect_attempts
            );

            match self.peripheral.connect().await {
                Ok(_) => {
                    info!("Connected");
                    return Ok(());
                }
                Err(e) => {
                    warn!("Connection attempt {} failed: {}", attempts, e);
                    if attempts < self.max_connect_attempts {
                        tokio::time::sleep(self.connect_retry_delay).await;
                    }
                }
            }
        }

        Err(Error::ConnectionFailed {
            reason: format!("failed after {} attempts", self.max_connect_attempts),
        })
    }

    /// Discover services and select the profile's characteristics.
    pub async fn discover(&self) -> Result<()> {
        self.peripheral
            .discover_services()
            .await
            .map_err(Error::Bluetooth)?;

        let characteristics: Vec<Characteristic> = self
            .peripheral
            .services()
            .into_iter()
            .flat_map(|s| s.characteristics)
            .collect();

        debug!("Discovered {} characteristics", characteristics.len());

        let resolved = select_characteristics(self.profile, &characteristics)?;
        info!(
            "Resolved notify={} write={} for {} profile",
            resolved.notify.uuid, resolved.write.uuid, self.profile.key
        );
        *self.resolved.write() = Some(resolved);

        Ok(())
    }

    /// The resolved characteristics, once discovery succeeded.
    pub fn resolved(&self) -> Option<ResolvedCharacteristics> {
        self.resolved.read().clone()
    }

    /// UUID of the resolved notify characteristic.
    pub fn notify_uuid(&self) -> Option<Uuid> {
        self.resolved.read().as_ref().map(|r| r.notify.uuid)
    }

    /// Enable the notify subscription. Idempotent: the transport call is
    /// made exactly once per connection.
    pub async fn enable_notify(&self) -> Result<()> {
        let resolved = self.resolved.read().clone().ok_or(Error::NotConnected)?;

        if self
            .notify_enabled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Notify already enabled");
            return Ok(());
        }

        match self.peripheral.subscribe(&resolved.notify).await {
            Ok(_) => {
                debug!("Subscribed to {}", resolved.notify.uuid);
                Ok(())
            }
            Err(e) => {
                self.notify_enabled.store(false, Ordering::SeqCst);
                Err(Error::Bluetooth(e))
            }
        }
    }

    /// Whether the notify subscription is active.
    pub fn notify_enabled(&self) -> bool {
        self.notify_enabled.load(Ordering::SeqCst)
    }

    /// Write to the resolved write characteristic.
    pub async fn write(&self, bytes: &[u8], with_response: bool) -> Result<()> {
        let resolved = self.resolved.read().clone().ok_or(Error::NotConnected)?;

        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        self.peripheral
            .write(&resolved.write, bytes, write_type)
            .await
            .map_err(Error::Bluetooth)?;

        Ok(())
    }

    /// The peripheral's notification stream.
    pub async fn notifications(
        &self,
    ) -> Result<Pin<Box<dyn Stream<Item = ValueNotification> + Send>>> {
        self.peripheral.notifications().await.map_err(Error::Bluetooth)
    }

    /// Whether the BLE link is up.
    pub async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    /// Disconnect and clear per-connection state.
    pub async fn disconnect(&self) -> Result<()> {
        self.notify_enabled.store(false, Ordering::SeqCst);
        *self.resolved.write() = None;

        match self.peripheral.disconnect().await {
            Ok(_) => {
                info!("Disconnected");
                Ok(())
            }
            Err(e) => {
                warn!("Disconnect failed: {}", e);
                Err(Error::Bluetooth(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::*;
    use crate::profile::{match_profile, PROFILES};
    use std::collections::BTreeSet;

    fn characteristic(uuid: Uuid, service_uuid: Uuid, properties: CharPropFlags) -> Characteristic {
        Characteristic {
            uuid,
            service_uuid,
            properties,
            descriptors: BTreeSet::new(),
        }
    }

    fn anritsu() -> &'static DeviceProfile {
        match_profile("AnritsuM-7").unwrap()
    }

    #[test]
    fn test_exact_match_preferred() {
        let chars = vec![
            characteristic(
                ANRITSU_NOTIFY_ALT_UUID,
                ANRITSU_SERVICE_UUID,
                CharPropFlags::NOTIFY,
            ),
            characteristic(
                ANRITSU_NOTIFY_UUID,
                ANRITSU_SERVICE_UUID,
                CharPropFlags::NOTIFY,
            ),
            characteristic(
                ANRITSU_WRITE_UUID,
                ANRITSU_SERVICE_UUID,
                CharPropFlags::WRITE_WITHOUT_RESPONSE,
            ),
        ];

        let resolved = select_characteristics(anritsu(), &chars).unwrap();
        assert_eq!(resolved.notify.uuid, ANRITSU_NOTIFY_UUID);
        assert_eq!(resolved.write.uuid, ANRITSU_WRITE_UUID);
    }

    #[test]
    fn test_exact_match_requires_capability() {
        // The preferred UUID exists but cannot notify; the alternate can.
        let chars = vec![
            characteristic(
                ANRITSU_NOTIFY_UUID,
                ANRITSU_SERVICE_UUID,
                CharPropFlags::READ,
            ),
            characteristic(
                ANRITSU_NOTIFY_ALT_UUID,
                ANRITSU_SERVICE_UUID,
                CharPropFlags::INDICATE,
            ),
            characteristic(
                ANRITSU_WRITE_UUID,
                ANRITSU_SERVICE_UUID,
                CharPropFlags::WRITE,
            ),
        ];

        let resolved = select_characteristics(anritsu(), &chars).unwrap();
        assert_eq!(resolved.notify.uuid, ANRITSU_NOTIFY_ALT_UUID);
    }

    #[test]
    fn test_fallback_by_capability() {
        // Unknown firmware: UUIDs match nothing declared, capabilities do.
        let stranger = Uuid::from_u128(0x0000_dead_0000_1000_8000_00805f9b34fb);
        let stranger2 = Uuid::from_u128(0x0000_beef_0000_1000_8000_00805f9b34fb);
        let chars = vec![
            characteristic(stranger, ANRITSU_SERVICE_UUID, CharPropFlags::NOTIFY),
            characteristic(
                stranger2,
                ANRITSU_SERVICE_UUID,
                CharPropFlags::WRITE_WITHOUT_RESPONSE,
            ),
        ];

        let resolved = select_characteristics(anritsu(), &chars).unwrap();
        assert_eq!(resolved.notify.uuid, stranger);
        assert_eq!(resolved.write.uuid, stranger2);
    }

    #[test]
    fn test_no_capability_fails_descriptively() {
        // A read-only characteristic set must fail discovery, not proceed.
        let chars = vec![characteristic(
            ANRITSU_NOTIFY_UUID,
            ANRITSU_SERVICE_UUID,
            CharPropFlags::READ,
        )];

        let err = select_characteristics(anritsu(), &chars).unwrap_err();
        match err {
            Error::CharacteristicDiscovery { context } => {
                assert!(context.contains("notify"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_wrong_service_fails() {
        let chars = vec![characteristic(
            TR4X_NOTIFY_UUID,
            TR4X_SERVICE_UUID,
            CharPropFlags::NOTIFY,
        )];

        assert!(matches!(
            select_characteristics(anritsu(), &chars),
            Err(Error::ServiceNotFound { .. })
        ));
    }

    #[test]
    fn test_selection_works_for_every_profile() {
        for profile in PROFILES {
            let chars = vec![
                characteristic(
                    profile.notify_uuid,
                    profile.service_uuid,
                    CharPropFlags::NOTIFY,
                ),
                characteristic(
                    profile.write_uuid,
                    profile.service_uuid,
                    CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE,
                ),
            ];
            let resolved = select_characteristics(profile, &chars).unwrap();
            assert_eq!(resolved.notify.uuid, profile.notify_uuid);
            assert_eq!(resolved.write.uuid, profile.write_uuid);
        }
    }
}

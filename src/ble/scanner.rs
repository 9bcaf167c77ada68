//! BLE scanning functionality.
//!
//! Observes advertisements, resolves them against the profile catalog, and
//! emits discovery events. Advertisements whose name matches no profile are
//! ignored entirely; they never reach the consumer.

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace};

use crate::error::{Error, Result};
use crate::profile::{match_profile, DeviceProfile};

/// A probe seen during scanning.
///
/// Created on first sighting; name, signal strength, and last-seen are
/// refreshed in place on every subsequent sighting of the same identity.
#[derive(Debug, Clone)]
pub struct ScannedDevice {
    /// Transport-assigned peripheral identity.
    pub identifier: String,
    /// Advertised name that matched the profile.
    pub name: String,
    /// Signal strength in dBm, when reported.
    pub rssi: Option<i16>,
    /// When the device was last seen.
    pub last_seen: Instant,
    /// The catalog profile this device resolved to.
    pub profile: &'static DeviceProfile,
    /// User alias, attached by the orchestrator when the registry has one.
    pub alias: Option<String>,
}

/// Event emitted when a matching device is discovered or refreshed.
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    /// The resolved device.
    pub device: ScannedDevice,
    /// The peripheral handle for a later connection attempt.
    pub peripheral: Peripheral,
}

/// BLE scanner for discovering supported probes.
pub struct ProbeScanner {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
    /// Whether scanning is currently active.
    is_scanning: Arc<RwLock<bool>>,
    /// Discovered devices by identity.
    discovered: Arc<RwLock<HashMap<String, DiscoveryEvent>>>,
    /// Channel for discovery events.
    event_tx: broadcast::Sender<DiscoveryEvent>,
    /// Handle to the scanning task.
    scan_handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
}

impl ProbeScanner {
    /// Create a new scanner on the first available adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Create a new scanner with a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            adapter,
            is_scanning: Arc::new(RwLock::new(false)),
            discovered: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            scan_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Start continuous advertisement observation.
    ///
    /// # Errors
    ///
    /// Returns an error if scanning cannot be started.
    pub async fn start(&self) -> Result<()> {
        if *self.is_scanning.read() {
            debug!("Already scanning, ignoring start request");
            return Ok(());
        }

        info!("Starting BLE scan for known probe profiles");

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(Error::Bluetooth)?;

        *self.is_scanning.write() = true;

        let adapter = self.adapter.clone();
        let is_scanning = self.is_scanning.clone();
        let discovered = self.discovered.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get adapter events: {}", e);
                    return;
                }
            };

            while *is_scanning.read() {
                tokio::select! {
                    Some(event) = events.next() => {
                        Self::handle_event(event, &adapter, &discovered, &event_tx).await;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {
                        if !*is_scanning.read() {
                            break;
                        }
                    }
                }
            }

            debug!("Scan event loop ended");
        });

        *self.scan_handle.write() = Some(handle);

        Ok(())
    }

    /// Stop observation and discard the scan results.
    ///
    /// Events already queued on the broadcast channel are still delivered;
    /// no new ones are produced after this returns.
    pub async fn stop(&self) -> Result<()> {
        if !*self.is_scanning.read() {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE scan");

        *self.is_scanning.write() = false;

        self.adapter.stop_scan().await.map_err(Error::Bluetooth)?;

        let handle = self.scan_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.discovered.write().clear();

        Ok(())
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        *self.is_scanning.read()
    }

    /// Snapshot of the discovered devices.
    pub fn discovered_devices(&self) -> HashMap<String, DiscoveryEvent> {
        self.discovered.read().clone()
    }

    /// Subscribe to discovery events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.event_tx.subscribe()
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Handle a BLE central event.
    async fn handle_event(
        event: btleplug::api::CentralEvent,
        adapter: &Adapter,
        discovered: &Arc<RwLock<HashMap<String, DiscoveryEvent>>>,
        event_tx: &broadcast::Sender<DiscoveryEvent>,
    ) {
        use btleplug::api::CentralEvent;

        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                trace!("Device sighting: {:?}", id);
                Self::process_peripheral(adapter, id, discovered, event_tx).await;
            }
            CentralEvent::DeviceConnected(id) => {
                debug!("Device connected: {:?}", id);
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
            }
            _ => {}
        }
    }

    /// Process a sighted peripheral: match it against the catalog and emit
    /// or refresh its entry.
    async fn process_peripheral(
        adapter: &Adapter,
        id: btleplug::platform::PeripheralId,
        discovered: &Arc<RwLock<HashMap<String, DiscoveryEvent>>>,
        event_tx: &broadcast::Sender<DiscoveryEvent>,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        let name = match properties.local_name {
            Some(name) => name,
            None => return,
        };

        // No profile match means the advertisement is ignored entirely.
        let profile = match match_profile(&name) {
            Some(profile) => profile,
            None => {
                trace!("Ignoring unmatched advertisement: {}", name);
                return;
            }
        };

        let identifier = id.to_string();

        // Dedupe by identity: a repeat sighting refreshes the entry in
        // place rather than creating a new one.
        let event = {
            let mut map = discovered.write();
            match map.get_mut(&identifier) {
                Some(existing) => {
                    existing.device.name = name;
                    existing.device.rssi = properties.rssi;
                    existing.device.last_seen = Instant::now();
                    existing.clone()
                }
                None => {
                    debug!("Discovered {} ({} profile)", name, profile.key);
                    let event = DiscoveryEvent {
                        device: ScannedDevice {
                            identifier: identifier.clone(),
                            name,
                            rssi: properties.rssi,
                            last_seen: Instant::now(),
                            profile,
                            alias: None,
                        },
                        peripheral,
                    };
                    map.insert(identifier, event.clone());
                    event
                }
            }
        };

        let _ = event_tx.send(event);
    }
}

impl Drop for ProbeScanner {
    fn drop(&mut self) {
        *self.is_scanning.write() = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_event_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<DiscoveryEvent>();
        assert_clone::<ScannedDevice>();
    }
}

//! Connection orchestration.
//!
//! Owns the scanner, drives scan→match→connect→discover→ready→measure, and
//! republishes the unified temperature and connection-state streams.
//! Exactly one connection attempt is in flight at a time; tearing a
//! connection down cancels its poll timer, discards its buffers, and fails
//! its pending commands immediately.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::ble::connection::DeviceLink;
use crate::ble::scanner::{DiscoveryEvent, ProbeScanner, ScannedDevice};
use crate::data::TemperatureFrame;
use crate::device::{protocol_for, DeviceEvent, DeviceProtocol, LinkAction, ProtocolOutput};
use crate::error::{Error, Result};
use crate::protocol::accumulator::NotifyRate;
use crate::registry::DeviceRegistry;
use crate::scheduler::{spawn_interval, ScheduleHandle};

/// Poll cadence for profiles that require active polling.
const POLL_PERIOD: Duration = Duration::from_secs(1);
/// How often the watchdog probes the link.
const WATCHDOG_PERIOD: Duration = Duration::from_secs(3);

/// Engine connection state, observed by external consumers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Nothing happening.
    #[default]
    Idle,
    /// Observing advertisements.
    Scanning,
    /// Connection attempt in progress.
    Connecting,
    /// Connected, characteristics resolved, realtime data flowing.
    Ready,
    /// A stage failed; carries a human-readable cause.
    Failed(String),
}

impl ConnectionState {
    /// Check if realtime data can flow.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if a fresh scan may be started from this state.
    pub fn can_start_scanning(&self) -> bool {
        matches!(self, Self::Idle | Self::Failed(_))
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed(reason) => write!(f, "Failed: {}", reason),
        }
    }
}

/// Auto-connect policy.
#[derive(Debug, Clone, Default)]
pub struct AutoConnect {
    /// Whether discoveries may trigger a connection without user selection.
    pub enabled: bool,
    /// Identities allowed to auto-connect. Empty means "first match".
    pub preferred: HashSet<String>,
}

/// Decide whether a discovery should trigger an automatic connection.
fn should_auto_connect(policy: &AutoConnect, device_id: &str, in_flight: bool) -> bool {
    policy.enabled
        && !in_flight
        && (policy.preferred.is_empty() || policy.preferred.contains(device_id))
}

/// Everything one live connection's tasks need.
#[derive(Clone)]
struct ConnectionCtx {
    device_id: String,
    link: Arc<DeviceLink>,
    protocol: Arc<Mutex<Box<dyn DeviceProtocol>>>,
    frame_tx: broadcast::Sender<TemperatureFrame>,
    state: Arc<RwLock<ConnectionState>>,
    state_tx: broadcast::Sender<ConnectionState>,
}

/// State held for the active connection.
struct ActiveConnection {
    device_id: String,
    link: Arc<DeviceLink>,
    protocol: Arc<Mutex<Box<dyn DeviceProtocol>>>,
    poll: Option<ScheduleHandle>,
    notify_task: tokio::task::JoinHandle<()>,
    watchdog: tokio::task::JoinHandle<()>,
}

/// Publish a state change on the consumer-facing channel.
fn publish_state(
    state: &RwLock<ConnectionState>,
    tx: &broadcast::Sender<ConnectionState>,
    new_state: ConnectionState,
) {
    let changed = {
        let mut current = state.write();
        if *current != new_state {
            debug!("Connection state: {} -> {}", current, new_state);
            *current = new_state.clone();
            true
        } else {
            false
        }
    };

    if changed {
        let _ = tx.send(new_state);
    }
}

/// The protocol engine's top-level coordinator.
pub struct Orchestrator {
    scanner: Arc<ProbeScanner>,
    registry: Arc<dyn DeviceRegistry>,
    auto_connect: RwLock<AutoConnect>,
    state: Arc<RwLock<ConnectionState>>,
    state_tx: broadcast::Sender<ConnectionState>,
    frame_tx: broadcast::Sender<TemperatureFrame>,
    discovery_tx: broadcast::Sender<ScannedDevice>,
    active: Mutex<Option<ActiveConnection>>,
    /// Guards the one-connection-in-flight invariant.
    connect_in_flight: AtomicBool,
    scan_task: RwLock<Option<tokio::task::JoinHandle<()>>>,
    notify_rate: Arc<Mutex<NotifyRate>>,
}

impl Orchestrator {
    /// Create an orchestrator on the first available Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new(registry: Arc<dyn DeviceRegistry>) -> Result<Arc<Self>> {
        let scanner = ProbeScanner::new().await?;
        Ok(Self::with_scanner(scanner, registry))
    }

    /// Create an orchestrator with a specific scanner.
    pub fn with_scanner(scanner: ProbeScanner, registry: Arc<dyn DeviceRegistry>) -> Arc<Self> {
        let (state_tx, _) = broadcast::channel(32);
        let (frame_tx, _) = broadcast::channel(256);
        let (discovery_tx, _) = broadcast::channel(64);

        Arc::new(Self {
            scanner: Arc::new(scanner),
            registry,
            auto_connect: RwLock::new(AutoConnect::default()),
            state: Arc::new(RwLock::new(ConnectionState::Idle)),
            state_tx,
            frame_tx,
            discovery_tx,
            active: Mutex::new(None),
            connect_in_flight: AtomicBool::new(false),
            scan_task: RwLock::new(None),
            notify_rate: Arc::new(Mutex::new(NotifyRate::new())),
        })
    }

    // === Streams & snapshots ===

    /// The current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    /// Subscribe to connection-state changes.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to the unified temperature stream.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<TemperatureFrame> {
        self.frame_tx.subscribe()
    }

    /// Subscribe to discovery events.
    pub fn subscribe_discoveries(&self) -> broadcast::Receiver<ScannedDevice> {
        self.discovery_tx.subscribe()
    }

    /// Snapshot of the scanned devices, with registry aliases attached.
    pub fn scanned_devices(&self) -> Vec<ScannedDevice> {
        self.scanner
            .discovered_devices()
            .into_values()
            .map(|event| {
                let mut device = event.device;
                device.alias = self.registry.alias(&device.identifier);
                device
            })
            .collect()
    }

    /// Identity of the connected device, if any.
    pub fn active_device_id(&self) -> Option<String> {
        self.active.lock().as_ref().map(|a| a.device_id.clone())
    }

    /// Inbound notification rate over the diagnostic window.
    pub fn notification_rate_hz(&self) -> f64 {
        self.notify_rate.lock().rate_hz()
    }

    /// Replace the auto-connect policy.
    pub fn set_auto_connect(&self, policy: AutoConnect) {
        *self.auto_connect.write() = policy;
    }

    /// Check if scanning is active.
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    // === Scan control ===

    /// Start scanning for probes.
    ///
    /// # Errors
    ///
    /// Returns an error if a connection is in progress or scanning cannot
    /// be started.
    pub async fn start_scanning(self: &Arc<Self>) -> Result<()> {
        {
            let state = self.state.read();
            if matches!(*state, ConnectionState::Scanning) {
                debug!("Already scanning");
                return Ok(());
            }
            if !state.can_start_scanning() {
                return Err(Error::ConnectionInFlight);
            }
        }

        if let Err(e) = self.scanner.start().await {
            publish_state(
                &self.state,
                &self.state_tx,
                ConnectionState::Failed(e.to_string()),
            );
            return Err(e);
        }

        publish_state(&self.state, &self.state_tx, ConnectionState::Scanning);

        let weak = Arc::downgrade(self);
        let mut rx = self.scanner.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(orchestrator) = weak.upgrade() else {
                            break;
                        };
                        orchestrator.handle_discovery(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Discovery events lagged by {}", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Discovery pump ended");
        });
        *self.scan_task.write() = Some(handle);

        Ok(())
    }

    /// Stop scanning and return to idle.
    pub async fn stop_scanning(&self) -> Result<()> {
        self.halt_scan().await?;
        if matches!(*self.state.read(), ConnectionState::Scanning) {
            publish_state(&self.state, &self.state_tx, ConnectionState::Idle);
        }
        Ok(())
    }

    async fn halt_scan(&self) -> Result<()> {
        let result = self.scanner.stop().await;
        if let Some(handle) = self.scan_task.write().take() {
            handle.abort();
        }
        result
    }

    /// React to one discovery event.
    fn handle_discovery(self: &Arc<Self>, event: DiscoveryEvent) {
        let mut device = event.device;
        device.alias = self.registry.alias(&device.identifier);
        let _ = self.discovery_tx.send(device.clone());

        let policy = self.auto_connect.read().clone();
        if should_auto_connect(
            &policy,
            &device.identifier,
            self.connect_in_flight.load(Ordering::SeqCst),
        ) {
            info!("Auto-connecting to {}", device.identifier);
            let orchestrator = self.clone();
            let identifier = device.identifier.clone();
            tokio::spawn(async move {
                if let Err(e) = orchestrator.connect_to(&identifier).await {
                    warn!("Auto-connect to {} failed: {}", identifier, e);
                }
            });
        }
    }

    // === Connection control ===

    /// Connect to a scanned device and start measurement.
    ///
    /// # Errors
    ///
    /// Returns an error if another attempt is in flight, the device is not
    /// in the scan results, or any connect/discover stage fails. Failures
    /// surface as `Failed(reason)` on the state stream.
    pub async fn connect_to(self: &Arc<Self>, device_id: &str) -> Result<()> {
        if self
            .connect_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Ignoring connect to {}: attempt in flight", device_id);
            return Err(Error::ConnectionInFlight);
        }

        let result = self.connect_inner(device_id).await;

        if let Err(ref e) = result {
            self.connect_in_flight.store(false, Ordering::SeqCst);
            publish_state(
                &self.state,
                &self.state_tx,
                ConnectionState::Failed(e.to_string()),
            );
        }

        result
    }

    async fn connect_inner(self: &Arc<Self>, device_id: &str) -> Result<()> {
        let entry = self
            .scanner
            .discovered_devices()
            .get(device_id)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                identifier: device_id.to_string(),
            })?;

        publish_state(&self.state, &self.state_tx, ConnectionState::Connecting);

        // The connection attempt supersedes scanning.
        let _ = self.halt_scan().await;

        let profile = entry.device.profile;
        info!("Connecting to {} ({} profile)", device_id, profile.key);

        let link = Arc::new(DeviceLink::new(entry.peripheral.clone(), profile));
        link.connect().await?;
        link.discover().await?;

        let protocol: Arc<Mutex<Box<dyn DeviceProtocol>>> = Arc::new(Mutex::new(protocol_for(
            profile,
            device_id,
            self.registry.clone(),
        )));

        link.enable_notify().await?;
        protocol.lock().notify_subscribed(true);

        let ctx = ConnectionCtx {
            device_id: device_id.to_string(),
            link: link.clone(),
            protocol: protocol.clone(),
            frame_tx: self.frame_tx.clone(),
            state: self.state.clone(),
            state_tx: self.state_tx.clone(),
        };

        // Notification pump: transport chunks in, events and actions out.
        let mut stream = link.notifications().await?;
        let pump_ctx = ctx.clone();
        let rate = self.notify_rate.clone();
        let notify_task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if Some(notification.uuid) != pump_ctx.link.notify_uuid() {
                    continue;
                }
                rate.lock().record();
                let output = { pump_ctx.protocol.lock().handle_notification(&notification.value) };
                Self::execute_output(&pump_ctx, output).await;
            }
            debug!("Notification pump ended");
        });

        let output = { ctx.protocol.lock().start_measurement() };
        Self::execute_output(&ctx, output).await;

        let poll = profile.requires_polling.then(|| {
            let tick_ctx = ctx.clone();
            spawn_interval(POLL_PERIOD, move || {
                let ctx = tick_ctx.clone();
                async move {
                    let output = { ctx.protocol.lock().poll() };
                    Self::execute_output(&ctx, output).await;
                }
            })
        });

        // Watchdog: an unexpected drop from ready returns the engine to
        // idle and tears down all per-connection state.
        let weak = Arc::downgrade(self);
        let watch_link = link.clone();
        let watchdog = tokio::spawn(async move {
            loop {
                tokio::time::sleep(WATCHDOG_PERIOD).await;
                if !watch_link.is_connected().await {
                    warn!("Connection lost");
                    if let Some(orchestrator) = weak.upgrade() {
                        orchestrator.teardown_active(ConnectionState::Idle).await;
                    }
                    break;
                }
            }
        });

        *self.active.lock() = Some(ActiveConnection {
            device_id: device_id.to_string(),
            link,
            protocol,
            poll,
            notify_task,
            watchdog,
        });

        Ok(())
    }

    /// Disconnect the active device and return to idle.
    pub async fn disconnect(&self) -> Result<()> {
        self.teardown_active(ConnectionState::Idle).await;
        Ok(())
    }

    /// Stop everything: scanning and the active connection.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down orchestrator");
        let _ = self.halt_scan().await;
        self.teardown_active(ConnectionState::Idle).await;
        Ok(())
    }

    /// Tear down the active connection: poll timer, buffers, and pending
    /// commands go immediately.
    async fn teardown_active(&self, next_state: ConnectionState) {
        let active = self.active.lock().take();

        if let Some(mut active) = active {
            info!("Tearing down connection to {}", active.device_id);

            if let Some(mut poll) = active.poll.take() {
                poll.cancel();
            }
            active.protocol.lock().teardown();
            let _ = active.link.disconnect().await;

            self.connect_in_flight.store(false, Ordering::SeqCst);
            publish_state(&self.state, &self.state_tx, next_state);

            // Abort the tasks last: the watchdog may be the caller.
            active.notify_task.abort();
            active.watchdog.abort();
        } else {
            self.connect_in_flight.store(false, Ordering::SeqCst);
            publish_state(&self.state, &self.state_tx, next_state);
        }
    }

    // === Output execution ===

    /// Republish a handler's events and run its transport actions in order.
    async fn execute_output(ctx: &ConnectionCtx, output: ProtocolOutput) {
        for event in output.events {
            match event {
                DeviceEvent::Ready => {
                    info!("{} ready", ctx.device_id);
                    publish_state(&ctx.state, &ctx.state_tx, ConnectionState::Ready);
                }
                DeviceEvent::Frame(frame) => {
                    let _ = ctx.frame_tx.send(frame);
                }
                DeviceEvent::Fault(message) => {
                    warn!("Protocol fault on {}: {}", ctx.device_id, message);
                }
            }
        }

        for action in output.actions {
            if let Err(e) = Self::execute_action(ctx, action).await {
                warn!("Link action failed on {}: {}", ctx.device_id, e);
            }
        }
    }

    async fn execute_action(ctx: &ConnectionCtx, action: LinkAction) -> Result<()> {
        match action {
            LinkAction::Write {
                bytes,
                with_response,
            } => ctx.link.write(&bytes, with_response).await,
            LinkAction::Wait(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            LinkAction::EnableNotify => {
                ctx.link.enable_notify().await?;
                ctx.protocol.lock().notify_subscribed(true);
                Ok(())
            }
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(handle) = self.scan_task.write().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_predicates() {
        assert!(ConnectionState::Ready.is_ready());
        assert!(!ConnectionState::Scanning.is_ready());

        assert!(ConnectionState::Idle.can_start_scanning());
        assert!(ConnectionState::Failed("x".into()).can_start_scanning());
        assert!(!ConnectionState::Connecting.can_start_scanning());
        assert!(!ConnectionState::Ready.can_start_scanning());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Ready), "Ready");
        assert_eq!(
            format!("{}", ConnectionState::Failed("no notify".into())),
            "Failed: no notify"
        );
    }

    #[test]
    fn test_auto_connect_empty_preferred_takes_first() {
        let policy = AutoConnect {
            enabled: true,
            preferred: HashSet::new(),
        };

        assert!(should_auto_connect(&policy, "any-device", false));
        // Subsequent discoveries are ignored while an attempt is in flight.
        assert!(!should_auto_connect(&policy, "any-device", true));
    }

    #[test]
    fn test_auto_connect_preferred_set_filters() {
        let mut preferred = HashSet::new();
        preferred.insert("TR45-001".to_string());
        let policy = AutoConnect {
            enabled: true,
            preferred,
        };

        assert!(should_auto_connect(&policy, "TR45-001", false));
        assert!(!should_auto_connect(&policy, "TR41-002", false));
    }

    #[test]
    fn test_auto_connect_disabled() {
        let policy = AutoConnect::default();
        assert!(!should_auto_connect(&policy, "TR45-001", false));
    }

    #[test]
    fn test_publish_state_dedupes() {
        let state = RwLock::new(ConnectionState::Idle);
        let (tx, mut rx) = broadcast::channel(8);

        publish_state(&state, &tx, ConnectionState::Scanning);
        publish_state(&state, &tx, ConnectionState::Scanning);
        publish_state(&state, &tx, ConnectionState::Idle);

        assert_eq!(rx.try_recv().unwrap(), ConnectionState::Scanning);
        assert_eq!(rx.try_recv().unwrap(), ConnectionState::Idle);
        assert!(rx.try_recv().is_err());
    }
}

//! Multi-block fragmented variant (Chino MD8000 handhelds).
//!
//! Every logical command is wrapped in an envelope and split into a header
//! packet plus numbered data blocks; replies arrive the same way and are
//! reassembled before the inner SOH frame is parsed like the single-frame
//! variant's. Units configured to require registration refuse the settings
//! read until an authentication command carrying the stored registration
//! code succeeds.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::device::{
    realtime_events, DeviceEvent, DeviceProtocol, LinkAction, ProtocolOutput,
};
use crate::profile::ProfileKey;
use crate::protocol::crc::CRC_INIT_MD8000;
use crate::protocol::fragment::{split_blocks, unwrap_envelope, wrap_envelope, BlockAssembler, ENV_CMD_REQUEST};
use crate::protocol::router::CommandRouter;
use crate::protocol::soh::{
    SohFrame, CMD_AUTHENTICATE, CMD_READ_SETTINGS, CMD_REALTIME, STATUS_REFUSED,
    SUB_REALTIME_ALL,
};
use crate::registry::{registration_code_to_u32, DeviceRegistry};

/// How long a tracked command waits for its matched reply.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);
/// Minimum spacing between authentication attempts after a refusal.
const AUTH_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Authentication progress for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    /// No refusal seen yet.
    Unchallenged,
    /// Authentication command sent, reply pending.
    Authenticating,
    /// Settings access granted.
    Authorized,
    /// Device refused and no usable code is available.
    Refused,
}

/// Handler for the fragmented family.
pub struct FragmentedDevice {
    device_id: String,
    registry: Arc<dyn DeviceRegistry>,
    assembler: BlockAssembler,
    router: CommandRouter,
    auth: AuthState,
    last_auth_attempt: Option<Instant>,
    subscribed: bool,
}

impl FragmentedDevice {
    /// Create a handler for one device.
    pub fn new(device_id: impl Into<String>, registry: Arc<dyn DeviceRegistry>) -> Self {
        Self {
            device_id: device_id.into(),
            registry,
            assembler: BlockAssembler::new(),
            router: CommandRouter::new(),
            auth: AuthState::Unchallenged,
            last_auth_attempt: None,
            subscribed: false,
        }
    }

    /// Wrap and fragment an inner frame into write actions.
    fn send_fragmented(inner: &SohFrame) -> Vec<LinkAction> {
        let envelope = wrap_envelope(ENV_CMD_REQUEST, &inner.encode(CRC_INIT_MD8000));
        split_blocks(&envelope)
            .into_iter()
            .map(LinkAction::write)
            .collect()
    }

    /// Send a command whose reply is correlated and timed out by the router.
    fn send_tracked(&self, inner: SohFrame) -> Vec<LinkAction> {
        // The receiver is dropped deliberately: the reply is handled by the
        // dispatch below, the router only provides the timeout bookkeeping
        // and exactly-once completion.
        let _ = self.router.register(inner.command, COMMAND_TIMEOUT);
        Self::send_fragmented(&inner)
    }

    fn settings_read(&self) -> Vec<LinkAction> {
        self.send_tracked(SohFrame::request_with_payload(CMD_READ_SETTINGS, vec![]))
    }

    /// React to a refused settings read: authenticate with the stored
    /// registration code, throttled to one attempt per interval.
    fn handle_refusal(&mut self) -> ProtocolOutput {
        if let Some(last) = self.last_auth_attempt {
            if last.elapsed() < AUTH_RETRY_INTERVAL {
                debug!("Authentication retry throttled");
                return ProtocolOutput::none();
            }
        }
        self.last_auth_attempt = Some(Instant::now());

        let code = match self.registry.registration_code(&self.device_id) {
            Some(code) => code,
            None => {
                warn!("Device {} refused: no registration code stored", self.device_id);
                self.auth = AuthState::Refused;
                return ProtocolOutput::event(DeviceEvent::Fault(format!(
                    "device {} requires a registration code",
                    self.device_id
                )));
            }
        };

        let value = match registration_code_to_u32(&code) {
            Some(value) => value,
            None => {
                warn!("Stored registration code for {} is malformed", self.device_id);
                self.auth = AuthState::Refused;
                return ProtocolOutput::event(DeviceEvent::Fault(format!(
                    "stored registration code for {} is malformed",
                    self.device_id
                )));
            }
        };

        debug!("Authenticating {} with stored code", self.device_id);
        self.auth = AuthState::Authenticating;
        ProtocolOutput {
            events: vec![],
            actions: self.send_tracked(SohFrame::request_with_payload(
                CMD_AUTHENTICATE,
                value.to_le_bytes().to_vec(),
            )),
        }
    }

    /// Dispatch one reassembled inner frame.
    fn dispatch(&mut self, frame: SohFrame) -> ProtocolOutput {
        self.router.complete(frame.clone());

        match frame.command {
            CMD_REALTIME => ProtocolOutput {
                events: realtime_events(&frame, &self.device_id),
                actions: vec![],
            },
            CMD_READ_SETTINGS => {
                if frame.status == STATUS_REFUSED {
                    self.handle_refusal()
                } else if frame.is_ok() {
                    trace!("Settings reply: {} bytes", frame.payload.len());
                    self.auth = AuthState::Authorized;
                    ProtocolOutput::none()
                } else {
                    debug!("Settings reply with status {:#04x}", frame.status);
                    ProtocolOutput::none()
                }
            }
            CMD_AUTHENTICATE => {
                if frame.is_ok() {
                    debug!("Authentication accepted for {}", self.device_id);
                    self.auth = AuthState::Authorized;
                    // Re-issue the read that was refused.
                    ProtocolOutput {
                        events: vec![],
                        actions: self.settings_read(),
                    }
                } else {
                    warn!("Authentication refused for {}", self.device_id);
                    self.auth = AuthState::Refused;
                    ProtocolOutput::event(DeviceEvent::Fault(format!(
                        "authentication refused for {}",
                        self.device_id
                    )))
                }
            }
            other => {
                trace!("Ignoring reply for command {:#04x}", other);
                ProtocolOutput::none()
            }
        }
    }
}

impl DeviceProtocol for FragmentedDevice {
    fn profile_key(&self) -> ProfileKey {
        ProfileKey::Md8000
    }

    fn notify_subscribed(&mut self, subscribed: bool) {
        self.subscribed = subscribed;
    }

    fn start_measurement(&mut self) -> ProtocolOutput {
        ProtocolOutput {
            events: vec![DeviceEvent::Ready],
            actions: self.settings_read(),
        }
    }

    fn poll(&mut self) -> ProtocolOutput {
        if !self.subscribed {
            debug!("Skipping poll: notify not subscribed yet");
            return ProtocolOutput::action(LinkAction::EnableNotify);
        }

        let inner = SohFrame::request(CMD_REALTIME, SUB_REALTIME_ALL);
        ProtocolOutput {
            events: vec![],
            actions: Self::send_fragmented(&inner),
        }
    }

    fn handle_notification(&mut self, data: &[u8]) -> ProtocolOutput {
        trace!("MD8000 packet: {} bytes", data.len());

        let envelope = match self.assembler.accept(data) {
            Some(envelope) => envelope,
            None => return ProtocolOutput::none(),
        };

        let inner = match unwrap_envelope(&envelope) {
            Ok((_env_cmd, inner)) => inner.to_vec(),
            Err(e) => {
                warn!("Dropping assembled envelope: {}", e);
                return ProtocolOutput::none();
            }
        };

        match SohFrame::parse(&inner, CRC_INIT_MD8000) {
            Ok(frame) => self.dispatch(frame),
            Err(e) => {
                warn!("Dropping inner frame: {}", e);
                ProtocolOutput::none()
            }
        }
    }

    fn teardown(&mut self) {
        self.assembler.reset();
        self.router.fail_all();
        self.auth = AuthState::Unchallenged;
        self.last_auth_attempt = None;
        self.subscribed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::fragment::ENV_CMD_REPLY;
    use crate::protocol::soh::STATUS_OK;
    use crate::registry::MemoryRegistry;

    fn device_with_code(code: Option<&str>) -> FragmentedDevice {
        let registry = MemoryRegistry::new();
        if let Some(code) = code {
            registry.set_registration_code("MD8000-12", code);
        }
        FragmentedDevice::new("MD8000-12", Arc::new(registry))
    }

    fn reply_packets(command: u8, status: u8, payload: Vec<u8>) -> Vec<Vec<u8>> {
        let inner = SohFrame {
            command,
            status,
            payload,
        }
        .encode(CRC_INIT_MD8000);
        split_blocks(&wrap_envelope(ENV_CMD_REPLY, &inner))
    }

    fn feed(device: &mut FragmentedDevice, packets: &[Vec<u8>]) -> ProtocolOutput {
        let mut merged = ProtocolOutput::none();
        for packet in packets {
            merged.merge(device.handle_notification(packet));
        }
        merged
    }

    #[tokio::test]
    async fn test_realtime_reply_roundtrip() {
        let mut device = device_with_code(None);
        device.notify_subscribed(true);

        let mut payload = 1850u16.to_le_bytes().to_vec();
        payload.extend_from_slice(&1000u16.to_le_bytes());
        let output = feed(
            &mut device,
            &reply_packets(CMD_REALTIME, STATUS_OK, payload),
        );

        let temps: Vec<f64> = output
            .events
            .iter()
            .filter_map(|e| match e {
                DeviceEvent::Frame(f) => Some(f.celsius),
                _ => None,
            })
            .collect();
        assert_eq!(temps, vec![85.0, 0.0]);
    }

    #[tokio::test]
    async fn test_poll_is_fragmented() {
        let mut device = device_with_code(None);
        device.notify_subscribed(true);

        let output = device.poll();
        assert!(output.actions.len() >= 2, "header packet plus data blocks");
        match &output.actions[0] {
            LinkAction::Write { bytes, .. } => assert_eq!(bytes.len(), 20),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_poll_skipped_until_subscribed() {
        let mut device = device_with_code(None);
        assert_eq!(device.poll().actions, vec![LinkAction::EnableNotify]);
    }

    #[tokio::test]
    async fn test_refusal_with_stored_code_authenticates() {
        let mut device = device_with_code(Some("00424242"));
        device.notify_subscribed(true);

        let output = feed(
            &mut device,
            &reply_packets(CMD_READ_SETTINGS, STATUS_REFUSED, vec![]),
        );

        // An authentication command goes out, fragmented.
        assert!(!output.actions.is_empty());
        assert_eq!(device.auth, AuthState::Authenticating);

        // Success re-issues the settings read.
        let output = feed(
            &mut device,
            &reply_packets(CMD_AUTHENTICATE, STATUS_OK, vec![]),
        );
        assert_eq!(device.auth, AuthState::Authorized);
        assert!(!output.actions.is_empty());
    }

    #[tokio::test]
    async fn test_refusal_without_code_faults() {
        let mut device = device_with_code(None);
        device.notify_subscribed(true);

        let output = feed(
            &mut device,
            &reply_packets(CMD_READ_SETTINGS, STATUS_REFUSED, vec![]),
        );

        assert_eq!(device.auth, AuthState::Refused);
        assert!(matches!(output.events[0], DeviceEvent::Fault(_)));
    }

    #[tokio::test]
    async fn test_refusal_retry_throttled() {
        let mut device = device_with_code(Some("00424242"));
        device.notify_subscribed(true);

        let first = feed(
            &mut device,
            &reply_packets(CMD_READ_SETTINGS, STATUS_REFUSED, vec![]),
        );
        assert!(!first.actions.is_empty());

        // A second refusal inside the throttle window does nothing.
        let second = feed(
            &mut device,
            &reply_packets(CMD_READ_SETTINGS, STATUS_REFUSED, vec![]),
        );
        assert!(second.actions.is_empty());
        assert!(second.events.is_empty());
    }

    #[tokio::test]
    async fn test_auth_refused_marks_device() {
        let mut device = device_with_code(Some("00424242"));
        device.notify_subscribed(true);

        feed(
            &mut device,
            &reply_packets(CMD_READ_SETTINGS, STATUS_REFUSED, vec![]),
        );
        let output = feed(
            &mut device,
            &reply_packets(CMD_AUTHENTICATE, STATUS_REFUSED, vec![]),
        );

        assert_eq!(device.auth, AuthState::Refused);
        assert!(matches!(output.events[0], DeviceEvent::Fault(_)));
    }

    #[tokio::test]
    async fn test_teardown_clears_pending() {
        let mut device = device_with_code(None);
        let output = device.start_measurement();
        assert!(matches!(output.events[0], DeviceEvent::Ready));
        assert_eq!(device.router.pending_count(), 1);

        device.teardown();
        assert_eq!(device.router.pending_count(), 0);
    }
}

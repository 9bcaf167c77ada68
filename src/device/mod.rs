//! Device variants: one protocol handler per vendor family.
//!
//! Every family implements [`DeviceProtocol`], a synchronous state machine
//! selected once at connect time by profile key. Handlers never touch the
//! transport themselves; they return [`LinkAction`]s for the orchestrator's
//! connection task to execute and [`DeviceEvent`]s for it to republish.
//! This keeps the variants free of callback fields and directly testable
//! with byte fixtures.

pub mod ascii_stream;
pub mod fragmented;
pub mod soh_polled;
pub mod wake_polled;

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::data::TemperatureFrame;
use crate::profile::{DeviceProfile, ProfileKey};
use crate::protocol::soh::{parse_realtime_payload, raw_to_celsius, SohFrame};
use crate::registry::DeviceRegistry;

pub use ascii_stream::AsciiStreamDevice;
pub use fragmented::FragmentedDevice;
pub use soh_polled::SohPolledDevice;
pub use wake_polled::WakePolledDevice;

/// Event produced by a device variant.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// The variant finished its setup and realtime data can flow.
    Ready,
    /// A parsed temperature sample.
    Frame(TemperatureFrame),
    /// A recoverable protocol fault; the connection stays up.
    Fault(String),
}

/// Transport work requested by a device variant, executed in order by the
/// connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Write bytes to the profile's write characteristic.
    Write {
        /// Raw bytes to send.
        bytes: Vec<u8>,
        /// Whether the write requires a transport acknowledgement.
        with_response: bool,
    },
    /// Pause before the next action.
    Wait(Duration),
    /// (Re-)enable the notify subscription.
    EnableNotify,
}

impl LinkAction {
    /// Unacknowledged write, the common case for poll commands.
    pub fn write(bytes: Vec<u8>) -> Self {
        Self::Write {
            bytes,
            with_response: false,
        }
    }
}

/// Batch of events and transport actions returned by a handler call.
#[derive(Debug, Default)]
pub struct ProtocolOutput {
    /// Events to republish.
    pub events: Vec<DeviceEvent>,
    /// Transport actions to execute, in order.
    pub actions: Vec<LinkAction>,
}

impl ProtocolOutput {
    /// An output with nothing to do.
    pub fn none() -> Self {
        Self::default()
    }

    /// An output carrying a single event.
    pub fn event(event: DeviceEvent) -> Self {
        Self {
            events: vec![event],
            actions: vec![],
        }
    }

    /// An output carrying a single action.
    pub fn action(action: LinkAction) -> Self {
        Self {
            events: vec![],
            actions: vec![action],
        }
    }

    /// Append another batch, preserving order.
    pub fn merge(&mut self, other: ProtocolOutput) {
        self.events.extend(other.events);
        self.actions.extend(other.actions);
    }
}

/// The shared contract implemented by every vendor protocol family.
pub trait DeviceProtocol: Send {
    /// Which catalog family this handler speaks.
    fn profile_key(&self) -> ProfileKey;

    /// Inform the handler about the notify subscription state.
    fn notify_subscribed(&mut self, subscribed: bool);

    /// Begin realtime measurement. Called once after characteristics are
    /// resolved and, for framed protocols, notifications are enabled.
    fn start_measurement(&mut self) -> ProtocolOutput;

    /// One poll cycle. Only called for profiles with `requires_polling`.
    fn poll(&mut self) -> ProtocolOutput {
        ProtocolOutput::none()
    }

    /// Consume one inbound notification chunk.
    fn handle_notification(&mut self, data: &[u8]) -> ProtocolOutput;

    /// Drop per-connection state: buffers, pending commands.
    fn teardown(&mut self);
}

/// Select and construct the handler for a profile.
pub fn protocol_for(
    profile: &'static DeviceProfile,
    device_id: &str,
    registry: Arc<dyn DeviceRegistry>,
) -> Box<dyn DeviceProtocol> {
    match profile.key {
        ProfileKey::AnritsuMeter => Box::new(AsciiStreamDevice::new(device_id)),
        ProfileKey::Tr4 => Box::new(SohPolledDevice::new(device_id)),
        ProfileKey::Tr45 => Box::new(WakePolledDevice::new(device_id)),
        ProfileKey::Md8000 => Box::new(FragmentedDevice::new(device_id, registry)),
    }
}

/// Turn a realtime reply frame into temperature events, one per attached
/// channel. "No probe" sentinels produce nothing.
pub(crate) fn realtime_events(frame: &SohFrame, device_id: &str) -> Vec<DeviceEvent> {
    let raws = match parse_realtime_payload(&frame.payload) {
        Ok(raws) => raws,
        Err(e) => {
            debug!("Dropping realtime reply: {}", e);
            return vec![];
        }
    };

    raws.iter()
        .enumerate()
        .filter_map(|(channel, &raw)| {
            raw_to_celsius(raw).map(|celsius| {
                DeviceEvent::Frame(
                    TemperatureFrame::now(device_id, channel as u8, celsius)
                        .with_status(frame.status),
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::match_profile;
    use crate::protocol::soh::{CMD_REALTIME, RAW_NO_PROBE};
    use crate::registry::MemoryRegistry;

    fn registry() -> Arc<dyn DeviceRegistry> {
        Arc::new(MemoryRegistry::new())
    }

    #[test]
    fn test_protocol_selection_by_profile() {
        let cases = [
            ("AnritsuM-7", ProfileKey::AnritsuMeter),
            ("TR45-001", ProfileKey::Tr45),
            ("TR41-002", ProfileKey::Tr4),
            ("MD8000-12", ProfileKey::Md8000),
        ];

        for (name, key) in cases {
            let profile = match_profile(name).unwrap();
            let handler = protocol_for(profile, name, registry());
            assert_eq!(handler.profile_key(), key);
        }
    }

    #[test]
    fn test_realtime_events_skips_missing_probe() {
        let mut payload = 1850u16.to_le_bytes().to_vec();
        payload.extend_from_slice(&RAW_NO_PROBE.to_le_bytes());
        let frame = SohFrame {
            command: CMD_REALTIME,
            status: 0,
            payload,
        };

        let events = realtime_events(&frame, "TR41-002");
        assert_eq!(events.len(), 1);
        match &events[0] {
            DeviceEvent::Frame(frame) => {
                assert_eq!(frame.channel, 0);
                assert!((frame.celsius - 85.0).abs() < 1e-9);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_discovery_to_frame_chain() {
        // The full chain short of the radio: advertised name resolves a
        // profile, the profile selects a handler, and an inbound ASCII
        // chunk becomes a frame.
        let profile = match_profile("AnritsuM-7").unwrap();
        let mut handler = protocol_for(profile, "AnritsuM-7", registry());

        let ready = handler.start_measurement();
        assert!(matches!(ready.events[0], DeviceEvent::Ready));

        let output = handler.handle_notification(b"  28.1\n");
        match &output.events[0] {
            DeviceEvent::Frame(frame) => {
                assert_eq!(frame.device_id, "AnritsuM-7");
                assert!((frame.celsius - 28.1).abs() < 1e-9);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_realtime_events_short_payload_dropped() {
        let frame = SohFrame {
            command: CMD_REALTIME,
            status: 0,
            payload: vec![0x01],
        };
        assert!(realtime_events(&frame, "TR41-002").is_empty());
    }
}

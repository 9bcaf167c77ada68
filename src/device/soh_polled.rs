//! Single-frame polled variant (T&D TR4 recorders).
//!
//! The recorder answers a fixed 9-byte realtime command with one SOH reply
//! carrying two signed 16-bit raw channel values. Polling runs at 1 Hz;
//! the command is written without response.

use tracing::trace;

use crate::device::{
    realtime_events, DeviceEvent, DeviceProtocol, LinkAction, ProtocolOutput,
};
use crate::profile::ProfileKey;
use crate::protocol::accumulator::NotifyAccumulator;
use crate::protocol::crc::CRC_INIT_TR4X;
use crate::protocol::soh::{SohFrame, CMD_REALTIME, SUB_REALTIME_ALL};

/// Handler for the plain polled family.
pub struct SohPolledDevice {
    device_id: String,
    accumulator: NotifyAccumulator,
}

impl SohPolledDevice {
    /// Create a handler for one device.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            accumulator: NotifyAccumulator::new(),
        }
    }

    /// The 9-byte realtime poll command.
    pub(crate) fn poll_command() -> Vec<u8> {
        SohFrame::request(CMD_REALTIME, SUB_REALTIME_ALL).encode(CRC_INIT_TR4X)
    }
}

impl DeviceProtocol for SohPolledDevice {
    fn profile_key(&self) -> ProfileKey {
        ProfileKey::Tr4
    }

    fn notify_subscribed(&mut self, _subscribed: bool) {
        // The orchestrator subscribes before measurement starts; the TR4
        // keeps answering polls regardless.
    }

    fn start_measurement(&mut self) -> ProtocolOutput {
        ProtocolOutput::event(DeviceEvent::Ready)
    }

    fn poll(&mut self) -> ProtocolOutput {
        ProtocolOutput::action(LinkAction::write(Self::poll_command()))
    }

    fn handle_notification(&mut self, data: &[u8]) -> ProtocolOutput {
        trace!("TR4 chunk: {} bytes", data.len());

        let mut output = ProtocolOutput::none();
        for frame in self.accumulator.push(data, CRC_INIT_TR4X) {
            if frame.command == CMD_REALTIME {
                output.events.extend(realtime_events(&frame, &self.device_id));
            } else {
                trace!("Ignoring reply for command {:#04x}", frame.command);
            }
        }
        output
    }

    fn teardown(&mut self) {
        self.accumulator.clear();
    }
}

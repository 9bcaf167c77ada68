//! Wake/break polled variant (T&D TR45 power-saving recorders).
//!
//! Identical wire protocol to the TR4, except the recorder sleeps between
//! polls: each cycle sends a single zero byte to rouse it, waits for the
//! radio to come up, then sends the normal realtime command. A poll that
//! fires before the notify subscription is active is skipped, not queued,
//! and the subscription is (re-)enabled for the next cycle.

use std::time::Duration;

use tracing::{debug, trace};

use crate::device::{
    realtime_events, DeviceEvent, DeviceProtocol, LinkAction, ProtocolOutput,
};
use crate::profile::ProfileKey;
use crate::protocol::accumulator::NotifyAccumulator;
use crate::protocol::crc::CRC_INIT_TR4X;
use crate::protocol::soh::CMD_REALTIME;

/// Settling time between the wake byte and the command.
const WAKE_DELAY: Duration = Duration::from_millis(50);

/// Handler for the wake/break polled family.
pub struct WakePolledDevice {
    device_id: String,
    accumulator: NotifyAccumulator,
    subscribed: bool,
}

impl WakePolledDevice {
    /// Create a handler for one device.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            accumulator: NotifyAccumulator::new(),
            subscribed: false,
        }
    }
}

impl DeviceProtocol for WakePolledDevice {
    fn profile_key(&self) -> ProfileKey {
        ProfileKey::Tr45
    }

    fn notify_subscribed(&mut self, subscribed: bool) {
        self.subscribed = subscribed;
    }

    fn start_measurement(&mut self) -> ProtocolOutput {
        ProtocolOutput::event(DeviceEvent::Ready)
    }

    fn poll(&mut self) -> ProtocolOutput {
        if !self.subscribed {
            debug!("Skipping poll: notify not subscribed yet");
            return ProtocolOutput::action(LinkAction::EnableNotify);
        }

        ProtocolOutput {
            events: vec![],
            actions: vec![
                LinkAction::write(vec![0x00]),
                LinkAction::Wait(WAKE_DELAY),
                LinkAction::write(crate::device::SohPolledDevice::poll_command()),
            ],
        }
    }

    fn handle_notification(&mut self, data: &[u8]) -> ProtocolOutput {
        trace!("TR45 chunk: {} bytes", data.len());

        let mut output = ProtocolOutput::none();
        for frame in self.accumulator.push(data, CRC_INIT_TR4X) {
            if frame.command == CMD_REALTIME {
                output.events.extend(realtime_events(&frame, &self.device_id));
            }
        }
        output
    }

    fn teardown(&mut self) {
        self.accumulator.clear();
        self.subscribed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_skipped_until_subscribed() {
        let mut device = WakePolledDevice::new("TR45-001");

        let output = device.poll();
        assert_eq!(output.actions, vec![LinkAction::EnableNotify]);

        device.notify_subscribed(true);
        let output = device.poll();
        assert_eq!(output.actions.len(), 3);
        assert_eq!(output.actions[0], LinkAction::write(vec![0x00]));
        assert_eq!(output.actions[1], LinkAction::Wait(WAKE_DELAY));
        match &output.actions[2] {
            LinkAction::Write { bytes, .. } => assert_eq!(bytes.len(), 9),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_unsubscribe_skips_again() {
        let mut device = WakePolledDevice::new("TR45-001");
        device.notify_subscribed(true);
        device.notify_subscribed(false);
        assert_eq!(device.poll().actions, vec![LinkAction::EnableNotify]);
    }
}

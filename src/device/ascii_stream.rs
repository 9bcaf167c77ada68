//! Continuous-notify ASCII variant (Anritsu Meter surface probes).
//!
//! The probe pushes its current reading as ASCII-decimal text whenever the
//! value changes; there is no poll command. Parsing strips everything that
//! is not part of a decimal number and interprets the rest; malformed text
//! yields no frame.

use tracing::{debug, trace};

use crate::data::TemperatureFrame;
use crate::device::{DeviceEvent, DeviceProtocol, ProtocolOutput};
use crate::profile::ProfileKey;

/// Handler for the ASCII push family.
pub struct AsciiStreamDevice {
    device_id: String,
}

impl AsciiStreamDevice {
    /// Create a handler for one device.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }
}

/// Extract a decimal reading from a pushed text chunk.
///
/// Keeps digits, the decimal point, and a leading minus; everything else
/// (whitespace, unit suffixes, line terminators) is stripped.
fn parse_ascii_reading(data: &[u8]) -> Option<f64> {
    let text = String::from_utf8_lossy(data);
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();

    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

impl DeviceProtocol for AsciiStreamDevice {
    fn profile_key(&self) -> ProfileKey {
        ProfileKey::AnritsuMeter
    }

    fn notify_subscribed(&mut self, _subscribed: bool) {
        // Push-only family: nothing gates on subscription state.
    }

    fn start_measurement(&mut self) -> ProtocolOutput {
        // Nothing to send: the probe pushes on its own once subscribed.
        ProtocolOutput::event(DeviceEvent::Ready)
    }

    fn handle_notification(&mut self, data: &[u8]) -> ProtocolOutput {
        trace!("ASCII chunk: {:02X?}", data);

        match parse_ascii_reading(data) {
            Some(celsius) => ProtocolOutput::event(DeviceEvent::Frame(TemperatureFrame::now(
                &self.device_id,
                0,
                celsius,
            ))),
            None => {
                debug!("Dropping unparseable ASCII chunk ({} bytes)", data.len());
                ProtocolOutput::none()
            }
        }
    }

    fn teardown(&mut self) {}
}

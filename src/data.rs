//! Core data types produced by the protocol engine.

use chrono::{DateTime, Utc};

/// A single temperature sample produced by a device variant.
///
/// Frames are immutable once emitted; every successful parse produces exactly
/// one frame per channel.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TemperatureFrame {
    /// When the sample was parsed.
    pub timestamp: DateTime<Utc>,
    /// Identity of the device that produced the sample.
    pub device_id: String,
    /// Logical channel on the device (0-based; single-channel probes use 0).
    pub channel: u8,
    /// Temperature in degrees Celsius.
    pub celsius: f64,
    /// Device status byte carried with the sample, when the protocol
    /// reports one and it is non-zero.
    pub status: Option<u8>,
}

impl TemperatureFrame {
    /// Create a frame stamped with the current time.
    pub fn now(device_id: impl Into<String>, channel: u8, celsius: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            device_id: device_id.into(),
            channel,
            celsius,
            status: None,
        }
    }

    /// Attach a status byte to the frame. Zero means "no flag".
    pub fn with_status(mut self, status: u8) -> Self {
        self.status = (status != 0).then_some(status);
        self
    }

    /// Temperature in degrees Fahrenheit.
    pub fn fahrenheit(&self) -> f64 {
        crate::utils::celsius_to_fahrenheit(self.celsius)
    }
}

impl std::fmt::Display for TemperatureFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ch{} {:.1}°C",
            self.device_id, self.channel, self.celsius
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_with_status() {
        let frame = TemperatureFrame::now("dev", 0, 25.0).with_status(0x15);
        assert_eq!(frame.status, Some(0x15));

        let frame = TemperatureFrame::now("dev", 0, 25.0).with_status(0x00);
        assert_eq!(frame.status, None);
    }

    #[test]
    fn test_frame_fahrenheit() {
        let frame = TemperatureFrame::now("dev", 1, 100.0);
        assert!((frame.fahrenheit() - 212.0).abs() < 0.001);
    }

    #[test]
    fn test_frame_display() {
        let frame = TemperatureFrame::now("TR45-001", 1, 85.1);
        assert_eq!(format!("{}", frame), "TR45-001 ch1 85.1°C");
    }
}

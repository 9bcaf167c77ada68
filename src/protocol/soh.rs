//! SOH frame codec shared by the polled and fragmented families.
//!
//! Frame layout:
//!
//! ```text
//! SOH(0x01) | CMD(1) | STATUS(1) | LEN(2, LE) | PAYLOAD(n) | CRC16(2, BE) | EOT(0x04)
//! ```
//!
//! The CRC covers the bytes from the start marker through the last payload
//! byte. Requests carry their sub-code as a one-byte payload and a zero
//! status; responses echo the request's command code with the result in the
//! status field. The realtime request is therefore exactly 9 bytes on the
//! wire.

use crate::error::{Error, Result};
use crate::protocol::crc::crc16;

/// Start-of-header marker.
pub const SOH: u8 = 0x01;
/// End-of-transmission trailer.
pub const EOT: u8 = 0x04;

/// Bytes before the payload: marker + command + status + length.
pub const HEADER_LEN: usize = 5;
/// Bytes after the payload: CRC(2) + EOT.
pub const TRAILER_LEN: usize = 3;

/// Realtime measurement command.
pub const CMD_REALTIME: u8 = 0x33;
/// Sub-code selecting both channels of the realtime reading.
pub const SUB_REALTIME_ALL: u8 = 0x01;
/// Settings read command (fragmented family).
pub const CMD_READ_SETTINGS: u8 = 0x41;
/// Authentication command (fragmented family).
pub const CMD_AUTHENTICATE: u8 = 0x21;

/// Status: command accepted.
pub const STATUS_OK: u8 = 0x00;
/// Status: command refused, authentication required.
pub const STATUS_REFUSED: u8 = 0x15;

/// Raw channel value meaning "no probe attached" (variant A).
pub const RAW_NO_PROBE: u16 = 0xEEEE;
/// Raw channel value meaning "no probe attached" (variant B).
pub const RAW_NO_PROBE_ALT: u16 = 0xF000;

/// A parsed SOH frame. Transient: constructed during parse or send,
/// consumed immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SohFrame {
    /// Command code.
    pub command: u8,
    /// Status code (zero on requests).
    pub status: u8,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl SohFrame {
    /// Build a request frame carrying a one-byte sub-code payload.
    pub fn request(command: u8, sub_code: u8) -> Self {
        Self {
            command,
            status: 0,
            payload: vec![sub_code],
        }
    }

    /// Build a request frame with an arbitrary payload.
    pub fn request_with_payload(command: u8, payload: Vec<u8>) -> Self {
        Self {
            command,
            status: 0,
            payload,
        }
    }

    /// Total encoded length of a frame with `payload_len` payload bytes.
    pub fn encoded_len(payload_len: usize) -> usize {
        HEADER_LEN + payload_len + TRAILER_LEN
    }

    /// Serialize the frame with the family's CRC init.
    pub fn encode(&self, crc_init: u16) -> Vec<u8> {
        let mut data = Vec::with_capacity(Self::encoded_len(self.payload.len()));
        data.push(SOH);
        data.push(self.command);
        data.push(self.status);
        data.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        data.extend_from_slice(&self.payload);

        let crc = crc16(crc_init, &data);
        data.extend_from_slice(&crc.to_be_bytes());
        data.push(EOT);

        data
    }

    /// Parse one complete frame from `data`, which must contain exactly the
    /// frame bytes.
    pub fn parse(data: &[u8], crc_init: u16) -> Result<Self> {
        if data.len() < Self::encoded_len(0) {
            return Err(Error::InvalidData {
                context: format!("frame too short: {} bytes", data.len()),
            });
        }

        if data[0] != SOH {
            return Err(Error::InvalidData {
                context: format!("bad start marker: {:#04x}", data[0]),
            });
        }

        let payload_len = u16::from_le_bytes([data[3], data[4]]) as usize;
        let total = Self::encoded_len(payload_len);
        if data.len() != total {
            return Err(Error::InvalidData {
                context: format!("length mismatch: have {} bytes, frame says {}", data.len(), total),
            });
        }

        if data[total - 1] != EOT {
            return Err(Error::InvalidData {
                context: format!("bad trailer: {:#04x}", data[total - 1]),
            });
        }

        let crc_region = &data[..HEADER_LEN + payload_len];
        let crc_bytes = &data[HEADER_LEN + payload_len..total - 1];
        let expected = crc16(crc_init, crc_region);
        let actual = u16::from_be_bytes([crc_bytes[0], crc_bytes[1]]);
        if expected != actual {
            return Err(Error::CrcMismatch { expected, actual });
        }

        Ok(Self {
            command: data[1],
            status: data[2],
            payload: data[HEADER_LEN..HEADER_LEN + payload_len].to_vec(),
        })
    }

    /// Check whether the status byte reports success.
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Convert a raw wire channel value to degrees Celsius.
///
/// Returns `None` for the "no probe attached" sentinels; those must not
/// produce a frame.
pub fn raw_to_celsius(raw: u16) -> Option<f64> {
    if raw == RAW_NO_PROBE || raw == RAW_NO_PROBE_ALT {
        return None;
    }
    Some((raw as i16 as f64 - 1000.0) / 10.0)
}

/// Extract the two raw channel values from a realtime reply payload.
pub fn parse_realtime_payload(payload: &[u8]) -> Result<[u16; 2]> {
    if payload.len() < 4 {
        return Err(Error::InvalidData {
            context: format!("realtime payload too short: {} bytes", payload.len()),
        });
    }
    Ok([
        u16::from_le_bytes([payload[0], payload[1]]),
        u16::from_le_bytes([payload[2], payload[3]]),
    ])
}

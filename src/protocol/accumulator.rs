//! Inbound notification accumulation.
//!
//! BLE delivers replies in small chunks that can split an SOH frame across
//! notifications. [`NotifyAccumulator`] buffers inbound bytes and yields
//! complete, CRC-valid frames, resynchronizing on the next start marker
//! after garbage. [`NotifyRate`] tracks the notification cadence as a
//! diagnostic for sluggish probes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::protocol::soh::{SohFrame, HEADER_LEN, SOH, TRAILER_LEN};

/// Sliding window over which the notification rate is measured.
const RATE_WINDOW: Duration = Duration::from_secs(5);

/// Byte-stream accumulator for SOH-framed replies.
#[derive(Debug)]
pub struct NotifyAccumulator {
    buffer: BytesMut,
}

impl NotifyAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(64),
        }
    }

    /// Append an inbound chunk and extract every complete frame now
    /// available.
    ///
    /// Bytes preceding a start marker are dropped; a frame that fails to
    /// parse is skipped by resynchronizing on the next marker. Parse
    /// failures never propagate.
    pub fn push(&mut self, chunk: &[u8], crc_init: u16) -> Vec<SohFrame> {
        self.buffer.extend_from_slice(chunk);
        trace!("Accumulator holds {} bytes", self.buffer.len());

        let mut frames = Vec::new();

        loop {
            // Drop garbage before the next start marker.
            match self.buffer.iter().position(|&b| b == SOH) {
                Some(0) => {}
                Some(skip) => {
                    debug!("Dropping {} bytes before start marker", skip);
                    let _ = self.buffer.split_to(skip);
                }
                None => {
                    self.buffer.clear();
                    break;
                }
            }

            if self.buffer.len() < HEADER_LEN {
                break;
            }

            let payload_len = u16::from_le_bytes([self.buffer[3], self.buffer[4]]) as usize;
            let total = HEADER_LEN + payload_len + TRAILER_LEN;
            if self.buffer.len() < total {
                break;
            }

            let candidate = self.buffer.split_to(total);
            match SohFrame::parse(&candidate, crc_init) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    // Resync: put everything after the bad marker back and
                    // scan for the next one.
                    debug!("Dropping malformed frame: {}", e);
                    let mut rest = BytesMut::from(&candidate[1..]);
                    rest.unsplit(self.buffer.split_off(0));
                    self.buffer = rest;
                }
            }
        }

        frames
    }

    /// Number of buffered bytes awaiting a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discard any partial frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for NotifyAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Sliding-window notification rate tracker.
#[derive(Debug)]
pub struct NotifyRate {
    arrivals: VecDeque<Instant>,
}

impl NotifyRate {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            arrivals: VecDeque::with_capacity(32),
        }
    }

    /// Record one notification arrival.
    pub fn record(&mut self) {
        let now = Instant::now();
        self.arrivals.push_back(now);
        while let Some(&front) = self.arrivals.front() {
            if now.duration_since(front) > RATE_WINDOW {
                self.arrivals.pop_front();
            } else {
                break;
            }
        }
    }

    /// Notifications per second over the measurement window.
    pub fn rate_hz(&self) -> f64 {
        self.arrivals.len() as f64 / RATE_WINDOW.as_secs_f64()
    }
}

impl Default for NotifyRate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::crc::CRC_INIT_TR4X;
    use crate::protocol::soh::{CMD_REALTIME, SUB_REALTIME_ALL};

    fn realtime_reply() -> Vec<u8> {
        SohFrame {
            command: CMD_REALTIME,
            status: 0,
            payload: vec![0xE8, 0x03, 0x3A, 0x07],
        }
        .encode(CRC_INIT_TR4X)
    }

    #[test]
    fn test_whole_frame_in_one_chunk() {
        let mut acc = NotifyAccumulator::new();
        let frames = acc.push(&realtime_reply(), CRC_INIT_TR4X);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, CMD_REALTIME);
        assert_eq!(acc.buffered(), 0);
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let bytes = realtime_reply();
        let mut acc = NotifyAccumulator::new();

        assert!(acc.push(&bytes[..4], CRC_INIT_TR4X).is_empty());
        assert!(acc.push(&bytes[4..7], CRC_INIT_TR4X).is_empty());
        let frames = acc.push(&bytes[7..], CRC_INIT_TR4X);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let mut bytes = realtime_reply();
        bytes.extend_from_slice(&realtime_reply());
        let mut acc = NotifyAccumulator::new();
        let frames = acc.push(&bytes, CRC_INIT_TR4X);
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_garbage_before_marker_dropped() {
        let mut bytes = vec![0x00, 0xFF, 0x42];
        bytes.extend_from_slice(&realtime_reply());
        let mut acc = NotifyAccumulator::new();
        let frames = acc.push(&bytes, CRC_INIT_TR4X);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_corrupt_frame_resyncs_to_next() {
        let mut corrupt = realtime_reply();
        corrupt[6] ^= 0xFF; // break the CRC but keep the length field
        let mut bytes = corrupt;
        bytes.extend_from_slice(&realtime_reply());

        let mut acc = NotifyAccumulator::new();
        let frames = acc.push(&bytes, CRC_INIT_TR4X);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_request_frame_round_trips_through_accumulator() {
        let bytes = SohFrame::request(CMD_REALTIME, SUB_REALTIME_ALL).encode(CRC_INIT_TR4X);
        let mut acc = NotifyAccumulator::new();
        let frames = acc.push(&bytes, CRC_INIT_TR4X);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, vec![SUB_REALTIME_ALL]);
    }

    #[test]
    fn test_rate_tracker() {
        let mut rate = NotifyRate::new();
        assert_eq!(rate.rate_hz(), 0.0);
        for _ in 0..10 {
            rate.record();
        }
        assert!(rate.rate_hz() > 0.0);
    }
}

//! Envelope wrapping and multi-block fragmentation for the MD8000 family.
//!
//! A logical command is wrapped twice before transmission: the inner SOH
//! frame is placed in an envelope carrying its own length and CRC, the
//! envelope plus a trailing additive checksum is then split into a 20-byte
//! header packet announcing the total length followed by 20-byte numbered
//! data blocks (4-byte block header, up to 16 payload bytes each). Replies
//! arrive the same way and are reassembled by [`BlockAssembler`].

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::crc::{append_crc, verify_trailing_crc, CRC_INIT_MD8000};

/// Envelope start marker.
pub const STX: u8 = 0x02;
/// Envelope command wrapping a request.
pub const ENV_CMD_REQUEST: u8 = 0x10;
/// Envelope command wrapping a reply.
pub const ENV_CMD_REPLY: u8 = 0x90;

/// Every transport packet is at most this long.
pub const BLOCK_SIZE: usize = 20;
/// Data block payload capacity: block size minus the 4-byte block header.
pub const BLOCK_PAYLOAD_MAX: usize = 16;

/// Packet marker byte shared by header and data packets.
const PACKET_MARKER: u8 = 0xAA;
/// Packet type: header packet announcing total length.
const PACKET_TYPE_HEADER: u8 = 0x01;
/// Packet type: numbered data block.
const PACKET_TYPE_DATA: u8 = 0x02;

/// Additive checksum: sum of all bytes, modulo 256.
pub fn additive_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Wrap an encoded inner frame in an envelope with its own length and CRC.
pub fn wrap_envelope(env_command: u8, inner: &[u8]) -> Vec<u8> {
    let mut env = Vec::with_capacity(4 + inner.len() + 2);
    env.push(STX);
    env.push(env_command);
    env.extend_from_slice(&(inner.len() as u16).to_le_bytes());
    env.extend_from_slice(inner);
    append_crc(CRC_INIT_MD8000, &env)
}

/// Validate and strip an envelope, returning the envelope command and the
/// inner frame bytes.
pub fn unwrap_envelope(env: &[u8]) -> Result<(u8, &[u8])> {
    if env.len() < 6 {
        return Err(Error::InvalidData {
            context: format!("envelope too short: {} bytes", env.len()),
        });
    }
    if env[0] != STX {
        return Err(Error::InvalidData {
            context: format!("bad envelope marker: {:#04x}", env[0]),
        });
    }

    let inner_len = u16::from_le_bytes([env[2], env[3]]) as usize;
    if env.len() != 4 + inner_len + 2 {
        return Err(Error::InvalidData {
            context: format!(
                "envelope length mismatch: have {} bytes, header says {}",
                env.len(),
                4 + inner_len + 2
            ),
        });
    }

    if !verify_trailing_crc(CRC_INIT_MD8000, env) {
        let expected = crate::protocol::crc::crc16(CRC_INIT_MD8000, &env[..env.len() - 2]);
        let actual = u16::from_be_bytes([env[env.len() - 2], env[env.len() - 1]]);
        return Err(Error::CrcMismatch { expected, actual });
    }

    Ok((env[1], &env[4..4 + inner_len]))
}

/// Split an envelope into transport packets: one header packet announcing
/// the total length (envelope plus additive checksum), then numbered data
/// blocks carrying the envelope bytes and the checksum byte.
pub fn split_blocks(envelope: &[u8]) -> Vec<Vec<u8>> {
    let mut stream = envelope.to_vec();
    stream.push(additive_checksum(envelope));

    let mut packets = Vec::with_capacity(1 + (stream.len() + BLOCK_PAYLOAD_MAX - 1) / BLOCK_PAYLOAD_MAX);

    let mut header = vec![0u8; BLOCK_SIZE];
    header[0] = PACKET_MARKER;
    header[1] = PACKET_TYPE_HEADER;
    header[2..4].copy_from_slice(&(stream.len() as u16).to_le_bytes());
    packets.push(header);

    for (block_no, chunk) in stream.chunks(BLOCK_PAYLOAD_MAX).enumerate() {
        let mut block = Vec::with_capacity(4 + chunk.len());
        block.push(PACKET_MARKER);
        block.push(PACKET_TYPE_DATA);
        block.extend_from_slice(&(block_no as u16).to_le_bytes());
        block.extend_from_slice(chunk);
        packets.push(block);
    }

    packets
}

/// Reassembles numbered data blocks into a checksum-validated envelope.
///
/// Blocks are accepted strictly in ascending order; a block whose number is
/// not the next expected counter is ignored without advancing assembly
/// state. A malformed or length-mismatched assembly is discarded and the
/// next header packet starts fresh.
#[derive(Debug)]
pub struct BlockAssembler {
    buffer: BytesMut,
    expected_total: usize,
    next_block: u16,
    in_progress: bool,
}

impl BlockAssembler {
    /// Create an idle assembler.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256),
            expected_total: 0,
            next_block: 0,
            in_progress: false,
        }
    }

    /// Feed one transport packet.
    ///
    /// Returns the envelope bytes (checksum validated and stripped) when the
    /// accumulated payload reaches the announced total, otherwise `None`.
    pub fn accept(&mut self, packet: &[u8]) -> Option<Vec<u8>> {
        if packet.len() < 4 || packet[0] != PACKET_MARKER {
            warn!("Ignoring unrecognized packet: {} bytes", packet.len());
            return None;
        }

        match packet[1] {
            PACKET_TYPE_HEADER => {
                self.reset();
                self.expected_total = u16::from_le_bytes([packet[2], packet[3]]) as usize;
                self.in_progress = true;
                debug!("Started block assembly, expecting {} bytes", self.expected_total);
                None
            }
            PACKET_TYPE_DATA => self.accept_data(packet),
            other => {
                warn!("Unknown packet type: {:#04x}", other);
                None
            }
        }
    }

    fn accept_data(&mut self, packet: &[u8]) -> Option<Vec<u8>> {
        if !self.in_progress {
            warn!("Data block received without header packet");
            return None;
        }

        let block_no = u16::from_le_bytes([packet[2], packet[3]]);
        if block_no != self.next_block {
            // Out-of-order or duplicate block. Ignored without advancing;
            // a gap means the total is never reached and the next poll
            // cycle starts fresh.
            warn!(
                "Ignoring block {}: expected {}",
                block_no, self.next_block
            );
            return None;
        }

        self.buffer.extend_from_slice(&packet[4..]);
        self.next_block = self.next_block.wrapping_add(1);

        if self.buffer.len() < self.expected_total {
            return None;
        }

        let stream = std::mem::take(&mut self.buffer);
        let complete = self.buffer_matches(&stream);
        self.reset();
        complete
    }

    fn buffer_matches(&self, stream: &[u8]) -> Option<Vec<u8>> {
        if stream.len() != self.expected_total || stream.len() < 2 {
            warn!(
                "Assembly length mismatch: have {} bytes, expected {}",
                stream.len(),
                self.expected_total
            );
            return None;
        }

        let (envelope, checksum) = stream.split_at(stream.len() - 1);
        if additive_checksum(envelope) != checksum[0] {
            warn!(
                "Assembly checksum mismatch: computed {:#04x}, got {:#04x}",
                additive_checksum(envelope),
                checksum[0]
            );
            return None;
        }

        debug!("Block assembly complete: {} bytes", envelope.len());
        Some(envelope.to_vec())
    }

    /// Discard any partial assembly.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected_total = 0;
        self.next_block = 0;
        self.in_progress = false;
    }

    /// Check whether an assembly is underway.
    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }
}

impl Default for BlockAssembler {
    fn default() -> Self {
        Self::new()
    }
}

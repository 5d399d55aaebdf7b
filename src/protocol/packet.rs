//! Update command packet framing.
//!
//! Every command and response travels in one fixed-size 64-byte HID report:
//!
//! ```text
//! +-----+-----+--------+----------------------------+
//! | CMD | ARG | CRC16  |          Payload           |
//! +-----+-----+--------+----------------------------+
//! | 1   | 1   | 2      |   up to 60, zero-padded    |
//! +-----+-----+--------+----------------------------+
//! ```
//!
//! The CRC field is computed over the fully zero-padded packet with the CRC
//! bytes themselves zeroed, then written little-endian at offset 2. Older
//! bootloaders in this family do not check it; their packets leave the field
//! zero. No CRC verification is performed on receive in either generation —
//! receive-side integrity is established by the verify loop, not by the
//! packet checksum.

use crate::error::{Error, Result};
use crate::protocol::crc::crc16;
use byteorder::{ByteOrder, LittleEndian};

/// Fixed length of every command and response report.
pub const PACKET_LEN: usize = 64;

/// Offset of the payload area within a packet.
pub const PAYLOAD_OFFSET: usize = 4;

/// Maximum payload a single packet can carry.
pub const MAX_PAYLOAD: usize = PACKET_LEN - PAYLOAD_OFFSET;

/// One fixed-size update command packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    buf: [u8; PACKET_LEN],
}

impl Packet {
    /// Build a command packet.
    ///
    /// Fails with [`Error::PayloadTooLarge`] when `payload` does not fit;
    /// an over-length payload is never truncated. When `with_crc` is set
    /// the CRC16 field is filled in, otherwise it stays zero.
    pub fn encode(opcode: u8, arg: u8, payload: &[u8], with_crc: bool) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD,
            });
        }

        let mut buf = [0u8; PACKET_LEN];
        buf[0] = opcode;
        buf[1] = arg;
        buf[PAYLOAD_OFFSET..PAYLOAD_OFFSET + payload.len()].copy_from_slice(payload);

        if with_crc {
            // CRC over the zero-padded packet with the CRC field still zero
            let crc = crc16(&buf);
            LittleEndian::write_u16(&mut buf[2..4], crc);
        }

        Ok(Self { buf })
    }

    /// Wrap a received report.
    ///
    /// Returns `None` unless `data` is exactly one packet long.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let buf: [u8; PACKET_LEN] = data.try_into().ok()?;
        Some(Self { buf })
    }

    /// Command opcode (byte 0).
    pub fn opcode(&self) -> u8 {
        self.buf[0]
    }

    /// Command argument (byte 1).
    pub fn arg(&self) -> u8 {
        self.buf[1]
    }

    /// CRC16 field (bytes 2-3, little-endian).
    pub fn crc_field(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[2..4])
    }

    /// Payload view (bytes 4.., zero padding included).
    pub fn payload(&self) -> &[u8] {
        &self.buf[PAYLOAD_OFFSET..]
    }

    /// The raw 64-byte report.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

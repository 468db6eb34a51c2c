//! Fixed-size packet header.
//!
//! **PacketHeader** (32 bytes, little-endian):
//! ```text
//! magic:          u32  (4)   "TSR0"
//! checksum:       u32  (4)   first 4 bytes of blake3(payload), 0 if empty
//! command:        u32  (4)
//! reserved:       u32  (4)
//! request_id:     u64  (8)
//! payload_length: u64  (8)
//! ```

use crate::error::TesseraError;

/// Encoded header size.
pub const HEADER_SIZE: usize = 32;

const MAGIC: [u8; 4] = *b"TSR0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub checksum: u32,
    pub command: u32,
    pub request_id: u64,
    pub payload_length: u64,
}

impl PacketHeader {
    pub fn new(command: u32, request_id: u64, payload_length: u64) -> Self {
        Self {
            checksum: 0,
            command,
            request_id,
            payload_length,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        buf[8..12].copy_from_slice(&self.command.to_le_bytes());
        buf[16..24].copy_from_slice(&self.request_id.to_le_bytes());
        buf[24..32].copy_from_slice(&self.payload_length.to_le_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, TesseraError> {
        if data.len() < HEADER_SIZE {
            return Err(TesseraError::InvalidPacketLength {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }
        if data[0..4] != MAGIC {
            return Err(TesseraError::InvalidMagic);
        }
        let u32_at = |at: usize| {
            u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
        };
        let u64_at = |at: usize| u32_at(at) as u64 | (u32_at(at + 4) as u64) << 32;
        let checksum = u32_at(4);
        let command = u32_at(8);
        Ok(Self {
            checksum,
            command,
            request_id: u64_at(16),
            payload_length: u64_at(24),
        })
    }
}

/// The checksum stored for `payload`.
pub fn payload_checksum(payload: &[u8]) -> u32 {
    if payload.is_empty() {
        return 0;
    }
    let hash = blake3::hash(payload);
    let b = hash.as_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let header = PacketHeader {
            checksum: 0xAABBCCDD,
            command: 0x0101,
            request_id: 9,
            payload_length: 1234,
        };
        let bytes = header.encode();
        assert_eq!(&bytes[0..4], b"TSR0");
        assert_eq!(&bytes[12..16], &[0, 0, 0, 0]);
        assert_eq!(&bytes[24..32], &1234u64.to_le_bytes());
        assert_eq!(PacketHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = PacketHeader::new(1, 0, 0).encode();
        bytes[3] = b'X';
        assert!(matches!(
            PacketHeader::decode(&bytes),
            Err(TesseraError::InvalidMagic)
        ));
    }

    #[test]
    fn empty_payload_has_zero_checksum() {
        assert_eq!(payload_checksum(&[]), 0);
        assert_ne!(payload_checksum(b"pixels"), 0);
    }
}

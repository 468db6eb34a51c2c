//! A header plus its payload.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::TesseraError;
use crate::header::{HEADER_SIZE, PacketHeader, payload_checksum};
use crate::message::Command;

/// Largest payload accepted in either direction.
pub const MAX_PAYLOAD_SIZE: usize = 256 * 1024 * 1024;
/// Largest buffered frame the codec tolerates.
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    header: PacketHeader,
    payload: Bytes,
}

impl Packet {
    pub fn new(command: Command, request_id: u64, payload: Bytes) -> Result<Self, TesseraError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TesseraError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let mut header = PacketHeader::new(command as u32, request_id, payload.len() as u64);
        header.checksum = payload_checksum(&payload);
        Ok(Self { header, payload })
    }

    /// Keep-alive with request id 0 and no payload.
    pub fn heartbeat() -> Self {
        Self {
            header: PacketHeader::new(Command::Ping as u32, 0, 0),
            payload: Bytes::new(),
        }
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn command(&self) -> Result<Command, TesseraError> {
        Command::try_from(self.header.command)
    }

    pub fn request_id(&self) -> u64 {
        self.header.request_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Size on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_slice(&self.header.encode());
        dst.put_slice(&self.payload);
    }

    /// Rebuild a packet from a decoded header and its payload, checking
    /// the length and checksum.
    pub fn from_parts(header: PacketHeader, payload: Bytes) -> Result<Self, TesseraError> {
        if payload.len() as u64 != header.payload_length {
            return Err(TesseraError::InvalidPacketLength {
                expected: header.payload_length as usize,
                actual: payload.len(),
            });
        }
        if payload_checksum(&payload) != header.checksum {
            return Err(TesseraError::ChecksumMismatch);
        }
        Ok(Self { header, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_covers_payload() {
        let packet = Packet::new(Command::FrameDataReady, 3, Bytes::from_static(b"ready")).unwrap();
        let header = *packet.header();
        assert_ne!(header.checksum, 0);

        assert!(Packet::from_parts(header, Bytes::from_static(b"ready")).is_ok());
        let err = Packet::from_parts(header, Bytes::from_static(b"reddy")).unwrap_err();
        assert!(matches!(err, TesseraError::ChecksumMismatch));
    }

    #[test]
    fn heartbeat_is_empty_ping() {
        let hb = Packet::heartbeat();
        assert_eq!(hb.command().unwrap(), Command::Ping);
        assert_eq!(hb.request_id(), 0);
        assert_eq!(hb.encoded_len(), HEADER_SIZE);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let header = PacketHeader::new(Command::Ping as u32, 0, 4);
        let err = Packet::from_parts(header, Bytes::from_static(b"ab")).unwrap_err();
        assert!(matches!(err, TesseraError::InvalidPacketLength { expected: 4, actual: 2 }));
    }
}

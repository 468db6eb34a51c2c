//! Length-delimited framing of [`Packet`]s for `tokio_util::codec::Framed`.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TesseraError;
use crate::header::{HEADER_SIZE, PacketHeader};
use crate::packet::{MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE, Packet};

#[derive(Debug, Default, Clone, Copy)]
pub struct NodeCodec;

impl Decoder for NodeCodec {
    type Item = Packet;
    type Error = TesseraError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = PacketHeader::decode(&src[..HEADER_SIZE])?;
        let payload_len = header.payload_length as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(TesseraError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if payload_len > 0 && header.checksum == 0 {
            return Err(TesseraError::InvalidHeader("checksum must be non-zero"));
        }

        let frame_len = HEADER_SIZE + payload_len;
        if frame_len > MAX_FRAME_SIZE {
            return Err(TesseraError::FrameTooLarge {
                size: frame_len,
                max: MAX_FRAME_SIZE,
            });
        }
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len);
        let payload = frame.split_off(HEADER_SIZE).freeze();
        Packet::from_parts(header, payload).map(Some)
    }
}

impl Encoder<Packet> for NodeCodec {
    type Error = TesseraError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

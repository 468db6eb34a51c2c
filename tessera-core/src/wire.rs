//! Pixel payload wire format.
//!
//! One transmitted image is a `FrameDataTransmit` packet whose payload
//! is a [`TransmitHeader`] followed by one block per enabled buffer,
//! color first.
//!
//! ## Image block
//!
//! **ImageHeader** (44 bytes, little-endian):
//! ```text
//! internal_format:  u32  (4)
//! external_format:  u32  (4)
//! pixel_size:       u32  (4)
//! viewport:         i32 × 4 (x, y, w, h)  (16)
//! compressor_name:  u32  (4)   0 = none
//! compressor_flags: u32  (4)
//! chunk_count:      u32  (4)   1 if uncompressed
//! quality:          f32  (4)
//! ```
//!
//! followed by `chunk_count` × (`u64` length + bytes).
//!
//! ## Transmit payload
//! ```text
//! header_len:  u32               (4)
//! header:      bincode TransmitHeader
//! blocks:      image block per buffer
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::compressor::{COMPRESSOR_NONE, CompressorFlags};
use crate::error::TesseraError;
use crate::frame_data::FrameDataParams;
use crate::packet::MAX_PAYLOAD_SIZE;
use crate::pixel::{CompressedData, PixelData};
use crate::types::{Buffer, Buffers, ObjectVersion, Viewport, Zoom, format};

/// Upper bound on chunks per buffer accepted from the network.
pub const MAX_CHUNKS: u32 = 1 << 16;

/// Upper bound on the flat size of one received buffer.
pub const MAX_IMAGE_BYTES: usize = MAX_PAYLOAD_SIZE;

// ── ImageHeader ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageHeader {
    pub internal_format: u32,
    pub external_format: u32,
    pub pixel_size: u32,
    pub viewport: Viewport,
    pub compressor_name: u32,
    pub compressor_flags: u32,
    pub chunk_count: u32,
    pub quality: f32,
}

impl ImageHeader {
    /// Encoded size on the wire.
    pub const SIZE: usize = 44;

    /// Serialize to bytes (little-endian).
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.internal_format.to_le_bytes());
        buf[4..8].copy_from_slice(&self.external_format.to_le_bytes());
        buf[8..12].copy_from_slice(&self.pixel_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.viewport.x.to_le_bytes());
        buf[16..20].copy_from_slice(&self.viewport.y.to_le_bytes());
        buf[20..24].copy_from_slice(&self.viewport.w.to_le_bytes());
        buf[24..28].copy_from_slice(&self.viewport.h.to_le_bytes());
        buf[28..32].copy_from_slice(&self.compressor_name.to_le_bytes());
        buf[32..36].copy_from_slice(&self.compressor_flags.to_le_bytes());
        buf[36..40].copy_from_slice(&self.chunk_count.to_le_bytes());
        buf[40..44].copy_from_slice(&self.quality.to_le_bytes());
        buf
    }

    /// Deserialize from bytes and check that the described image is
    /// addressable and within [`MAX_IMAGE_BYTES`].
    pub fn decode(data: &[u8]) -> Result<Self, TesseraError> {
        if data.len() < Self::SIZE {
            return Err(TesseraError::InvalidPacketLength {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let u32_at = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let i32_at = |at: usize| u32_at(at) as i32;
        let header = Self {
            internal_format: u32_at(0),
            external_format: u32_at(4),
            pixel_size: u32_at(8),
            viewport: Viewport::new(i32_at(12), i32_at(16), i32_at(20), i32_at(24)),
            compressor_name: u32_at(28),
            compressor_flags: u32_at(32),
            chunk_count: u32_at(36),
            quality: f32::from_bits(u32_at(40)),
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<(), TesseraError> {
        let vp = self.viewport;
        if vp.x < 0 || vp.y < 0 || vp.w < 0 || vp.h < 0 {
            return Err(TesseraError::InvalidHeader("negative image viewport"));
        }
        if vp.x.checked_add(vp.w).is_none() || vp.y.checked_add(vp.h).is_none() {
            return Err(TesseraError::InvalidHeader("image viewport overflows"));
        }
        let pixel_size = format::pixel_size(self.external_format).ok_or(
            TesseraError::UnknownVariant {
                type_name: "external format",
                value: self.external_format as u64,
            },
        )?;
        if pixel_size != self.pixel_size {
            return Err(TesseraError::InvalidHeader("pixel size does not match the format"));
        }
        if self.chunk_count > MAX_CHUNKS {
            return Err(TesseraError::InvalidHeader("chunk count out of range"));
        }
        match vp.area().checked_mul(pixel_size as usize) {
            Some(bytes) if bytes <= MAX_IMAGE_BYTES => Ok(()),
            _ => Err(TesseraError::InvalidHeader("image exceeds the size limit")),
        }
    }
}

// ── Image blocks ─────────────────────────────────────────────────

/// Append one buffer's header and chunks to `out`.
pub fn encode_buffer(out: &mut BytesMut, data: &PixelData, quality: f32) {
    let (name, flags, chunk_count) = match &data.compressed {
        Some(c) => (c.compressor, c.flags.bits(), c.chunks.len() as u32),
        None => (COMPRESSOR_NONE, 0, 1),
    };
    let header = ImageHeader {
        internal_format: data.internal_format,
        external_format: data.external_format,
        pixel_size: data.pixel_size,
        viewport: data.viewport,
        compressor_name: name,
        compressor_flags: flags,
        chunk_count,
        quality,
    };
    out.put_slice(&header.encode());
    match &data.compressed {
        Some(c) => {
            for chunk in &c.chunks {
                out.put_u64_le(chunk.len() as u64);
                out.put_slice(chunk);
            }
        }
        None => {
            out.put_u64_le(data.pixels.len() as u64);
            out.put_slice(&data.pixels);
        }
    }
}

/// One decoded buffer block.
#[derive(Debug, Clone)]
pub struct DecodedBuffer {
    pub buffer: Buffer,
    pub quality: f32,
    /// Flat for the null compressor, compressed chunks otherwise.
    pub data: PixelData,
}

/// Decode the blocks for `buffers` (color first) from `src`.
pub fn decode_buffers(buffers: Buffers, src: &Bytes) -> Result<Vec<DecodedBuffer>, TesseraError> {
    let mut at = 0usize;
    let mut decoded = Vec::new();
    for buffer in buffers.each() {
        let header = ImageHeader::decode(&src[at.min(src.len())..])?;
        at += ImageHeader::SIZE;

        let mut chunks = Vec::with_capacity(header.chunk_count as usize);
        for _ in 0..header.chunk_count {
            let len_end = at + 8;
            if len_end > src.len() {
                return Err(TesseraError::InvalidPacketLength {
                    expected: len_end,
                    actual: src.len(),
                });
            }
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&src[at..len_end]);
            let len = u64::from_le_bytes(len_bytes) as usize;
            let end = len_end
                .checked_add(len)
                .filter(|end| *end <= src.len())
                .ok_or(TesseraError::InvalidPacketLength {
                    expected: len_end.saturating_add(len),
                    actual: src.len(),
                })?;
            chunks.push(src.slice(len_end..end));
            at = end;
        }

        let mut data = PixelData {
            internal_format: header.internal_format,
            external_format: header.external_format,
            pixel_size: header.pixel_size,
            viewport: header.viewport,
            pixels: Vec::new(),
            compressed: None,
        };
        if header.compressor_name == COMPRESSOR_NONE {
            if chunks.len() != 1 {
                return Err(TesseraError::InvalidHeader("uncompressed block needs one chunk"));
            }
            data.pixels = chunks[0].to_vec();
            data.validate()?;
        } else {
            data.compressed = Some(CompressedData {
                compressor: header.compressor_name,
                flags: CompressorFlags::from_bits_truncate(header.compressor_flags),
                chunks,
            });
        }
        decoded.push(DecodedBuffer {
            buffer,
            quality: header.quality,
            data,
        });
    }
    Ok(decoded)
}

// ── Transmit / ready payloads ────────────────────────────────────

/// Context preceding the image blocks of one transmitted image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmitHeader {
    /// Destination frame data and the version the image belongs to.
    pub frame_data: ObjectVersion,
    pub viewport: Viewport,
    pub zoom: Zoom,
    pub buffers: Buffers,
    pub frame_number: u32,
    pub use_alpha: bool,
}

impl TransmitHeader {
    /// Build the full transmit payload around pre-encoded blocks.
    pub fn encode_with(&self, blocks: &[u8]) -> Result<Bytes, TesseraError> {
        let header = bincode::serialize(self)?;
        let mut out = BytesMut::with_capacity(4 + header.len() + blocks.len());
        out.put_u32_le(header.len() as u32);
        out.put_slice(&header);
        out.put_slice(blocks);
        Ok(out.freeze())
    }

    /// Split a transmit payload into its header and block bytes.
    pub fn decode_from(payload: &Bytes) -> Result<(Self, Bytes), TesseraError> {
        if payload.len() < 4 {
            return Err(TesseraError::InvalidPacketLength {
                expected: 4,
                actual: payload.len(),
            });
        }
        let len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
        let end = 4 + len;
        if payload.len() < end {
            return Err(TesseraError::InvalidPacketLength {
                expected: end,
                actual: payload.len(),
            });
        }
        let header = bincode::deserialize(&payload[4..end])?;
        Ok((header, payload.slice(end..)))
    }
}

/// Marks a frame data version ready at the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadySignal {
    pub frame_data: ObjectVersion,
    pub frame_number: u32,
    pub params: FrameDataParams,
}

impl ReadySignal {
    pub fn encode(&self) -> Result<Bytes, TesseraError> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, TesseraError> {
        Ok(bincode::deserialize(payload)?)
    }
}

// ── Tests ────────────────────────────────────────────────────────

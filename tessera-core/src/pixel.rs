//! Described blocks of pixel memory.
//!
//! A [`PixelData`] is either *flat* (`pixels` holds
//! `viewport.area() * pixel_size` bytes, rows top to bottom) or
//! *compressed* (`compressed` holds one or more chunks produced by a
//! named compressor). Both representations may coexist when an image
//! caches the compressed form of its flat pixels for transmission.

use bytes::Bytes;

use crate::compressor::{COMPRESSOR_NONE, CompressorFlags};
use crate::error::TesseraError;
use crate::types::{Buffer, Viewport, format};

// ── CompressedData ───────────────────────────────────────────────

/// Output of a compressor: ordered chunks plus the parameters needed
/// to pick the matching decompressor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedData {
    /// Compressor name, never [`COMPRESSOR_NONE`].
    pub compressor: u32,
    pub flags: CompressorFlags,
    pub chunks: Vec<Bytes>,
}

impl CompressedData {
    /// Total payload bytes across chunks.
    pub fn byte_len(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }
}

// ── PixelData ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PixelData {
    pub internal_format: u32,
    /// Memory and wire layout of `pixels`.
    pub external_format: u32,
    /// Bytes per pixel in the external format.
    pub pixel_size: u32,
    pub viewport: Viewport,
    pub pixels: Vec<u8>,
    pub compressed: Option<CompressedData>,
}

impl PixelData {
    /// Zero-filled flat data for `viewport` in the given formats.
    pub fn new(
        internal_format: u32,
        external_format: u32,
        viewport: Viewport,
    ) -> Result<Self, TesseraError> {
        let pixel_size = format::pixel_size(external_format).ok_or(
            TesseraError::UnknownVariant {
                type_name: "external format",
                value: external_format as u64,
            },
        )?;
        let len = viewport
            .area()
            .checked_mul(pixel_size as usize)
            .ok_or(TesseraError::InvalidHeader("pixel data size overflows"))?;
        Ok(Self {
            internal_format,
            external_format,
            pixel_size,
            viewport,
            pixels: vec![0; len],
            compressed: None,
        })
    }

    /// Flat data filled with the clear value of `buffer`: depth `0xFF`,
    /// RGBA/BGRA zero with opaque alpha, anything else zero.
    pub fn cleared(
        buffer: Buffer,
        internal_format: u32,
        external_format: u32,
        viewport: Viewport,
    ) -> Result<Self, TesseraError> {
        let mut data = Self::new(internal_format, external_format, viewport)?;
        match (buffer, external_format) {
            (Buffer::Depth, _) => data.pixels.fill(0xFF),
            (_, format::RGBA) | (_, format::BGRA) => {
                data.pixels.chunks_exact_mut(4).for_each(|px| px[3] = 0xFF)
            }
            _ => {}
        }
        Ok(data)
    }

    /// Flat data from existing bytes; the length must match the viewport.
    pub fn from_pixels(
        internal_format: u32,
        external_format: u32,
        viewport: Viewport,
        pixels: Vec<u8>,
    ) -> Result<Self, TesseraError> {
        let mut data = Self::new(internal_format, external_format, Viewport::default())?;
        data.viewport = viewport;
        data.pixels = pixels;
        data.validate()?;
        Ok(data)
    }

    /// Expected size of the flat representation.
    pub fn byte_len(&self) -> usize {
        self.viewport.area().saturating_mul(self.pixel_size as usize)
    }

    /// Bytes per row of the flat representation.
    pub fn row_len(&self) -> usize {
        self.viewport.w.max(0) as usize * self.pixel_size as usize
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed.is_some()
    }

    /// The compressor tag carried on the wire.
    pub fn compressor_name(&self) -> u32 {
        self.compressed
            .as_ref()
            .map_or(COMPRESSOR_NONE, |c| c.compressor)
    }

    pub fn row(&self, y: usize) -> &[u8] {
        let len = self.row_len();
        &self.pixels[y * len..(y + 1) * len]
    }

    /// Check the flat/compressed representation invariants.
    pub fn validate(&self) -> Result<(), TesseraError> {
        if let Some(compressed) = &self.compressed {
            if compressed.compressor == COMPRESSOR_NONE {
                return Err(TesseraError::ProtocolViolation(
                    "compressed pixel data tagged with the null compressor",
                ));
            }
            if compressed.chunks.is_empty() && self.viewport.has_area() {
                return Err(TesseraError::ProtocolViolation(
                    "compressed pixel data without chunks",
                ));
            }
            return Ok(());
        }
        if self.pixels.len() != self.byte_len() {
            return Err(TesseraError::InvalidPacketLength {
                expected: self.byte_len(),
                actual: self.pixels.len(),
            });
        }
        Ok(())
    }

    /// Copy the sub-rectangle `region` (absolute coordinates) into new
    /// flat data. Returns `None` when `region` misses this data.
    pub fn crop(&self, region: &Viewport) -> Option<PixelData> {
        let clipped = self.viewport.intersect(region);
        if !clipped.has_area() || self.pixels.len() != self.byte_len() {
            return None;
        }
        let ps = self.pixel_size as usize;
        let src_row = self.row_len();
        let dst_row = clipped.w as usize * ps;
        let x0 = (clipped.x - self.viewport.x) as usize * ps;
        let y0 = (clipped.y - self.viewport.y) as usize;

        let mut pixels = Vec::with_capacity(clipped.area() * ps);
        for y in 0..clipped.h as usize {
            let start = (y0 + y) * src_row + x0;
            pixels.extend_from_slice(&self.pixels[start..start + dst_row]);
        }
        Some(PixelData {
            internal_format: self.internal_format,
            external_format: self.external_format,
            pixel_size: self.pixel_size,
            viewport: clipped,
            pixels,
            compressed: None,
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────

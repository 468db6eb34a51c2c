//! Pixel compressors and the registry that selects them.
//!
//! The engine never names a concrete codec. It asks an injected
//! [`CompressorRegistry`] to pick one for an external format, a minimum
//! quality and an alpha-significance flag, then compresses and
//! decompresses through the same registry.
//!
//! [`BuiltinCompressors`] is the default registry:
//!
//! | Name            | Tokens             | Quality | Alpha    |
//! |-----------------|--------------------|---------|----------|
//! | `ZSTD`          | every known format | 1.0     | kept     |
//! | `ZSTD_NO_ALPHA` | `RGBA`, `BGRA`     | 1.0     | dropped  |
//!
//! Flat pixels are cut into row bands, each band compressed on the
//! rayon pool into one chunk. With `n` chunks over `rows` rows, band `i`
//! spans rows `rows * i / n .. rows * (i + 1) / n`, so the receiver knows
//! the decoded size of every chunk before decompressing it.

use bitflags::bitflags;
use bytes::Bytes;
use rayon::prelude::*;

use crate::error::TesseraError;
use crate::pixel::PixelData;
use crate::types::{Buffer, format};

// ── Names & flags ────────────────────────────────────────────────

/// The null compressor, `0` on the wire.
pub const COMPRESSOR_NONE: u32 = 0;
/// Local request to let the image pick a compressor. Never transmitted.
pub const COMPRESSOR_AUTO: u32 = 0xFFFF_FFFF;
pub const COMPRESSOR_ZSTD: u32 = 0x10;
pub const COMPRESSOR_ZSTD_NO_ALPHA: u32 = 0x11;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CompressorFlags: u32 {
        /// Input is a 2D pixel rectangle rather than a flat byte run.
        const DATA_2D = 0x1;
        /// The alpha channel carries no information.
        const IGNORE_ALPHA = 0x2;
    }
}

/// Static description of a compressor.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressorInfo {
    pub name: u32,
    /// External formats the compressor accepts.
    pub tokens: Vec<u32>,
    /// Reconstruction quality, `1.0` for lossless.
    pub quality: f32,
    /// Expected output/input size ratio; lower is better.
    pub ratio: f32,
    /// Output omits the alpha channel.
    pub ignores_alpha: bool,
}

// ── CompressorRegistry ───────────────────────────────────────────

/// Capability-query interface over the available compressors.
pub trait CompressorRegistry: Send + Sync {
    /// Best compressor for `external_format` reaching `min_quality`.
    /// Compressors that drop alpha qualify only when `ignore_alpha`.
    fn choose(&self, external_format: u32, min_quality: f32, ignore_alpha: bool) -> Option<u32>;

    fn info(&self, name: u32) -> Option<CompressorInfo>;

    /// Compress the flat pixels of `data` into ordered chunks.
    fn compress(
        &self,
        name: u32,
        data: &PixelData,
        flags: CompressorFlags,
    ) -> Result<Vec<Bytes>, TesseraError>;

    /// Decompress `chunks` into the flat pixels of `out`. The formats
    /// and viewport of `out` are already set.
    fn decompress(
        &self,
        name: u32,
        chunks: &[Bytes],
        flags: CompressorFlags,
        out: &mut PixelData,
    ) -> Result<(), TesseraError>;
}

// ── BuiltinCompressors ───────────────────────────────────────────

/// zstd-backed default registry.
pub struct BuiltinCompressors {
    /// zstd level, 1 favours speed.
    level: i32,
    /// Rows per chunk.
    band_rows: usize,
}

impl BuiltinCompressors {
    pub fn new() -> Self {
        Self {
            level: 1,
            band_rows: 64,
        }
    }

    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level.clamp(1, 19);
        self
    }

    pub fn with_band_rows(mut self, rows: usize) -> Self {
        self.band_rows = rows.max(1);
        self
    }

    fn catalog() -> [CompressorInfo; 2] {
        [
            CompressorInfo {
                name: COMPRESSOR_ZSTD,
                tokens: vec![
                    format::RGB,
                    format::RGBA,
                    format::BGRA,
                    format::RGB10_A2,
                    format::RGBA16F,
                    format::RGBA32F,
                    format::DEPTH_UNSIGNED_INT,
                ],
                quality: 1.0,
                ratio: 0.5,
                ignores_alpha: false,
            },
            CompressorInfo {
                name: COMPRESSOR_ZSTD_NO_ALPHA,
                tokens: vec![format::RGBA, format::BGRA],
                quality: 1.0,
                ratio: 0.4,
                ignores_alpha: true,
            },
        ]
    }
}

impl Default for BuiltinCompressors {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressorRegistry for BuiltinCompressors {
    fn choose(&self, external_format: u32, min_quality: f32, ignore_alpha: bool) -> Option<u32> {
        Self::catalog()
            .into_iter()
            .filter(|c| c.tokens.contains(&external_format))
            .filter(|c| c.quality >= min_quality)
            .filter(|c| ignore_alpha || !c.ignores_alpha)
            .min_by(|a, b| a.ratio.total_cmp(&b.ratio))
            .map(|c| c.name)
    }

    fn info(&self, name: u32) -> Option<CompressorInfo> {
        Self::catalog().into_iter().find(|c| c.name == name)
    }

    fn compress(
        &self,
        name: u32,
        data: &PixelData,
        _flags: CompressorFlags,
    ) -> Result<Vec<Bytes>, TesseraError> {
        let strip_alpha = match name {
            COMPRESSOR_ZSTD => false,
            COMPRESSOR_ZSTD_NO_ALPHA => true,
            _ => {
                return Err(TesseraError::MissingCompressor {
                    name,
                    buffer: buffer_of(data),
                });
            }
        };
        if data.pixels.len() != data.byte_len() {
            return Err(TesseraError::ProtocolViolation(
                "compressing pixel data without flat pixels",
            ));
        }
        if strip_alpha && data.pixel_size != 4 {
            return Err(TesseraError::Compression(format!(
                "alpha stripping needs 4-byte pixels, got {}",
                data.pixel_size
            )));
        }

        if data.pixels.is_empty() {
            return Ok(Vec::new());
        }
        let rows = data.viewport.h.max(0) as usize;
        let row_len = data.row_len();
        let bands = rows.div_ceil(self.band_rows);
        let level = self.level;
        (0..bands)
            .into_par_iter()
            .map(|index| {
                let (first, last) = band_span(rows, bands, index);
                let band = &data.pixels[first * row_len..last * row_len];
                let packed;
                let input = if strip_alpha {
                    packed = band
                        .chunks_exact(4)
                        .flat_map(|px| [px[0], px[1], px[2]])
                        .collect::<Vec<u8>>();
                    packed.as_slice()
                } else {
                    band
                };
                zstd::encode_all(input, level)
                    .map(Bytes::from)
                    .map_err(|e| TesseraError::Compression(format!("zstd encode failed: {e}")))
            })
            .collect()
    }

    fn decompress(
        &self,
        name: u32,
        chunks: &[Bytes],
        _flags: CompressorFlags,
        out: &mut PixelData,
    ) -> Result<(), TesseraError> {
        let restore_alpha = match name {
            COMPRESSOR_ZSTD => false,
            COMPRESSOR_ZSTD_NO_ALPHA => true,
            _ => {
                return Err(TesseraError::MissingCompressor {
                    name,
                    buffer: buffer_of(out),
                });
            }
        };

        if restore_alpha && out.pixel_size != 4 {
            return Err(TesseraError::Compression(format!(
                "alpha restoring needs 4-byte pixels, got {}",
                out.pixel_size
            )));
        }
        let rows = out.viewport.h.max(0) as usize;
        if chunks.len() > rows {
            return Err(TesseraError::InvalidHeader("more compressed bands than rows"));
        }
        let packed_row = if restore_alpha {
            out.viewport.w.max(0) as usize * 3
        } else {
            out.row_len()
        };

        // Each band decodes into at most its known size.
        let bands = chunks
            .par_iter()
            .enumerate()
            .map(|(index, chunk)| {
                let (first, last) = band_span(rows, chunks.len(), index);
                let expected = (last - first) * packed_row;
                let band = zstd::bulk::decompress(chunk.as_ref(), expected)
                    .map_err(|e| TesseraError::Compression(format!("zstd decode failed: {e}")))?;
                if band.len() != expected {
                    return Err(TesseraError::InvalidPacketLength {
                        expected,
                        actual: band.len(),
                    });
                }
                Ok(band)
            })
            .collect::<Result<Vec<Vec<u8>>, TesseraError>>()?;

        let mut pixels = Vec::with_capacity(out.byte_len());
        for band in bands {
            if restore_alpha {
                for px in band.chunks_exact(3) {
                    pixels.extend_from_slice(&[px[0], px[1], px[2], 0xFF]);
                }
            } else {
                pixels.extend_from_slice(&band);
            }
        }

        if pixels.len() != out.byte_len() {
            return Err(TesseraError::InvalidPacketLength {
                expected: out.byte_len(),
                actual: pixels.len(),
            });
        }
        out.pixels = pixels;
        Ok(())
    }
}

/// Rows `first..last` covered by band `index` of `bands`.
fn band_span(rows: usize, bands: usize, index: usize) -> (usize, usize) {
    (rows * index / bands, rows * (index + 1) / bands)
}

fn buffer_of(data: &PixelData) -> Buffer {
    if data.external_format == format::DEPTH_UNSIGNED_INT {
        Buffer::Depth
    } else {
        Buffer::Color
    }
}

// ── Tests ────────────────────────────────────────────────────────

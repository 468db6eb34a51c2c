//! Images: up to two pixel attachments plus their lifecycle state.
//!
//! ```text
//!            start_readback (sync)
//!   Invalid ─────────────────────────────▶ Valid
//!      │                                     ▲
//!      │ start_readback (async)              │ finish_readback
//!      ▼                                     │
//!   DownloadInProgress ──────────────────────┘
//! ```
//!
//! `set_viewport`, `reset` and `flush` send every attachment back to
//! `Invalid`. Compressed data is cached per attachment and dropped
//! whenever the flat pixels or the alpha usage change.

use tracing::{debug, warn};

use crate::compressor::{COMPRESSOR_AUTO, COMPRESSOR_NONE, CompressorFlags, CompressorRegistry};
use crate::error::TesseraError;
use crate::pixel::{CompressedData, PixelData};
use crate::renderer::{Readback, ReadbackHandle, Renderer, TextureHandle};
use crate::types::{Buffer, Buffers, StorageType, Viewport, Zoom, format};

// ── AttachmentState ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachmentState {
    #[default]
    Invalid,
    Valid,
    DownloadInProgress,
}

// ── Attachment ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Attachment {
    state: AttachmentState,
    memory: PixelData,
    texture: Option<TextureHandle>,
    /// Minimum reconstruction quality, `1.0` requests lossless.
    quality: f32,
    /// Requested compressor, possibly [`COMPRESSOR_AUTO`].
    compressor: u32,
}

impl Default for Attachment {
    fn default() -> Self {
        Self {
            state: AttachmentState::Invalid,
            memory: PixelData::default(),
            texture: None,
            quality: 1.0,
            compressor: COMPRESSOR_AUTO,
        }
    }
}

impl Attachment {
    fn invalidate(&mut self) {
        self.state = AttachmentState::Invalid;
        self.memory.compressed = None;
    }

    fn install(&mut self, data: PixelData) -> Result<(), TesseraError> {
        data.validate()?;
        if data.pixels.is_empty() && data.viewport.has_area() {
            return Err(TesseraError::ProtocolViolation(
                "empty pixel data for a non-empty viewport",
            ));
        }
        self.state = if data.viewport.has_area() {
            AttachmentState::Valid
        } else {
            AttachmentState::Invalid
        };
        self.memory = data;
        Ok(())
    }
}

// ── Image ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Image {
    viewport: Viewport,
    zoom: Zoom,
    storage: StorageType,
    attachments: [Attachment; 2],
    ignore_alpha: bool,
    premultiplied_alpha: bool,
    pending: Option<ReadbackHandle>,
}

impl Image {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return to the freshly allocated state, keeping buffer memory.
    pub fn reset(&mut self) {
        self.ignore_alpha = false;
        self.premultiplied_alpha = false;
        self.zoom = Zoom::NONE;
        self.pending = None;
        self.set_viewport(Viewport::default());
    }

    /// Release all pixel memory.
    pub fn flush(&mut self) {
        for att in &mut self.attachments {
            att.invalidate();
            att.memory = PixelData::default();
            att.texture = None;
        }
        self.pending = None;
    }

    // ── Parameters ───────────────────────────────────────────────

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
        for att in &mut self.attachments {
            att.invalidate();
        }
    }

    pub fn zoom(&self) -> Zoom {
        self.zoom
    }

    pub fn set_zoom(&mut self, zoom: Zoom) {
        self.zoom = zoom;
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage
    }

    pub fn set_storage_type(&mut self, storage: StorageType) {
        self.storage = storage;
    }

    /// Declare whether the alpha channel carries information.
    pub fn set_alpha_usage(&mut self, use_alpha: bool) {
        if self.ignore_alpha != use_alpha {
            return;
        }
        self.ignore_alpha = !use_alpha;
        for att in &mut self.attachments {
            att.memory.compressed = None;
        }
    }

    pub fn ignores_alpha(&self) -> bool {
        self.ignore_alpha
    }

    pub fn set_premultiplied_alpha(&mut self, premultiplied: bool) {
        self.premultiplied_alpha = premultiplied;
    }

    pub fn has_premultiplied_alpha(&self) -> bool {
        self.premultiplied_alpha
    }

    /// Valid color data whose format carries an alpha channel.
    pub fn has_alpha(&self) -> bool {
        self.has_pixel_data(Buffer::Color)
            && format::has_alpha(self.attachment(Buffer::Color).memory.external_format)
    }

    pub fn set_quality(&mut self, buffer: Buffer, quality: f32) {
        let att = self.attachment_mut(buffer);
        if att.quality != quality {
            att.quality = quality;
            att.memory.compressed = None;
        }
    }

    pub fn quality(&self, buffer: Buffer) -> f32 {
        self.attachment(buffer).quality
    }

    pub fn use_compressor(&mut self, buffer: Buffer, name: u32) {
        let att = self.attachment_mut(buffer);
        if att.compressor != name {
            att.compressor = name;
            att.memory.compressed = None;
        }
    }

    pub fn compressor(&self, buffer: Buffer) -> u32 {
        self.attachment(buffer).compressor
    }

    /// Formats used by the next readback of `buffer`.
    pub fn set_formats(&mut self, buffer: Buffer, internal: u32, external: u32) {
        let mem = &mut self.attachment_mut(buffer).memory;
        mem.internal_format = internal;
        mem.external_format = external;
        mem.pixel_size = format::pixel_size(external).unwrap_or(0);
    }

    pub fn internal_format(&self, buffer: Buffer) -> u32 {
        self.attachment(buffer).memory.internal_format
    }

    pub fn external_format(&self, buffer: Buffer) -> u32 {
        self.attachment(buffer).memory.external_format
    }

    pub fn pixel_size(&self, buffer: Buffer) -> u32 {
        self.attachment(buffer).memory.pixel_size
    }

    pub fn texture(&self, buffer: Buffer) -> Option<TextureHandle> {
        self.attachment(buffer).texture
    }

    pub fn set_texture(&mut self, buffer: Buffer, texture: Option<TextureHandle>) {
        self.attachment_mut(buffer).texture = texture;
    }

    // ── Pixel data ───────────────────────────────────────────────

    pub fn state(&self, buffer: Buffer) -> AttachmentState {
        self.attachment(buffer).state
    }

    pub fn has_pixel_data(&self, buffer: Buffer) -> bool {
        self.state(buffer) == AttachmentState::Valid
    }

    /// Buffers holding valid pixel data.
    pub fn buffers(&self) -> Buffers {
        Buffer::ALL
            .into_iter()
            .filter(|b| self.has_pixel_data(*b))
            .fold(Buffers::empty(), |acc, b| acc | b.mask())
    }

    pub fn pixel_data(&self, buffer: Buffer) -> &PixelData {
        &self.attachment(buffer).memory
    }

    /// Allocate `buffer` for the current viewport and fill it with its
    /// clear value.
    pub fn clear_pixel_data(&mut self, buffer: Buffer) -> Result<(), TesseraError> {
        let mem = &self.attachment(buffer).memory;
        let data = PixelData::cleared(buffer, mem.internal_format, mem.external_format, self.viewport)?;
        self.attachment_mut(buffer).install(data)
    }

    /// Take over flat `data` for `buffer`.
    pub fn set_flat_pixel_data(&mut self, buffer: Buffer, data: PixelData) -> Result<(), TesseraError> {
        if data.is_compressed() {
            return Err(TesseraError::ProtocolViolation(
                "compressed data handed to set_flat_pixel_data",
            ));
        }
        self.viewport = data.viewport;
        self.attachment_mut(buffer).install(data)
    }

    /// Take over `data` for `buffer`, decompressing through `registry`
    /// when it arrives compressed.
    pub fn set_pixel_data(
        &mut self,
        buffer: Buffer,
        data: PixelData,
        registry: &dyn CompressorRegistry,
    ) -> Result<(), TesseraError> {
        self.viewport = data.viewport;
        let Some(compressed) = data.compressed else {
            return self.attachment_mut(buffer).install(data);
        };

        // The decompressor fills `pixels`; nothing is allocated up front.
        let mut flat = PixelData {
            internal_format: data.internal_format,
            external_format: data.external_format,
            pixel_size: data.pixel_size,
            viewport: data.viewport,
            pixels: Vec::new(),
            compressed: None,
        };
        registry
            .decompress(compressed.compressor, &compressed.chunks, compressed.flags, &mut flat)
            .map_err(|e| match e {
                TesseraError::MissingCompressor { name, .. } => {
                    TesseraError::MissingCompressor { name, buffer }
                }
                other => other,
            })?;
        self.attachment_mut(buffer).install(flat)
    }

    /// Pixel data of `buffer` in the form to transmit: compressed with
    /// the requested compressor, or flat when none applies.
    pub fn compress_pixel_data(
        &mut self,
        buffer: Buffer,
        registry: &dyn CompressorRegistry,
    ) -> Result<&PixelData, TesseraError> {
        if !self.has_pixel_data(buffer) {
            return Err(TesseraError::ProtocolViolation(
                "compressing an attachment without valid pixel data",
            ));
        }
        let ignore_alpha = self.ignore_alpha && self.has_alpha();
        let att = self.attachment_mut(buffer);
        if att.memory.compressed.is_some() || att.compressor == COMPRESSOR_NONE {
            return Ok(&att.memory);
        }

        let mut name = att.compressor;
        if name == COMPRESSOR_AUTO {
            match registry.choose(att.memory.external_format, att.quality, ignore_alpha) {
                Some(found) => name = found,
                None => {
                    warn!(
                        "no compressor for format {:#x} at quality {}; sending raw",
                        att.memory.external_format, att.quality
                    );
                    att.compressor = COMPRESSOR_NONE;
                    return Ok(&att.memory);
                }
            }
        }

        let mut flags = CompressorFlags::DATA_2D;
        if ignore_alpha {
            flags |= CompressorFlags::IGNORE_ALPHA;
        }
        let chunks = registry.compress(name, &att.memory, flags)?;
        debug!(
            ?buffer,
            compressor = name,
            chunks = chunks.len(),
            "compressed attachment"
        );
        att.memory.compressed = Some(CompressedData {
            compressor: name,
            flags,
            chunks,
        });
        Ok(&att.memory)
    }

    // ── Readback ─────────────────────────────────────────────────

    /// Start reading `buffers` of `viewport` back from `renderer`.
    /// Returns `true` when the readback completes asynchronously.
    pub fn start_readback(
        &mut self,
        buffers: Buffers,
        viewport: Viewport,
        zoom: Zoom,
        renderer: &dyn Renderer,
    ) -> Result<bool, TesseraError> {
        self.set_viewport(viewport);
        self.zoom = zoom;
        match renderer.begin_async_readback(buffers, viewport, zoom)? {
            Readback::Complete(results) => {
                self.install_readback(results)?;
                Ok(false)
            }
            Readback::Pending(handle) => {
                for buffer in buffers.each() {
                    self.attachment_mut(buffer).state = AttachmentState::DownloadInProgress;
                }
                self.pending = Some(handle);
                Ok(true)
            }
        }
    }

    pub fn has_async_readback(&self) -> bool {
        self.pending.is_some()
    }

    /// Complete an asynchronous readback. No-op without one.
    pub fn finish_readback(&mut self, renderer: &dyn Renderer) -> Result<(), TesseraError> {
        let Some(handle) = self.pending.take() else {
            return Ok(());
        };
        let results = renderer.finish_async_readback(handle);
        match results {
            Ok(results) => self.install_readback(results),
            Err(e) => {
                for att in &mut self.attachments {
                    if att.state == AttachmentState::DownloadInProgress {
                        att.invalidate();
                    }
                }
                Err(e)
            }
        }
    }

    fn install_readback(&mut self, results: Vec<(Buffer, PixelData)>) -> Result<(), TesseraError> {
        for (buffer, data) in results {
            self.attachment_mut(buffer).install(data)?;
        }
        Ok(())
    }

    // ── ROI support ──────────────────────────────────────────────

    /// Copy the part of every valid attachment inside `region` into a
    /// new image with the same settings.
    pub fn crop(&self, region: &Viewport) -> Option<Image> {
        let clipped = self.viewport.intersect(region);
        if !clipped.has_area() {
            return None;
        }
        let mut out = Image {
            viewport: clipped,
            zoom: self.zoom,
            storage: self.storage,
            attachments: Default::default(),
            ignore_alpha: self.ignore_alpha,
            premultiplied_alpha: self.premultiplied_alpha,
            pending: None,
        };
        for (att, src) in out.attachments.iter_mut().zip(&self.attachments) {
            att.quality = src.quality;
            att.compressor = src.compressor;
            att.memory.internal_format = src.memory.internal_format;
            att.memory.external_format = src.memory.external_format;
            att.memory.pixel_size = src.memory.pixel_size;
            if src.state != AttachmentState::Valid {
                continue;
            }
            if let Some(data) = src.memory.crop(&clipped) {
                att.memory = data;
                att.state = AttachmentState::Valid;
            }
        }
        Some(out)
    }

    // ── Internal ─────────────────────────────────────────────────

    fn attachment(&self, buffer: Buffer) -> &Attachment {
        &self.attachments[buffer.index()]
    }

    fn attachment_mut(&mut self, buffer: Buffer) -> &mut Attachment {
        &mut self.attachments[buffer.index()]
    }
}

// ── Tests ────────────────────────────────────────────────────────

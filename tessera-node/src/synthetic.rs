//! Stand-in renderer for source nodes.
//!
//! Draws one opaque square per frame that slides across the viewport,
//! tinted and depth-offset by the node id so that several sources
//! composite into a recognisable picture. Readbacks complete
//! asynchronously to exercise the transfer path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tessera_core::renderer::{Readback, ReadbackHandle, Renderer};
use tessera_core::types::format;
use tessera_core::{Buffer, Buffers, DrawableConfig, PixelData, TesseraError, Viewport, Zoom};

/// Depth of the square for node 0; higher ids sit further back.
const BASE_DEPTH: u32 = 0x1000_0000;
const DEPTH_STEP: u32 = 0x0100_0000;

#[derive(Debug)]
pub struct SyntheticRenderer {
    node_id: u64,
    drawable: DrawableConfig,
    frame: AtomicU32,
    next_handle: AtomicU64,
    pending: Mutex<HashMap<u64, (Buffers, Viewport, u32)>>,
}

impl SyntheticRenderer {
    pub fn new(node_id: u64, drawable: DrawableConfig) -> Self {
        Self {
            node_id,
            drawable,
            frame: AtomicU32::new(0),
            next_handle: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Frame drawn by readbacks started from now on.
    pub fn set_frame(&self, frame_number: u32) {
        self.frame.store(frame_number, Ordering::Relaxed);
    }

    pub fn color(&self) -> [u8; 4] {
        let hue = (self.node_id as usize).wrapping_mul(0x9E37_79B9);
        [(hue >> 8) as u8 | 0x40, (hue >> 16) as u8 | 0x40, (hue >> 24) as u8 | 0x40, 255]
    }

    pub fn depth(&self) -> u32 {
        BASE_DEPTH.saturating_add(DEPTH_STEP.saturating_mul(self.node_id.min(200) as u32))
    }

    /// The square covered in `frame_number`, before clipping.
    pub fn square(&self, viewport: Viewport, frame_number: u32) -> Viewport {
        let side = (viewport.w.min(viewport.h) / 3).max(1);
        let travel = (viewport.w - side).max(1);
        let x = viewport.x + (frame_number as i32 * 8).rem_euclid(travel);
        let y = viewport.y + (viewport.h - side) / 2;
        Viewport::new(x, y, side, side)
    }

    fn render(
        &self,
        buffers: Buffers,
        viewport: Viewport,
        frame_number: u32,
    ) -> Result<Vec<(Buffer, PixelData)>, TesseraError> {
        let square = self.square(viewport, frame_number).intersect(&viewport);
        let mut out = Vec::new();
        for buffer in buffers.each() {
            let mut data = match buffer {
                Buffer::Color => PixelData::cleared(
                    buffer,
                    self.drawable.color_internal_format(),
                    format::RGBA,
                    viewport,
                )?,
                Buffer::Depth => {
                    PixelData::cleared(buffer, format::DEPTH, format::DEPTH_UNSIGNED_INT, viewport)?
                }
            };
            let sample = match buffer {
                Buffer::Color => self.color(),
                Buffer::Depth => self.depth().to_le_bytes(),
            };
            let row = viewport.w as usize * 4;
            for y in square.y..square.y_end() {
                let start = (y - viewport.y) as usize * row + (square.x - viewport.x) as usize * 4;
                data.pixels[start..start + square.w as usize * 4]
                    .chunks_exact_mut(4)
                    .for_each(|px| px.copy_from_slice(&sample));
            }
            out.push((buffer, data));
        }
        Ok(out)
    }
}

impl Renderer for SyntheticRenderer {
    fn begin_async_readback(
        &self,
        buffers: Buffers,
        viewport: Viewport,
        _zoom: Zoom,
    ) -> Result<Readback, TesseraError> {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let frame = self.frame.load(Ordering::Relaxed);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, (buffers, viewport, frame));
        Ok(Readback::Pending(ReadbackHandle(handle)))
    }

    fn finish_async_readback(
        &self,
        handle: ReadbackHandle,
    ) -> Result<Vec<(Buffer, PixelData)>, TesseraError> {
        let request = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.0);
        let Some((buffers, viewport, frame)) = request else {
            return Err(TesseraError::ProtocolViolation("unknown readback handle"));
        };
        self.render(buffers, viewport, frame)
    }
}

// ── Tests ────────────────────────────────────────────────────────

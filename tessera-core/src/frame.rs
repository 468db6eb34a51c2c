//! Per-consumer views onto shared frame data.

use std::sync::Arc;
use std::time::Duration;

use crate::error::TesseraError;
use crate::frame_data::FrameDataPtr;
use crate::pool::ImageRef;
use crate::renderer::Renderer;
use crate::sync::Monitor;
use crate::types::{Buffers, DrawableConfig, Offset, Pixel, SubPixel, Viewport, Zoom, ZoomFilter};

/// A frame data plus this consumer's placement of it.
///
/// Cloning a frame shares the frame data.
#[derive(Debug, Clone)]
pub struct Frame {
    name: String,
    data: FrameDataPtr,
    /// Position of the frame data's images in destination coordinates.
    offset: Offset,
    zoom: Zoom,
    zoom_filter: ZoomFilter,
    pixel: Pixel,
    sub_pixel: SubPixel,
    /// Buffers this consumer uses, intersected with the frame data's.
    buffer_mask: Buffers,
}

impl Frame {
    pub fn new(name: impl Into<String>, data: FrameDataPtr) -> Self {
        Self {
            name: name.into(),
            data,
            offset: Offset::ZERO,
            zoom: Zoom::NONE,
            zoom_filter: ZoomFilter::Nearest,
            pixel: Pixel::ALL,
            sub_pixel: SubPixel::ALL,
            buffer_mask: Buffers::all(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frame_data(&self) -> &FrameDataPtr {
        &self.data
    }

    pub fn offset(&self) -> Offset {
        self.offset
    }

    pub fn set_offset(&mut self, offset: Offset) {
        self.offset = offset;
    }

    pub fn zoom(&self) -> Zoom {
        self.zoom
    }

    pub fn set_zoom(&mut self, zoom: Zoom) {
        self.zoom = zoom;
    }

    pub fn zoom_filter(&self) -> ZoomFilter {
        self.zoom_filter
    }

    pub fn set_zoom_filter(&mut self, filter: ZoomFilter) {
        self.zoom_filter = filter;
    }

    pub fn pixel(&self) -> Pixel {
        self.pixel
    }

    pub fn set_pixel(&mut self, pixel: Pixel) {
        self.pixel = pixel;
    }

    pub fn sub_pixel(&self) -> SubPixel {
        self.sub_pixel
    }

    pub fn set_sub_pixel(&mut self, sub_pixel: SubPixel) {
        self.sub_pixel = sub_pixel;
    }

    pub fn set_buffer_mask(&mut self, mask: Buffers) {
        self.buffer_mask = mask;
    }

    /// Effective buffers: the frame data's, limited by this consumer.
    pub fn buffers(&self) -> Buffers {
        self.data.buffers() & self.buffer_mask
    }

    /// The frame data's viewport placed at this frame's offset.
    pub fn viewport(&self) -> Viewport {
        self.data.viewport().translate(self.offset)
    }

    pub fn images(&self) -> Vec<ImageRef> {
        self.data.images()
    }

    // ── Readiness delegation ─────────────────────────────────────

    pub fn is_ready(&self) -> bool {
        self.data.is_ready()
    }

    pub fn wait_ready(&self, timeout: Option<Duration>) -> Result<(), TesseraError> {
        self.data.wait_ready(timeout)
    }

    pub fn add_listener(&self, listener: Arc<Monitor>) {
        self.data.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<Monitor>) {
        self.data.remove_listener(listener);
    }

    pub fn set_ready(&self) {
        self.data.set_ready();
    }

    /// Read back the whole frame data viewport at this frame's offset.
    pub fn start_readback(
        &self,
        renderer: &dyn Renderer,
        drawable: &DrawableConfig,
    ) -> Result<Vec<ImageRef>, TesseraError> {
        let regions = [self.viewport()];
        self.data.start_readback(self.offset, renderer, drawable, &regions)
    }

    /// Read back only `regions` (destination coordinates).
    pub fn start_readback_regions(
        &self,
        renderer: &dyn Renderer,
        drawable: &DrawableConfig,
        regions: &[Viewport],
    ) -> Result<Vec<ImageRef>, TesseraError> {
        self.data.start_readback(self.offset, renderer, drawable, regions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_data::FrameData;

    #[test]
    fn frames_share_frame_data() {
        let data = Arc::new(FrameData::new(1));
        data.set_buffers(Buffers::COLOR | Buffers::DEPTH);
        data.set_viewport(Viewport::new(0, 0, 8, 8));

        let mut a = Frame::new("a", Arc::clone(&data));
        let b = a.clone();
        a.set_offset(Offset::new(4, 2));
        a.set_buffer_mask(Buffers::COLOR);

        assert_eq!(a.buffers(), Buffers::COLOR);
        assert_eq!(b.buffers(), Buffers::COLOR | Buffers::DEPTH);
        assert_eq!(a.viewport(), Viewport::new(4, 2, 8, 8));

        data.set_version(1).unwrap();
        assert!(!b.is_ready());
        a.set_ready();
        assert!(b.is_ready());
    }
}

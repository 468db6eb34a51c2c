//! Compositing destinations.
//!
//! [`CompositeTarget`] is the seam to whatever surface receives the
//! merged result. [`Canvas`] is the in-memory implementation: RGBA8
//! color plus 32-bit depth, covering one viewport.

use tracing::trace;

use super::cpu::{blend_pixel, depth_sample};
use crate::error::TesseraError;
use crate::image::Image;
use crate::pixel::PixelData;
use crate::types::{Buffer, Buffers, Offset, Pixel, Viewport, Zoom, ZoomFilter, format};

// ── ImageOp ──────────────────────────────────────────────────────

/// How one image is placed onto a target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageOp {
    pub buffers: Buffers,
    pub offset: Offset,
    pub pixel: Pixel,
    pub zoom: Zoom,
    pub zoom_filter: ZoomFilter,
    /// Blend color images carrying alpha instead of replacing.
    pub blend_alpha: bool,
}

impl Default for ImageOp {
    fn default() -> Self {
        Self {
            buffers: Buffers::empty(),
            offset: Offset::ZERO,
            pixel: Pixel::ALL,
            zoom: Zoom::NONE,
            zoom_filter: ZoomFilter::Nearest,
            blend_alpha: false,
        }
    }
}

// ── CompositeTarget ──────────────────────────────────────────────

pub trait CompositeTarget {
    fn viewport(&self) -> Viewport;

    /// Profiles without stencil support cannot interleave pixel
    /// decompositions.
    fn is_core_profile(&self) -> bool {
        false
    }

    /// Reset color and depth to their clear values.
    fn clear(&mut self);

    /// RGBA8 color, row-major over [`viewport`](Self::viewport).
    fn color(&self) -> &[u8];

    fn color_mut(&mut self) -> &mut [u8];

    /// Draw the color attachment.
    fn assemble_2d(&mut self, image: &Image, op: &ImageOp) -> Result<(), TesseraError>;

    /// Draw color and depth with a depth test.
    fn assemble_db(&mut self, image: &Image, op: &ImageOp) -> Result<(), TesseraError>;
}

// ── Canvas ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Canvas {
    viewport: Viewport,
    color: Vec<u8>,
    depth: Vec<u32>,
    clear_color: [u8; 4],
    core_profile: bool,
}

impl Canvas {
    pub fn new(viewport: Viewport) -> Self {
        let area = viewport.area();
        let clear_color = [0, 0, 0, 255];
        Self {
            viewport,
            color: clear_color.repeat(area),
            depth: vec![u32::MAX; area],
            clear_color,
            core_profile: false,
        }
    }

    pub fn with_core_profile(mut self, core_profile: bool) -> Self {
        self.core_profile = core_profile;
        self
    }

    pub fn set_clear_color(&mut self, rgba: [u8; 4]) {
        self.clear_color = rgba;
    }

    /// Color at absolute position `(x, y)`.
    pub fn color_at(&self, x: i32, y: i32) -> Option<[u8; 4]> {
        let i = self.index(x, y)? * 4;
        Some([self.color[i], self.color[i + 1], self.color[i + 2], self.color[i + 3]])
    }

    pub fn depth_at(&self, x: i32, y: i32) -> Option<u32> {
        self.index(x, y).map(|i| self.depth[i])
    }

    /// Content hash of the color buffer.
    pub fn digest(&self) -> blake3::Hash {
        blake3::hash(&self.color)
    }

    fn index(&self, x: i32, y: i32) -> Option<usize> {
        let vp = self.viewport;
        if x < vp.x || y < vp.y || x >= vp.x_end() || y >= vp.y_end() {
            return None;
        }
        Some(((y - vp.y) * vp.w + (x - vp.x)) as usize)
    }

    /// Source/destination index pairs along one axis. Destination
    /// indices are relative to the canvas; samples outside are dropped.
    #[allow(clippy::too_many_arguments)]
    fn axis(
        len: i32,
        start: i32,
        offset: i32,
        zoom: f32,
        stride: u32,
        phase: u32,
        lo: i32,
        hi: i32,
    ) -> Vec<(usize, usize)> {
        let zoomed = (len as f32 * zoom).round() as i32;
        let origin = (start as f32 * zoom).round() as i32 + offset;
        (0..zoomed)
            .filter_map(|z| {
                let d = origin + z * stride as i32 + phase as i32;
                if d < lo || d >= hi {
                    return None;
                }
                let s = ((z as f32 / zoom) as i32).min(len - 1);
                Some((s as usize, (d - lo) as usize))
            })
            .collect()
    }

    /// Row and column sample maps for `data` placed by `op`.
    fn samples(&self, data: &PixelData, op: &ImageOp) -> (Vec<(usize, usize)>, Vec<(usize, usize)>) {
        if op.zoom_filter == ZoomFilter::Linear && !op.zoom.is_none() {
            trace!("linear zoom filter sampled as nearest");
        }
        let (src, dst) = (data.viewport, self.viewport);
        let cols = Self::axis(
            src.w, src.x, op.offset.x, op.zoom.x, op.pixel.w, op.pixel.x, dst.x, dst.x_end(),
        );
        let rows = Self::axis(
            src.h, src.y, op.offset.y, op.zoom.y, op.pixel.h, op.pixel.y, dst.y, dst.y_end(),
        );
        (cols, rows)
    }
}

/// Convert one source pixel to RGBA8.
fn to_rgba(external_format: u32, px: &[u8]) -> [u8; 4] {
    match external_format {
        format::BGRA => [px[2], px[1], px[0], px[3]],
        format::RGB => [px[0], px[1], px[2], 255],
        _ => [px[0], px[1], px[2], px[3]],
    }
}

fn check_color(data: &PixelData) -> Result<(), TesseraError> {
    match data.external_format {
        format::RGBA | format::BGRA | format::RGB => Ok(()),
        other => Err(TesseraError::FormatMismatch(format!(
            "canvas cannot draw color format {other:#x}"
        ))),
    }
}

impl CompositeTarget for Canvas {
    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn is_core_profile(&self) -> bool {
        self.core_profile
    }

    fn clear(&mut self) {
        for px in self.color.chunks_exact_mut(4) {
            px.copy_from_slice(&self.clear_color);
        }
        self.depth.fill(u32::MAX);
    }

    fn color(&self) -> &[u8] {
        &self.color
    }

    fn color_mut(&mut self) -> &mut [u8] {
        &mut self.color
    }

    fn assemble_2d(&mut self, image: &Image, op: &ImageOp) -> Result<(), TesseraError> {
        let src = image.pixel_data(Buffer::Color);
        check_color(src)?;
        let blend = op.blend_alpha && image.has_alpha();
        let (cols, rows) = self.samples(src, op);
        let ps = src.pixel_size as usize;
        let sw = src.viewport.w as usize;
        let dw = self.viewport.w as usize;

        for &(sy, dy) in &rows {
            for &(sx, dx) in &cols {
                let s = (sy * sw + sx) * ps;
                let px = to_rgba(src.external_format, &src.pixels[s..s + ps]);
                let d = (dy * dw + dx) * 4;
                let dst = &mut self.color[d..d + 4];
                if blend {
                    blend_pixel(dst, &px);
                } else {
                    dst.copy_from_slice(&px);
                }
            }
        }
        Ok(())
    }

    fn assemble_db(&mut self, image: &Image, op: &ImageOp) -> Result<(), TesseraError> {
        let src = image.pixel_data(Buffer::Color);
        let src_depth = image.pixel_data(Buffer::Depth);
        check_color(src)?;
        if src_depth.external_format != format::DEPTH_UNSIGNED_INT {
            return Err(TesseraError::FormatMismatch(format!(
                "canvas cannot test depth format {:#x}",
                src_depth.external_format
            )));
        }
        let (cols, rows) = self.samples(src, op);
        let ps = src.pixel_size as usize;
        let sw = src.viewport.w as usize;
        let dw = self.viewport.w as usize;

        for &(sy, dy) in &rows {
            for &(sx, dx) in &cols {
                let si = sy * sw + sx;
                let z = depth_sample(&src_depth.pixels[si * 4..si * 4 + 4]);
                let di = dy * dw + dx;
                if self.depth[di] > z {
                    self.depth[di] = z;
                    let px = to_rgba(src.external_format, &src.pixels[si * ps..si * ps + ps]);
                    self.color[di * 4..di * 4 + 4].copy_from_slice(&px);
                }
            }
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn bgra(vp: Viewport, bgra: [u8; 4]) -> Image {
        let mut data = PixelData::new(format::RGBA, format::BGRA, vp).unwrap();
        data.pixels.chunks_exact_mut(4).for_each(|px| px.copy_from_slice(&bgra));
        let mut img = Image::new();
        img.set_flat_pixel_data(Buffer::Color, data).unwrap();
        img
    }

    #[test]
    fn paste_swizzles_and_offsets() {
        let mut canvas = Canvas::new(Viewport::new(0, 0, 4, 4));
        let op = ImageOp {
            buffers: Buffers::COLOR,
            offset: Offset::new(2, 1),
            ..ImageOp::default()
        };
        canvas.assemble_2d(&bgra(Viewport::new(0, 0, 1, 1), [1, 2, 3, 4]), &op).unwrap();
        assert_eq!(canvas.color_at(2, 1), Some([3, 2, 1, 4]));
        assert_eq!(canvas.color_at(0, 0), Some([0, 0, 0, 255]));
    }

    #[test]
    fn zoom_replicates_nearest_samples() {
        let mut canvas = Canvas::new(Viewport::new(0, 0, 4, 2));
        let mut data = PixelData::new(format::RGBA, format::RGBA, Viewport::new(0, 0, 2, 1)).unwrap();
        data.pixels.copy_from_slice(&[10, 0, 0, 255, 20, 0, 0, 255]);
        let mut img = Image::new();
        img.set_flat_pixel_data(Buffer::Color, data).unwrap();

        let op = ImageOp {
            zoom: Zoom::new(2.0, 2.0),
            ..ImageOp::default()
        };
        canvas.assemble_2d(&img, &op).unwrap();
        let reds: Vec<u8> = (0..4).map(|x| canvas.color_at(x, 1).unwrap()[0]).collect();
        assert_eq!(reds, vec![10, 10, 20, 20]);
    }

    #[test]
    fn pixel_decomposition_interleaves_columns() {
        let mut canvas = Canvas::new(Viewport::new(0, 0, 4, 1));
        let op = ImageOp {
            pixel: Pixel::new(1, 0, 2, 1),
            ..ImageOp::default()
        };
        canvas.assemble_2d(&bgra(Viewport::new(0, 0, 2, 1), [0, 0, 7, 255]), &op).unwrap();
        let reds: Vec<u8> = (0..4).map(|x| canvas.color_at(x, 0).unwrap()[0]).collect();
        assert_eq!(reds, vec![0, 7, 0, 7]);
    }

    #[test]
    fn images_outside_the_canvas_are_clipped() {
        let mut canvas = Canvas::new(Viewport::new(0, 0, 2, 2));
        let op = ImageOp {
            offset: Offset::new(1, 1),
            ..ImageOp::default()
        };
        canvas.assemble_2d(&bgra(Viewport::new(0, 0, 4, 4), [5, 5, 5, 255]), &op).unwrap();
        assert_eq!(canvas.color_at(1, 1), Some([5, 5, 5, 255]));
        assert_eq!(canvas.color_at(0, 1), Some([0, 0, 0, 255]));
    }

    #[test]
    fn float_formats_are_rejected() {
        let mut canvas = Canvas::new(Viewport::new(0, 0, 1, 1));
        let data = PixelData::new(format::RGBA32F, format::RGBA32F, Viewport::new(0, 0, 1, 1)).unwrap();
        let mut img = Image::new();
        img.set_flat_pixel_data(Buffer::Color, data).unwrap();
        let err = canvas.assemble_2d(&img, &ImageOp::default()).unwrap_err();
        assert!(matches!(err, TesseraError::FormatMismatch(_)));
    }
}

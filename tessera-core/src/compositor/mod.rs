//! Merging ready frames into a destination.
//!
//! ```text
//!   assemble_frames ──┬── CPU-eligible? ──▶ assemble_frames_cpu ── merge_frames_cpu
//!                     │                                               │
//!                     │                               merge_images_cpu (rayon kernels)
//!                     │                                               │
//!                     └── otherwise ──────▶ assemble_frames_unsorted  ▼
//!                                              (ready order)     assemble_image
//!                                                   │                 │
//!   assemble_frames_sorted ── input order ──────────┴── assemble_frame┘
//!   blend_frames = sorted + ONE, SRC_ALPHA
//! ```
//!
//! Frames whose sub-pixel tags differ are split into groups of equal
//! tags. Each group is composited on its own and added to an
//! [`Accumulator`], which is displayed once at the end.
//!
//! Every entry point returns how many composition passes produced
//! output: `0` or `1` per pass, summed over sub-pixel groups.

pub mod accum;
pub mod canvas;
mod cpu;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::TesseraError;
use crate::frame::Frame;
use crate::image::Image;
use crate::pixel::PixelData;
use crate::stats::{NullStatistics, StatEvent, Statistic, StatisticsHook};
use crate::sync::Monitor;
use crate::types::{Buffer, Buffers, Offset, StorageType, Viewport, Zoom, format};

pub use accum::Accumulator;
pub use canvas::{Canvas, CompositeTarget, ImageOp};

// ── WaitHandle ───────────────────────────────────────────────────

/// Listener registration over a set of frames, consumed by
/// [`Compositor::wait_frame`]. Dropping it deregisters the listener.
pub struct WaitHandle {
    monitor: Arc<Monitor>,
    frames: Vec<Frame>,
    /// Indices into `frames` not handed out yet.
    left: Vec<usize>,
    processed: u64,
}

impl WaitHandle {
    pub fn new(frames: &[Frame]) -> Self {
        let monitor = Arc::new(Monitor::new());
        for frame in frames {
            frame.add_listener(Arc::clone(&monitor));
        }
        Self {
            monitor,
            frames: frames.to_vec(),
            left: (0..frames.len()).collect(),
            processed: 0,
        }
    }

    /// Frames not yet returned by `wait_frame`.
    pub fn remaining(&self) -> usize {
        self.left.len()
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        for frame in &self.frames {
            frame.remove_listener(&self.monitor);
        }
    }
}

// ── Compositor ───────────────────────────────────────────────────

pub struct Compositor {
    /// Bound for every readiness wait, `None` waits forever.
    timeout: Option<Duration>,
    stats: Arc<dyn StatisticsHook>,
    frame_number: u32,
}

impl Default for Compositor {
    fn default() -> Self {
        Self {
            timeout: None,
            stats: Arc::new(NullStatistics),
            frame_number: 0,
        }
    }
}

impl Compositor {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    pub fn with_statistics(mut self, stats: Arc<dyn StatisticsHook>) -> Self {
        self.stats = stats;
        self
    }

    /// Frame number attached to statistics samples.
    pub fn set_frame_number(&mut self, frame_number: u32) {
        self.frame_number = frame_number;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    // ── Entry points ─────────────────────────────────────────────

    /// Composite `frames` in whatever order is fastest.
    pub fn assemble_frames(
        &self,
        frames: &[Frame],
        target: &mut dyn CompositeTarget,
        accum: Option<&mut Accumulator>,
    ) -> Result<u32, TesseraError> {
        if frames.is_empty() {
            return Ok(0);
        }
        if self.use_cpu_assembly(frames, false)? {
            return self.assemble_frames_cpu(frames, target, false);
        }
        self.assemble_frames_unsorted(frames, target, accum)
    }

    /// Back-to-front alpha blending of `frames` in input order.
    pub fn blend_frames(
        &self,
        frames: &[Frame],
        target: &mut dyn CompositeTarget,
        accum: Option<&mut Accumulator>,
    ) -> Result<u32, TesseraError> {
        self.assemble_frames_sorted(frames, target, accum, true)
    }

    /// Composite `frames` strictly in input order.
    #[tracing::instrument(skip_all, fields(frames = frames.len()))]
    pub fn assemble_frames_sorted(
        &self,
        frames: &[Frame],
        target: &mut dyn CompositeTarget,
        accum: Option<&mut Accumulator>,
        blend_alpha: bool,
    ) -> Result<u32, TesseraError> {
        if frames.is_empty() {
            return Ok(0);
        }
        if Self::is_sub_pixel_decomposition(frames) {
            return self.assemble_sub_pixels(frames, target, accum, |group, target| {
                self.assemble_frames_sorted(group, target, None, blend_alpha)
            });
        }

        if self.use_cpu_assembly(frames, blend_alpha)? {
            return self.assemble_frames_cpu(frames, target, blend_alpha);
        }
        let mut count = 0;
        for frame in frames {
            self.wait_ready(frame)?;
            if self.assemble_frame(frame, target, blend_alpha)? {
                count = 1;
            }
        }
        Ok(count)
    }

    /// Composite `frames` in the order they become ready.
    ///
    /// Fails with [`TesseraError::TimeoutWaitingForInput`] when a frame
    /// does not become ready within the timeout. Frames composited
    /// before the timeout stay in the target.
    #[tracing::instrument(skip_all, fields(frames = frames.len()))]
    pub fn assemble_frames_unsorted(
        &self,
        frames: &[Frame],
        target: &mut dyn CompositeTarget,
        accum: Option<&mut Accumulator>,
    ) -> Result<u32, TesseraError> {
        if frames.is_empty() {
            return Ok(0);
        }
        if Self::is_sub_pixel_decomposition(frames) {
            return self.assemble_sub_pixels(frames, target, accum, |group, target| {
                self.assemble_frames(group, target, None)
            });
        }

        let mut handle = WaitHandle::new(frames);
        let mut count = 0;
        while let Some(frame) = self.wait_frame(&mut handle)? {
            if self.assemble_frame(&frame, target, false)? {
                count = 1;
            }
        }
        Ok(count)
    }

    /// Merge `frames` on the CPU and composite the result once.
    pub fn assemble_frames_cpu(
        &self,
        frames: &[Frame],
        target: &mut dyn CompositeTarget,
        blend_alpha: bool,
    ) -> Result<u32, TesseraError> {
        let Some(result) = self.merge_frames_cpu(frames, blend_alpha)? else {
            return Ok(0);
        };
        let op = ImageOp {
            buffers: Buffers::COLOR | Buffers::DEPTH,
            blend_alpha,
            ..ImageOp::default()
        };
        self.assemble_image(&result, &op, target)?;
        Ok(1)
    }

    /// Wait for every frame, then merge all their images into one image
    /// covering the placed bounds. `None` when there is nothing to merge.
    #[tracing::instrument(skip_all, fields(frames = frames.len()))]
    pub fn merge_frames_cpu(
        &self,
        frames: &[Frame],
        blend_alpha: bool,
    ) -> Result<Option<Image>, TesseraError> {
        let mut inputs = Vec::new();
        for frame in frames {
            self.wait_ready(frame)?;
            if !frame.pixel().is_all() || !frame.sub_pixel().is_all() || !frame.zoom().is_none() {
                return Err(TesseraError::UnsupportedComposition(
                    "CPU merge of decomposed or zoomed frames",
                ));
            }
            for image in frame.images() {
                inputs.push((image, frame.offset()));
            }
        }

        let guards: Vec<_> = inputs.iter().map(|(image, offset)| (image.read(), *offset)).collect();
        if guards.iter().any(|(image, _)| image.storage_type() != StorageType::Memory) {
            warn!("CPU merge needs images in memory storage");
            return Ok(None);
        }
        let images: Vec<(&Image, Offset)> = guards.iter().map(|(image, offset)| (&**image, *offset)).collect();

        let _event = StatEvent::start(self.stats.as_ref(), Statistic::Assemble, self.frame_number);
        Self::merge_images_cpu(&images, blend_alpha)
    }

    /// Merge `images` placed at their offsets, in input order: depth
    /// test for color+depth, blend for color with alpha when
    /// `blend_alpha`, tile paste otherwise.
    pub fn merge_images_cpu(
        images: &[(&Image, Offset)],
        blend_alpha: bool,
    ) -> Result<Option<Image>, TesseraError> {
        let mut dest = Viewport::default();
        let mut color_formats = None;
        let mut depth_formats = None;
        for (image, offset) in images {
            if !image.has_pixel_data(Buffer::Color) {
                continue;
            }
            dest = dest.merge(&image.viewport().translate(*offset));
            collect_formats(&mut color_formats, image, Buffer::Color)?;
            let has_depth = image.has_pixel_data(Buffer::Depth);
            if has_depth {
                collect_formats(&mut depth_formats, image, Buffer::Depth)?;
            }
            if (has_depth || (blend_alpha && image.has_alpha()))
                && image.pixel_size(Buffer::Color) != 4
            {
                return Err(TesseraError::FormatMismatch(format!(
                    "CPU depth or blend merge needs 4-byte color, got {} bytes",
                    image.pixel_size(Buffer::Color)
                )));
            }
        }
        let Some((color_internal, color_external)) = color_formats else {
            warn!("nothing to merge");
            return Ok(None);
        };
        if let Some((_, external)) = depth_formats
            && external != format::DEPTH_UNSIGNED_INT
        {
            return Err(TesseraError::FormatMismatch(format!(
                "CPU depth merge needs 32-bit depth, got {external:#x}"
            )));
        }

        let mut color = PixelData::cleared(Buffer::Color, color_internal, color_external, dest)?;
        let mut depth = depth_formats
            .map(|(internal, external)| PixelData::cleared(Buffer::Depth, internal, external, dest))
            .transpose()?;

        for (image, offset) in images {
            if !image.has_pixel_data(Buffer::Color) {
                continue;
            }
            match depth.as_mut() {
                Some(depth) if image.has_pixel_data(Buffer::Depth) => {
                    cpu::merge_db(&mut color.pixels, &mut depth.pixels, dest, image, *offset);
                }
                _ if blend_alpha && image.has_alpha() => {
                    cpu::merge_blend(&mut color.pixels, dest, image, *offset);
                }
                depth => {
                    let depth = depth.map(|d| d.pixels.as_mut_slice());
                    cpu::merge_2d(&mut color.pixels, depth, dest, image, *offset);
                }
            }
        }
        debug!(%dest, images = images.len(), "CPU merge");

        let mut result = Image::new();
        result.set_flat_pixel_data(Buffer::Color, color)?;
        if let Some(depth) = depth {
            result.set_flat_pixel_data(Buffer::Depth, depth)?;
        }
        Ok(Some(result))
    }

    // ── Single frames and images ─────────────────────────────────

    /// Composite all images of one ready frame. Returns whether
    /// anything was drawn.
    pub fn assemble_frame(
        &self,
        frame: &Frame,
        target: &mut dyn CompositeTarget,
        blend_alpha: bool,
    ) -> Result<bool, TesseraError> {
        let images = frame.images();
        if images.is_empty() {
            info!(frame = frame.name(), "no images to assemble");
            return Ok(false);
        }
        let op = ImageOp {
            buffers: frame.buffers(),
            offset: frame.offset(),
            pixel: frame.pixel(),
            zoom: frame.zoom().then(frame.frame_data().zoom()),
            zoom_filter: frame.zoom_filter(),
            blend_alpha,
        };

        let _event = StatEvent::start(self.stats.as_ref(), Statistic::Assemble, self.frame_number);
        let mut drawn = false;
        for image in images {
            drawn |= self.assemble_image(&image.read(), &op, target)?;
        }
        Ok(drawn)
    }

    /// Draw the buffers of `image` that `op` asks for and that hold
    /// data: color alone as 2D, color with depth depth-tested.
    pub fn assemble_image(
        &self,
        image: &Image,
        op: &ImageOp,
        target: &mut dyn CompositeTarget,
    ) -> Result<bool, TesseraError> {
        if target.is_core_profile() && !op.pixel.is_all() {
            let err = TesseraError::UnsupportedComposition(
                "pixel decomposition needs a stencil-capable profile",
            );
            error!("{err}");
            return Ok(false);
        }

        let buffers = op.buffers & image.buffers();
        let op = ImageOp { buffers, ..*op };
        if buffers == Buffers::COLOR {
            target.assemble_2d(image, &op)?;
        } else if buffers == Buffers::COLOR | Buffers::DEPTH {
            target.assemble_db(image, &op)?;
        } else if buffers.is_empty() {
            warn!("no image attachment buffers to assemble");
            return Ok(false);
        } else {
            warn!(?buffers, "don't know how to assemble buffers");
            return Ok(false);
        }
        Ok(true)
    }

    // ── Waiting ──────────────────────────────────────────────────

    /// Next frame of `handle` to become ready, `None` once all were
    /// handed out.
    pub fn wait_frame(&self, handle: &mut WaitHandle) -> Result<Option<Frame>, TesseraError> {
        if handle.left.is_empty() {
            return Ok(None);
        }
        handle.processed += 1;
        {
            let _event = StatEvent::start(self.stats.as_ref(), Statistic::WaitReady, self.frame_number);
            match self.timeout {
                None => {
                    handle.monitor.wait_ge(handle.processed);
                }
                Some(timeout) => {
                    if !handle.monitor.timed_wait_ge(handle.processed, timeout) {
                        warn!(remaining = handle.left.len(), ?timeout, "timed out waiting for input frames");
                        return Err(TesseraError::TimeoutWaitingForInput { timeout });
                    }
                }
            }
        }

        let ready = handle
            .left
            .iter()
            .position(|&i| handle.frames[i].is_ready());
        let index = match ready {
            Some(pos) => handle.left.remove(pos),
            None => {
                // A frame data became ready more than once; fall back to
                // input order for this frame.
                debug!("ready count ahead of ready frames");
                let index = handle.left.remove(0);
                handle.frames[index].wait_ready(self.timeout)?;
                index
            }
        };
        Ok(Some(handle.frames[index].clone()))
    }

    fn wait_ready(&self, frame: &Frame) -> Result<(), TesseraError> {
        let _event = StatEvent::start(self.stats.as_ref(), Statistic::WaitReady, self.frame_number);
        frame.wait_ready(self.timeout)
    }

    // ── Decisions ────────────────────────────────────────────────

    /// Whether the CPU merge applies to `frames`. Waits for every frame
    /// once the cheap checks pass.
    pub fn use_cpu_assembly(&self, frames: &[Frame], blend_alpha: bool) -> Result<bool, TesseraError> {
        if frames.len() < 2 {
            return Ok(false);
        }
        let desired = if blend_alpha {
            Buffers::COLOR
        } else {
            Buffers::COLOR | Buffers::DEPTH
        };
        let mut candidates = 0;
        for frame in frames {
            if !frame.pixel().is_all() || !frame.sub_pixel().is_all() || !frame.zoom().is_none() {
                return Ok(false);
            }
            if frame.buffers() == desired {
                candidates += 1;
            }
        }
        if candidates < 2 {
            return Ok(false);
        }

        let mut images = 0;
        let mut color_formats: Option<(u32, u32)> = None;
        let mut depth_formats: Option<(u32, u32)> = None;
        for frame in frames {
            self.wait_ready(frame)?;
            if frame.frame_data().zoom() != Zoom::NONE {
                return Ok(false);
            }
            for image in frame.images() {
                let image = image.read();
                let has_color = image.has_pixel_data(Buffer::Color);
                let has_depth = image.has_pixel_data(Buffer::Depth);
                let blendable = blend_alpha && has_color && image.has_alpha();
                if !blendable && !(has_color && has_depth) {
                    return Ok(false);
                }

                let color = (
                    image.internal_format(Buffer::Color),
                    image.external_format(Buffer::Color),
                );
                match color_formats {
                    None => {
                        let supported = match color.1 {
                            format::RGBA | format::BGRA => true,
                            format::RGB10_A2 => has_depth,
                            _ => false,
                        };
                        if !supported {
                            return Ok(false);
                        }
                        color_formats = Some(color);
                    }
                    Some(first) if first != color => return Ok(false),
                    Some(_) => {}
                }
                if has_depth {
                    let depth = (
                        image.internal_format(Buffer::Depth),
                        image.external_format(Buffer::Depth),
                    );
                    match depth_formats {
                        None if depth.1 != format::DEPTH_UNSIGNED_INT => return Ok(false),
                        None => depth_formats = Some(depth),
                        Some(first) if first != depth => return Ok(false),
                        Some(_) => {}
                    }
                }
                images += 1;
            }
        }
        Ok(images > 1)
    }

    /// Whether any frame's sub-pixel tag differs from the first.
    pub fn is_sub_pixel_decomposition(frames: &[Frame]) -> bool {
        let Some((first, rest)) = frames.split_first() else {
            return false;
        };
        rest.iter().any(|f| f.sub_pixel() != first.sub_pixel())
    }

    /// Remove and return the last frame plus every other frame sharing
    /// its sub-pixel tag.
    pub fn extract_one_sub_pixel(frames: &mut Vec<Frame>) -> Vec<Frame> {
        let Some(last) = frames.pop() else {
            return Vec::new();
        };
        let tag = last.sub_pixel();
        let (same, rest): (Vec<_>, Vec<_>) = frames.drain(..).partition(|f| f.sub_pixel() == tag);
        *frames = rest;
        let mut group = vec![last];
        group.extend(same);
        group
    }

    fn assemble_sub_pixels(
        &self,
        frames: &[Frame],
        target: &mut dyn CompositeTarget,
        accum: Option<&mut Accumulator>,
        mut step: impl FnMut(&[Frame], &mut dyn CompositeTarget) -> Result<u32, TesseraError>,
    ) -> Result<u32, TesseraError> {
        let mut owned: Option<Accumulator> = None;
        let accum = match accum {
            Some(accum) => accum,
            None => {
                let mut accum = Accumulator::new(target.viewport());
                accum.set_total_steps(frames.last().map_or(1, |f| f.sub_pixel().size));
                owned.insert(accum)
            }
        };

        let mut left = frames.to_vec();
        let mut count = 0;
        while !left.is_empty() {
            let group = Self::extract_one_sub_pixel(&mut left);
            target.clear();
            let passes = step(group.as_slice(), &mut *target)?;
            if passes > 0 {
                accum.accum(&*target)?;
            }
            count += passes;
        }
        if count > 0 {
            accum.display(target)?;
        }
        Ok(count)
    }
}

fn collect_formats(
    slot: &mut Option<(u32, u32)>,
    image: &Image,
    buffer: Buffer,
) -> Result<(), TesseraError> {
    let formats = (image.internal_format(buffer), image.external_format(buffer));
    match slot {
        None => *slot = Some(formats),
        Some(first) if *first != formats => {
            return Err(TesseraError::FormatMismatch(format!(
                "{buffer:?} formats {first:x?} and {formats:x?} cannot be merged"
            )));
        }
        Some(_) => {}
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────

//! Geometry, decomposition and format types shared by every stage.
//!
//! These are plain value types. Pixel payloads live in
//! [`PixelData`](crate::pixel::PixelData); images in
//! [`Image`](crate::image::Image).

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

// ── Viewport ─────────────────────────────────────────────────────

/// An integer pixel rectangle. Width or height `<= 0` means empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Viewport {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Viewport {
    pub const fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    /// Whether the rectangle covers at least one pixel.
    pub fn has_area(&self) -> bool {
        self.w > 0 && self.h > 0
    }

    /// Number of pixels covered, zero for empty rectangles.
    pub fn area(&self) -> usize {
        if self.has_area() {
            self.w as usize * self.h as usize
        } else {
            0
        }
    }

    /// Exclusive right edge, saturating at `i32::MAX`.
    pub fn x_end(&self) -> i32 {
        self.x.saturating_add(self.w)
    }

    /// Exclusive bottom edge, saturating at `i32::MAX`.
    pub fn y_end(&self) -> i32 {
        self.y.saturating_add(self.h)
    }

    /// Overlap of two rectangles; empty (zero size) when disjoint.
    pub fn intersect(&self, other: &Viewport) -> Viewport {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let x_end = self.x_end().min(other.x_end());
        let y_end = self.y_end().min(other.y_end());
        if x_end <= x || y_end <= y {
            return Viewport::default();
        }
        Viewport::new(x, y, x_end - x, y_end - y)
    }

    /// Bounding rectangle of both. An empty side is ignored.
    pub fn merge(&self, other: &Viewport) -> Viewport {
        if !other.has_area() {
            return *self;
        }
        if !self.has_area() {
            return *other;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let x_end = self.x_end().max(other.x_end());
        let y_end = self.y_end().max(other.y_end());
        Viewport::new(x, y, x_end - x, y_end - y)
    }

    pub fn translate(&self, offset: Offset) -> Viewport {
        Viewport::new(self.x + offset.x, self.y + offset.y, self.w, self.h)
    }

    /// Scale position and size by `zoom`, rounding to whole pixels.
    pub fn apply_zoom(&self, zoom: Zoom) -> Viewport {
        if zoom == Zoom::NONE {
            return *self;
        }
        Viewport::new(
            (self.x as f32 * zoom.x).round() as i32,
            (self.y as f32 * zoom.y).round() as i32,
            (self.w as f32 * zoom.x).round() as i32,
            (self.h as f32 * zoom.y).round() as i32,
        )
    }

    /// Whether `other` lies fully inside this rectangle.
    pub fn contains(&self, other: &Viewport) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.x_end() <= self.x_end()
            && other.y_end() <= self.y_end()
    }
}

impl fmt::Display for Viewport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {} {}x{}]", self.x, self.y, self.w, self.h)
    }
}

/// Integer translation in destination coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Offset {
    pub x: i32,
    pub y: i32,
}

impl Offset {
    pub const ZERO: Offset = Offset { x: 0, y: 0 };

    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

// ── Zoom ─────────────────────────────────────────────────────────

/// Per-axis scale factor applied when an image is composited.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Zoom {
    pub x: f32,
    pub y: f32,
}

impl Zoom {
    pub const NONE: Zoom = Zoom { x: 1.0, y: 1.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Finite and strictly positive on both axes.
    pub fn is_valid(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.x > 0.0 && self.y > 0.0
    }

    pub fn is_none(&self) -> bool {
        *self == Zoom::NONE
    }

    /// Compose two zoom factors.
    pub fn then(&self, other: Zoom) -> Zoom {
        Zoom::new(self.x * other.x, self.y * other.y)
    }
}

impl Default for Zoom {
    fn default() -> Self {
        Zoom::NONE
    }
}

// ── Decompositions ───────────────────────────────────────────────

/// Pixel (sub-area) decomposition: this source renders every `w`-th
/// column starting at `x` and every `h`-th row starting at `y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pixel {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Pixel {
    pub const ALL: Pixel = Pixel { x: 0, y: 0, w: 1, h: 1 };

    pub const fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub fn is_all(&self) -> bool {
        self.w <= 1 && self.h <= 1
    }
}

impl Default for Pixel {
    fn default() -> Self {
        Pixel::ALL
    }
}

/// Sub-pixel (jitter) decomposition tag: sample `index` of `size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubPixel {
    pub index: u32,
    pub size: u32,
}

impl SubPixel {
    pub const ALL: SubPixel = SubPixel { index: 0, size: 1 };

    pub const fn new(index: u32, size: u32) -> Self {
        Self { index, size }
    }

    pub fn is_all(&self) -> bool {
        self.size <= 1
    }
}

impl Default for SubPixel {
    fn default() -> Self {
        SubPixel::ALL
    }
}

// ── Buffers ──────────────────────────────────────────────────────

/// One of the two attachments an image can carry.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Buffer {
    Color = 0,
    Depth = 1,
}

impl Buffer {
    /// Both buffer kinds in transmission order.
    pub const ALL: [Buffer; 2] = [Buffer::Color, Buffer::Depth];

    pub const fn mask(self) -> Buffers {
        match self {
            Buffer::Color => Buffers::COLOR,
            Buffer::Depth => Buffers::DEPTH,
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }
}

bitflags! {
    /// Set of enabled buffers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Buffers: u32 {
        const COLOR = 0x1;
        const DEPTH = 0x2;
    }
}

impl Buffers {
    /// The enabled buffers, color first.
    pub fn each(self) -> impl Iterator<Item = Buffer> {
        Buffer::ALL.into_iter().filter(move |b| self.contains(b.mask()))
    }
}

// ── Storage / filtering ──────────────────────────────────────────

/// Where read-back pixels are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StorageType {
    /// Host memory, the only type that can be transmitted.
    #[default]
    Memory,
    /// GPU texture, usable only on the producing node.
    Texture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ZoomFilter {
    #[default]
    Nearest,
    Linear,
}

// ── Formats ──────────────────────────────────────────────────────

/// Pixel format tokens used for both internal and external formats.
///
/// | Token                | Bytes | Alpha |
/// |----------------------|-------|-------|
/// | `RGBA`, `BGRA`       | 4     | yes   |
/// | `RGB`                | 3     | no    |
/// | `RGB10_A2`           | 4     | yes   |
/// | `RGBA16F`            | 8     | yes   |
/// | `RGBA32F`            | 16    | yes   |
/// | `DEPTH`              | 4     | -     |
/// | `DEPTH_UNSIGNED_INT` | 4     | -     |
pub mod format {
    pub const NONE: u32 = 0;
    pub const RGB: u32 = 0x1907;
    pub const RGBA: u32 = 0x1908;
    pub const BGRA: u32 = 0x80E1;
    pub const RGB10_A2: u32 = 0x8059;
    pub const RGBA16F: u32 = 0x881A;
    pub const RGBA32F: u32 = 0x8814;
    pub const DEPTH: u32 = 0x1902;
    pub const DEPTH_UNSIGNED_INT: u32 = 0x84FA;

    /// Bytes per pixel, `None` for unknown tokens.
    pub fn pixel_size(token: u32) -> Option<u32> {
        match token {
            RGB => Some(3),
            RGBA | BGRA | RGB10_A2 | DEPTH | DEPTH_UNSIGNED_INT => Some(4),
            RGBA16F => Some(8),
            RGBA32F => Some(16),
            _ => None,
        }
    }

    pub fn has_alpha(token: u32) -> bool {
        matches!(token, RGBA | BGRA | RGB10_A2 | RGBA16F | RGBA32F)
    }

    /// 8-bit, four channel layouts the CPU kernels understand.
    pub fn is_rgba8(token: u32) -> bool {
        matches!(token, RGBA | BGRA)
    }
}

/// Bit depths of the drawable that produces an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawableConfig {
    pub color_bits: u32,
    pub alpha_bits: u32,
    pub depth_bits: u32,
}

impl DrawableConfig {
    /// Internal color format matching the drawable's color depth.
    pub fn color_internal_format(&self) -> u32 {
        match self.color_bits {
            16 => format::RGBA16F,
            32 => format::RGBA32F,
            10 => format::RGB10_A2,
            _ => format::RGBA,
        }
    }

    /// External color format matching the internal one.
    pub fn color_external_format(&self) -> u32 {
        match self.color_internal_format() {
            format::RGBA => format::BGRA,
            other => other,
        }
    }
}

impl Default for DrawableConfig {
    fn default() -> Self {
        Self {
            color_bits: 8,
            alpha_bits: 8,
            depth_bits: 24,
        }
    }
}

// ── ObjectVersion ────────────────────────────────────────────────

/// Identity plus version of a replicated frame data object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ObjectVersion {
    pub id: u64,
    pub version: u64,
}

impl ObjectVersion {
    pub const fn new(id: u64, version: u64) -> Self {
        Self { id, version }
    }
}

impl fmt::Display for ObjectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}.v{}", self.id, self.version)
    }
}

// ── Tests ────────────────────────────────────────────────────────

//! Coarse foreground classification over a cell grid.
//!
//! A [`CellMask`] splits a pixel viewport into `GRID_SIZE × GRID_SIZE`
//! cells and marks each cell that holds anything besides background.
//! The mask carries one empty border column (right) and row (bottom).

use crate::pixel::PixelData;
use crate::types::{Viewport, format};

/// Pixels per cell edge.
pub const GRID_SIZE: i32 = 16;

const FOREGROUND: u8 = 255;

#[derive(Debug, Clone)]
pub struct CellMask {
    /// Covered cells in absolute cell coordinates.
    cells: Viewport,
    /// The pixel viewport the mask was built for.
    pixels: Viewport,
    stride: usize,
    bits: Vec<u8>,
}

impl CellMask {
    /// Cell rectangle fully covering `pvp`.
    pub fn bounding_cells(pvp: &Viewport) -> Viewport {
        let x = pvp.x.div_euclid(GRID_SIZE);
        let y = pvp.y.div_euclid(GRID_SIZE);
        let x_end = (pvp.x_end() + GRID_SIZE - 1).div_euclid(GRID_SIZE);
        let y_end = (pvp.y_end() + GRID_SIZE - 1).div_euclid(GRID_SIZE);
        Viewport::new(x, y, x_end - x, y_end - y)
    }

    /// All-background mask for `pvp`.
    pub fn empty(pvp: Viewport) -> Self {
        let cells = Self::bounding_cells(&pvp);
        let stride = cells.w.max(0) as usize + 1;
        let rows = cells.h.max(0) as usize + 1;
        Self {
            cells,
            pixels: pvp,
            stride,
            bits: vec![0; stride * rows],
        }
    }

    /// Foreground wherever a depth sample is nearer than the clear value.
    pub fn from_depth(depth: &PixelData, pvp: Viewport) -> Self {
        let mut mask = Self::empty(pvp);
        if depth.external_format != format::DEPTH_UNSIGNED_INT {
            return mask;
        }
        mask.scan(depth, |px| px != [0xFF; 4]);
        mask
    }

    /// Foreground wherever the color channels differ from `background`,
    /// given in the data's byte order. Alpha is ignored.
    pub fn from_color(color: &PixelData, pvp: Viewport, background: [u8; 4]) -> Self {
        let mut mask = Self::empty(pvp);
        if color.pixel_size < 3 {
            return mask;
        }
        mask.scan(color, |px| px[..3] != background[..3]);
        mask
    }

    fn scan(&mut self, data: &PixelData, is_foreground: impl Fn(&[u8]) -> bool) {
        let region = data.viewport.intersect(&self.pixels);
        if !region.has_area() || data.pixels.len() != data.byte_len() {
            return;
        }
        let ps = data.pixel_size as usize;
        for y in region.y..region.y_end() {
            let row = data.row((y - data.viewport.y) as usize);
            let cy = y.div_euclid(GRID_SIZE) - self.cells.y;
            for x in region.x..region.x_end() {
                let cx = x.div_euclid(GRID_SIZE) - self.cells.x;
                let i = cy as usize * self.stride + cx as usize;
                if self.bits[i] == FOREGROUND {
                    continue;
                }
                let s = (x - data.viewport.x) as usize * ps;
                if is_foreground(&row[s..s + ps]) {
                    self.bits[i] = FOREGROUND;
                }
            }
        }
    }

    /// Covered cells, absolute cell coordinates.
    pub fn cells(&self) -> Viewport {
        self.cells
    }

    /// The pixel viewport the mask describes.
    pub fn pixel_viewport(&self) -> Viewport {
        self.pixels
    }

    pub fn width(&self) -> i32 {
        self.cells.w
    }

    pub fn height(&self) -> i32 {
        self.cells.h
    }

    /// Mark cell `(x, y)`, relative to [`cells`](Self::cells).
    pub fn set(&mut self, x: i32, y: i32, foreground: bool) {
        if x < 0 || y < 0 || x >= self.cells.w || y >= self.cells.h {
            return;
        }
        self.bits[y as usize * self.stride + x as usize] = if foreground { FOREGROUND } else { 0 };
    }

    pub fn is_foreground(&self, x: i32, y: i32) -> bool {
        if x < 0 || y < 0 || x >= self.cells.w || y >= self.cells.h {
            return false;
        }
        self.bits[y as usize * self.stride + x as usize] == FOREGROUND
    }

    /// Tight bound of the foreground inside `area` (relative cells).
    /// Zero-sized at `area`'s origin when `area` holds no foreground.
    pub fn object_bounds(&self, area: Viewport) -> Viewport {
        if !area.has_area() {
            return Viewport::new(area.x, area.y, 0, 0);
        }
        let mut hist_x = vec![0u32; area.w as usize];
        let mut hist_y = vec![0u32; area.h as usize];
        for y in 0..area.h {
            for x in 0..area.w {
                if self.is_foreground(area.x + x, area.y + y) {
                    hist_x[x as usize] += 1;
                    hist_y[y as usize] += 1;
                }
            }
        }
        let span = |hist: &[u32]| {
            let first = hist.iter().position(|n| *n != 0)?;
            let last = hist.iter().rposition(|n| *n != 0)?;
            Some((first as i32, last as i32))
        };
        match (span(&hist_x), span(&hist_y)) {
            (Some((x0, x1)), Some((y0, y1))) => {
                Viewport::new(area.x + x0, area.y + y0, x1 - x0 + 1, y1 - y0 + 1)
            }
            _ => Viewport::new(area.x, area.y, 0, 0),
        }
    }

    /// Convert a relative cell rectangle to absolute pixels, clipped to
    /// the mask's pixel viewport.
    pub fn to_pixels(&self, area: &Viewport) -> Viewport {
        let abs = Viewport::new(
            (area.x + self.cells.x) * GRID_SIZE,
            (area.y + self.cells.y) * GRID_SIZE,
            area.w * GRID_SIZE,
            area.h * GRID_SIZE,
        );
        abs.intersect(&self.pixels)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_cells_round_outwards() {
        let cells = CellMask::bounding_cells(&Viewport::new(8, 16, 20, 17));
        assert_eq!(cells, Viewport::new(0, 1, 2, 3));
    }

    #[test]
    fn depth_cells_with_geometry_are_foreground() {
        let pvp = Viewport::new(0, 0, 64, 32);
        let mut depth = PixelData::cleared(
            crate::types::Buffer::Depth,
            format::DEPTH,
            format::DEPTH_UNSIGNED_INT,
            pvp,
        )
        .unwrap();
        // One near sample at pixel (40, 20) -> cell (2, 1).
        let i = (20 * 64 + 40) * 4;
        depth.pixels[i..i + 4].copy_from_slice(&7u32.to_le_bytes());

        let mask = CellMask::from_depth(&depth, pvp);
        assert_eq!((mask.width(), mask.height()), (4, 2));
        assert!(mask.is_foreground(2, 1));
        assert!(!mask.is_foreground(1, 1));
        assert_eq!(mask.object_bounds(Viewport::new(0, 0, 4, 2)), Viewport::new(2, 1, 1, 1));
    }

    #[test]
    fn object_bounds_of_empty_area_has_no_size() {
        let mask = CellMask::empty(Viewport::new(0, 0, 64, 64));
        let bounds = mask.object_bounds(Viewport::new(1, 2, 2, 2));
        assert_eq!(bounds, Viewport::new(1, 2, 0, 0));
    }

    #[test]
    fn to_pixels_clips_partial_cells() {
        let mask = CellMask::empty(Viewport::new(0, 0, 40, 40));
        assert_eq!(mask.to_pixels(&Viewport::new(2, 0, 1, 1)), Viewport::new(32, 0, 8, 16));
    }
}

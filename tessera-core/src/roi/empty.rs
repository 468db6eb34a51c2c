//! Largest background rectangle inside a cell area.
//!
//! Row by row, each column keeps the height of the empty run ending at
//! the current row. The widest-times-tallest rectangle under that
//! histogram is found with a monotonic stack, so one scan of the area is
//! `O(w * h)`.

use super::mask::CellMask;
use crate::types::Viewport;

/// Default absolute hole threshold, in cells.
pub const DEFAULT_MIN_CELLS: u32 = 200;
/// Default hole threshold relative to the whole mask.
pub const DEFAULT_MIN_RATIO: f32 = 0.002;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmptySpaceFinder {
    min_cells: u32,
    min_ratio: f32,
}

impl Default for EmptySpaceFinder {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_CELLS, DEFAULT_MIN_RATIO)
    }
}

impl EmptySpaceFinder {
    pub fn new(min_cells: u32, min_ratio: f32) -> Self {
        Self {
            min_cells,
            min_ratio: min_ratio.max(0.0),
        }
    }

    /// Smallest hole worth cutting out of a mask of this size.
    pub fn limit(&self, mask: &CellMask) -> usize {
        let relative = (self.min_ratio * mask.cells().area() as f32).ceil() as usize;
        (self.min_cells as usize).max(relative)
    }

    /// The largest all-background rectangle inside `area`, in the same
    /// relative cell coordinates. Zero-sized at `area`'s origin when no
    /// hole reaches the limit. The first maximum found wins ties.
    pub fn largest_empty_area(&self, mask: &CellMask, area: Viewport) -> Viewport {
        let none = Viewport::new(area.x, area.y, 0, 0);
        if !area.has_area() {
            return none;
        }
        let limit = self.limit(mask).max(1);
        if area.area() < limit {
            return none;
        }

        let width = area.w as usize;
        let mut heights = vec![0usize; width];
        let mut stack: Vec<usize> = Vec::with_capacity(width + 1);
        let mut best = none;
        let mut best_area = 0usize;

        for row in 0..area.h {
            for (i, h) in heights.iter_mut().enumerate() {
                if mask.is_foreground(area.x + i as i32, area.y + row) {
                    *h = 0;
                } else {
                    *h += 1;
                }
            }

            stack.clear();
            for i in 0..=width {
                let h = if i < width { heights[i] } else { 0 };
                while let Some(&top) = stack.last() {
                    if heights[top] < h {
                        break;
                    }
                    stack.pop();
                    let height = heights[top];
                    let left = stack.last().map_or(0, |&s| s + 1);
                    let size = height * (i - left);
                    if size > best_area {
                        best_area = size;
                        best = Viewport::new(
                            area.x + left as i32,
                            area.y + row - height as i32 + 1,
                            (i - left) as i32,
                            height as i32,
                        );
                    }
                }
                stack.push(i);
            }
        }

        if best_area < limit { none } else { best }
    }
}

// ── Tests ────────────────────────────────────────────────────────

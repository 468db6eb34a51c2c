//! Region-of-interest decomposition.
//!
//! Before an image is compressed, [`RoiFinder`] shrinks its viewport to a
//! set of non-overlapping rectangles covering everything but background.
//!
//! ```text
//!  pixels ──► CellMask (16×16 cells) ──► bound ──► hole? ──► split ──┐
//!                                          ▲                        │
//!                                          └──── sub-area with hole ┘
//! ```
//!
//! Each area is the tight bound of its foreground plus its largest hole.
//! An area with a hole is split around it: the hole's position inside the
//! bound picks a topology, every topology lists candidate groupings of
//! sub-rectangles, and the grouping reclaiming the most empty cells wins.
//!
//! | Type | Hole touches                    | Groupings |
//! |------|---------------------------------|-----------|
//! | 0–1  | left edge, top / bottom corner  | 2 × 2     |
//! | 3,5  | right edge, top / bottom corner | 2 × 2     |
//! | 2,4  | left / top edge                 | 4 × 3     |
//! | 6,7  | right / bottom edge             | 4 × 3     |
//! | 8    | top and bottom                  | 1 × 2     |
//! | 9    | left and right                  | 1 × 2     |
//! | 10   | nothing (interior)              | 18 × 4    |

pub mod empty;
pub mod mask;
pub mod tracker;

pub use empty::EmptySpaceFinder;
pub use mask::{CellMask, GRID_SIZE};
pub use tracker::{RoiTicket, RoiTracker};

use tracing::{trace, warn};

use crate::image::Image;
use crate::types::{Buffer, Buffers, Viewport, Zoom, format};

// ── Split tables ─────────────────────────────────────────────────

/// Sub-area groupings per edge/corner topology, indexed by split type.
const GROUPINGS: [&[&[usize]]; 10] = [
    &[&[2, 7], &[3, 10]],
    &[&[3, 8], &[4, 11]],
    &[&[2, 4, 14], &[4, 10, 11], &[3, 8, 10], &[2, 7, 8]],
    &[&[1, 6], &[2, 9]],
    &[&[1, 3, 15], &[3, 9, 10], &[2, 7, 9], &[1, 6, 7]],
    &[&[1, 12], &[4, 5]],
    &[&[2, 4, 13], &[4, 5, 6], &[1, 6, 12], &[2, 9, 12]],
    &[&[1, 3, 16], &[1, 11, 12], &[5, 4, 11], &[3, 5, 8]],
    &[&[1, 3]],
    &[&[2, 4]],
];

/// Groupings for a hole touching no edge of its bound.
const CENTER_GROUPINGS: [[usize; 4]; 18] = [
    [13, 2, 4, 14],
    [13, 4, 10, 11],
    [13, 3, 8, 10],
    [13, 2, 7, 8],
    [16, 1, 3, 15],
    [16, 3, 9, 10],
    [16, 2, 7, 9],
    [16, 1, 6, 7],
    [14, 2, 4, 13],
    [14, 4, 5, 6],
    [14, 1, 6, 12],
    [14, 2, 9, 12],
    [15, 1, 3, 16],
    [15, 1, 11, 12],
    [15, 5, 4, 11],
    [15, 3, 5, 8],
    [5, 6, 7, 8],
    [9, 10, 11, 12],
];

const CENTER: usize = 10;
const SUB_AREAS: usize = 16;

// ── Area ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct Area {
    /// Tight foreground bound.
    pvp: Viewport,
    /// Largest hole inside `pvp`, zero-sized if none.
    hole: Viewport,
    /// Cells of the enclosing rectangle not transmitted if this area is.
    empty_size: i64,
}

/// Column and row splits of a bound around its hole.
///
/// ```text
///  x1   x2     x3
///  ┌────┬──────┬────┐ y1
///  │    │      │    │
///  ├────┼──────┼────┤ y2
///  │    │ hole │    │
///  ├────┼──────┼────┤ y3
///  │    │      │    │
///  └────┴──────┴────┘
/// ```
#[derive(Debug, Clone, Copy)]
struct Splits {
    x: [i32; 3],
    y: [i32; 3],
    /// `before, hole, after, before+hole, hole+after, all`.
    w: [i32; 6],
    h: [i32; 6],
}

impl Splits {
    fn new(area: &Area) -> Self {
        let (pvp, hole) = (area.pvp, area.hole);
        let axis = |start: i32, len: i32, hole_start: i32, hole_len: i32| {
            let pos = [start, hole_start, hole_start + hole_len];
            let a = pos[1] - pos[0];
            let b = hole_len;
            let c = start + len - pos[2];
            (pos, [a, b, c, a + b, b + c, a + b + c])
        };
        let (x, w) = axis(pvp.x, pvp.w, hole.x, hole.w);
        let (y, h) = axis(pvp.y, pvp.h, hole.y, hole.h);
        Self { x, y, w, h }
    }

    /// Candidate sub-rectangle `index` (1-based).
    fn rect(&self, index: usize) -> Viewport {
        let [x1, x2, x3] = self.x;
        let [y1, y2, y3] = self.y;
        let [w1, w2, w3, w4, w5, w6] = self.w;
        let [h1, h2, h3, h4, h5, h6] = self.h;
        let (x, y, w, h) = match index {
            1 => (x1, y2, w1, h2),
            2 => (x2, y3, w2, h3),
            3 => (x3, y2, w3, h2),
            4 => (x2, y1, w2, h1),
            5 => (x1, y1, w1, h4),
            6 => (x1, y3, w4, h3),
            7 => (x3, y2, w3, h5),
            8 => (x2, y1, w5, h1),
            9 => (x1, y2, w1, h5),
            10 => (x2, y3, w5, h3),
            11 => (x3, y1, w3, h4),
            12 => (x1, y1, w4, h1),
            13 => (x1, y1, w1, h6),
            14 => (x3, y1, w3, h6),
            15 => (x1, y3, w6, h3),
            _ => (x1, y1, w6, h1),
        };
        Viewport::new(x, y, w, h)
    }
}

/// Where the hole sits inside its bound.
fn split_type(area: &Area) -> usize {
    let (pvp, hole) = (area.pvp, area.hole);
    if pvp.h == hole.h {
        8
    } else if pvp.w == hole.w {
        9
    } else if pvp.x == hole.x {
        if pvp.y == hole.y {
            0
        } else if pvp.y_end() == hole.y_end() {
            1
        } else {
            2
        }
    } else if pvp.y == hole.y {
        if pvp.x_end() == hole.x_end() { 3 } else { 4 }
    } else if pvp.x_end() == hole.x_end() {
        if pvp.y_end() == hole.y_end() { 5 } else { 6 }
    } else if pvp.y_end() == hole.y_end() {
        7
    } else {
        CENTER
    }
}

// ── RoiFinder ────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct RoiFinder {
    empty: EmptySpaceFinder,
    tracker: RoiTracker,
    /// Clear color, RGBA, for color-based masks.
    background: [u8; 4],
}

impl RoiFinder {
    pub fn new(empty: EmptySpaceFinder, tracker: RoiTracker) -> Self {
        Self {
            empty,
            tracker,
            background: [0; 4],
        }
    }

    pub fn set_background(&mut self, rgba: [u8; 4]) {
        self.background = rgba;
    }

    /// Regions of `pvp` worth transmitting for frame `frame_id`.
    ///
    /// Falls back to the whole viewport for zoomed sources, when the
    /// tracker is backing off, or when `source` has no usable pixels.
    /// An empty result means nothing but background was rendered.
    pub fn find_regions(
        &mut self,
        buffers: Buffers,
        pvp: Viewport,
        zoom: Zoom,
        stage: u32,
        frame_id: u64,
        source: &Image,
    ) -> Vec<Viewport> {
        let whole = vec![pvp];
        if !zoom.is_none() {
            warn!(%pvp, "region of interest is not supported for zoomed images");
            return whole;
        }
        let Some(ticket) = self.tracker.use_roi(pvp, stage, frame_id) else {
            return whole;
        };
        let Some(mask) = self.mask(buffers, pvp, source) else {
            return whole;
        };

        let regions = self.find_areas(&mask);
        self.tracker.update_delay(ticket, &regions);
        trace!(%pvp, frame_id, regions = regions.len(), "regions of interest");
        regions
    }

    fn mask(&self, buffers: Buffers, pvp: Viewport, source: &Image) -> Option<CellMask> {
        let usable = |b: Buffer| {
            buffers.contains(b.mask())
                && source.has_pixel_data(b)
                && !source.pixel_data(b).is_compressed()
        };
        if usable(Buffer::Depth) {
            return Some(CellMask::from_depth(source.pixel_data(Buffer::Depth), pvp));
        }
        if usable(Buffer::Color) {
            let data = source.pixel_data(Buffer::Color);
            let bg = self.background;
            let background = if data.external_format == format::BGRA {
                [bg[2], bg[1], bg[0], bg[3]]
            } else {
                bg
            };
            return Some(CellMask::from_color(data, pvp, background));
        }
        None
    }

    /// Non-overlapping pixel rectangles covering every foreground cell.
    pub fn find_areas(&self, mask: &CellMask) -> Vec<Viewport> {
        let whole = Viewport::new(0, 0, mask.width(), mask.height());
        let root = self.area(mask, whole);
        if !root.pvp.has_area() {
            return Vec::new();
        }

        let mut cells = Vec::new();
        let mut stack = Vec::new();
        if root.hole.has_area() {
            stack.push(root);
        } else {
            cells.push(root.pvp);
        }
        while let Some(area) = stack.pop() {
            for sub in self.split(mask, &area) {
                if sub.hole.has_area() {
                    stack.push(sub);
                } else {
                    cells.push(sub.pvp);
                }
            }
        }

        cells
            .iter()
            .map(|c| mask.to_pixels(c))
            .filter(Viewport::has_area)
            .collect()
    }

    fn area(&self, mask: &CellMask, rect: Viewport) -> Area {
        let pvp = mask.object_bounds(rect);
        let hole = self.empty.largest_empty_area(mask, pvp);
        Area {
            pvp,
            hole,
            empty_size: rect.area() as i64 - pvp.area() as i64 + hole.area() as i64,
        }
    }

    /// Split `area` around its hole into the best-paying grouping.
    fn split(&self, mask: &CellMask, area: &Area) -> Vec<Area> {
        let splits = Splits::new(area);
        let mut cache: [Option<Area>; SUB_AREAS + 1] = [None; SUB_AREAS + 1];
        let mut sub = |index: usize| {
            *cache[index].get_or_insert_with(|| self.area(mask, splits.rect(index)))
        };

        let ty = split_type(area);
        let groupings: Vec<&[usize]> = if ty == CENTER {
            CENTER_GROUPINGS.iter().map(|g| g.as_slice()).collect()
        } else {
            GROUPINGS[ty].to_vec()
        };

        let mut best = 0;
        let mut max_sum = 0;
        for (i, grouping) in groupings.iter().enumerate() {
            let sum: i64 = grouping.iter().map(|&index| sub(index).empty_size).sum();
            if sum > max_sum {
                max_sum = sum;
                best = i;
            }
        }

        groupings[best]
            .iter()
            .map(|&index| sub(index))
            .filter(|a| a.pvp.has_area())
            .collect()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::PixelData;

    fn finder() -> RoiFinder {
        RoiFinder::new(EmptySpaceFinder::new(1, 0.0), RoiTracker::default())
    }

    fn mask(w: i32, h: i32, foreground: &[Viewport]) -> CellMask {
        let mut mask = CellMask::empty(Viewport::new(0, 0, w * GRID_SIZE, h * GRID_SIZE));
        for r in foreground {
            for y in r.y..r.y_end() {
                for x in r.x..r.x_end() {
                    mask.set(x, y, true);
                }
            }
        }
        mask
    }

    fn cells(regions: &[Viewport]) -> Vec<Viewport> {
        regions
            .iter()
            .map(|r| Viewport::new(r.x / GRID_SIZE, r.y / GRID_SIZE, r.w / GRID_SIZE, r.h / GRID_SIZE))
            .collect()
    }

    fn assert_cover(mask: &CellMask, regions: &[Viewport]) {
        for r in regions {
            assert!(r.has_area());
        }
        for (i, a) in regions.iter().enumerate() {
            for b in &regions[i + 1..] {
                assert!(!a.intersect(b).has_area(), "{a} overlaps {b}");
            }
        }
        for y in 0..mask.height() {
            for x in 0..mask.width() {
                if mask.is_foreground(x, y) {
                    let px = (x * GRID_SIZE, y * GRID_SIZE);
                    assert!(
                        regions
                            .iter()
                            .any(|r| r.contains(&Viewport::new(px.0, px.1, 1, 1))),
                        "cell ({x}, {y}) not covered"
                    );
                }
            }
        }
    }

    #[test]
    fn single_block_yields_one_region() {
        let block = Viewport::new(3, 2, 4, 5);
        let mask = mask(12, 10, &[block]);
        let regions = finder().find_areas(&mask);
        assert_eq!(cells(&regions), vec![block]);
    }

    #[test]
    fn empty_mask_yields_nothing() {
        let mask = mask(8, 8, &[]);
        assert!(finder().find_areas(&mask).is_empty());
    }

    #[test]
    fn two_corners_split_around_the_gap() {
        let a = Viewport::new(0, 0, 3, 3);
        let b = Viewport::new(9, 9, 3, 3);
        let mask = mask(12, 12, &[a, b]);
        let regions = finder().find_areas(&mask);
        assert_cover(&mask, &regions);
        let mut got = cells(&regions);
        got.sort_by_key(|r| (r.x, r.y));
        assert_eq!(got, vec![a, b]);
    }

    #[test]
    fn ring_leaves_the_interior_out() {
        // A frame 10x10 cells, one cell thick.
        let ring = [
            Viewport::new(0, 0, 10, 1),
            Viewport::new(0, 9, 10, 1),
            Viewport::new(0, 1, 1, 8),
            Viewport::new(9, 1, 1, 8),
        ];
        let mask = mask(10, 10, &ring);
        let regions = finder().find_areas(&mask);
        assert_cover(&mask, &regions);
        assert_eq!(regions.len(), 4);
        let covered: usize = regions.iter().map(Viewport::area).sum();
        assert_eq!(covered, 36 * (GRID_SIZE * GRID_SIZE) as usize);
    }

    #[test]
    fn scattered_cells_are_covered_without_overlap() {
        let dots: Vec<_> = [(0, 0), (5, 1), (11, 3), (2, 7), (8, 8), (13, 12), (6, 13)]
            .iter()
            .map(|&(x, y)| Viewport::new(x, y, 1, 1))
            .collect();
        let mask = mask(14, 14, &dots);
        let regions = finder().find_areas(&mask);
        assert_cover(&mask, &regions);
        let covered: usize = regions.iter().map(Viewport::area).sum();
        assert!(covered < 14 * 14 * (GRID_SIZE * GRID_SIZE) as usize);
    }

    #[test]
    fn regions_are_clipped_to_the_viewport() {
        let pvp = Viewport::new(0, 0, 40, 24);
        let mut mask = CellMask::empty(pvp);
        mask.set(2, 1, true);
        let regions = finder().find_areas(&mask);
        assert_eq!(regions, vec![Viewport::new(32, 16, 8, 8)]);
    }

    #[test]
    fn zoomed_source_returns_whole_viewport() {
        let pvp = Viewport::new(0, 0, 64, 64);
        let img = Image::new();
        let regions = finder().find_regions(Buffers::COLOR, pvp, Zoom::new(2.0, 2.0), 0, 1, &img);
        assert_eq!(regions, vec![pvp]);
    }

    #[test]
    fn color_source_is_cut_to_foreground() {
        let pvp = Viewport::new(0, 0, 128, 128);
        let mut data = PixelData::cleared(Buffer::Color, format::RGBA, format::RGBA, pvp).unwrap();
        // Paint a 32x16 block at (64, 32).
        for y in 32..48 {
            for x in 64..96 {
                let i = (y * 128 + x) * 4;
                data.pixels[i] = 200;
            }
        }
        let mut img = Image::new();
        img.set_flat_pixel_data(Buffer::Color, data).unwrap();

        let mut roi = finder();
        roi.set_background([0, 0, 0, 255]);
        let regions = roi.find_regions(Buffers::COLOR, pvp, Zoom::NONE, 0, 1, &img);
        assert_eq!(regions, vec![Viewport::new(64, 32, 32, 16)]);
    }

    #[test]
    fn backing_off_returns_whole_viewport() {
        let pvp = Viewport::new(0, 0, 32, 32);
        let data = PixelData::new(format::RGBA, format::RGBA, pvp).unwrap();
        let mut img = Image::new();
        img.set_flat_pixel_data(Buffer::Color, data).unwrap();

        let mut roi = finder();
        roi.set_background([1, 1, 1, 0]);
        // Every cell differs from the background: no payoff.
        assert_eq!(roi.find_regions(Buffers::COLOR, pvp, Zoom::NONE, 0, 1, &img), vec![pvp]);
        assert_eq!(roi.tracker.pending_skip(pvp, 0), 1);
        assert_eq!(roi.find_regions(Buffers::COLOR, pvp, Zoom::NONE, 0, 2, &img), vec![pvp]);
        assert_eq!(roi.tracker.pending_skip(pvp, 0), 0);
    }
}

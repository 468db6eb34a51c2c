//! Row-parallel CPU merge kernels.
//!
//! Every kernel writes one input image into a scratch color buffer (and
//! optional depth buffer) covering `dest`. Rows are independent, so each
//! kernel hands whole destination rows to rayon.
//!
//! | Kernel        | Input                  | Rule                                   |
//! |---------------|------------------------|----------------------------------------|
//! | `merge_db`    | color + depth          | copy where `dest_depth > src_depth`    |
//! | `merge_blend` | color with alpha       | `dst = min(src + (a * dst >> 8), 255)` |
//! | `merge_2d`    | color                  | row copy, depth row zeroed             |

use rayon::prelude::*;

use crate::image::Image;
use crate::types::{Buffer, Offset, Viewport};

/// Read a depth sample as stored on the wire.
#[inline]
pub(crate) fn depth_sample(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// `ONE, SRC_ALPHA` blending in 8-bit fixed point. The source alpha is
/// the fraction of light passing through the source.
#[inline]
pub(crate) fn blend_pixel(dst: &mut [u8], src: &[u8]) {
    let alpha = src[3] as u32;
    for c in 0..3 {
        dst[c] = (src[c] as u32 + ((alpha * dst[c] as u32) >> 8)).min(255) as u8;
    }
    dst[3] = ((alpha * dst[3] as u32) >> 8) as u8;
}

/// Where an image lands inside the scratch buffers.
struct Placement {
    /// First destination row.
    row: usize,
    /// Byte offset of the first pixel inside a destination row.
    column: usize,
    rows: usize,
    /// Bytes per source row.
    span: usize,
}

impl Placement {
    fn new(dest: Viewport, image: &Image, offset: Offset, pixel_size: usize) -> Self {
        let pvp = image.viewport();
        Self {
            row: (offset.y + pvp.y - dest.y) as usize,
            column: (offset.x + pvp.x - dest.x) as usize * pixel_size,
            rows: pvp.h as usize,
            span: pvp.w as usize * pixel_size,
        }
    }
}

/// Sort-last merge: keep the nearer fragment, ties keep the destination.
pub(crate) fn merge_db(
    color: &mut [u8],
    depth: &mut [u8],
    dest: Viewport,
    image: &Image,
    offset: Offset,
) {
    let at = Placement::new(dest, image, offset, 4);
    let stride = dest.w as usize * 4;
    let src_color = &image.pixel_data(Buffer::Color).pixels;
    let src_depth = &image.pixel_data(Buffer::Depth).pixels;

    color
        .par_chunks_mut(stride)
        .zip(depth.par_chunks_mut(stride))
        .skip(at.row)
        .take(at.rows)
        .enumerate()
        .for_each(|(y, (color_row, depth_row))| {
            let sc = &src_color[y * at.span..(y + 1) * at.span];
            let sd = &src_depth[y * at.span..(y + 1) * at.span];
            let dc = &mut color_row[at.column..at.column + at.span];
            let dd = &mut depth_row[at.column..at.column + at.span];
            for (((dc, dd), sc), sd) in dc
                .chunks_exact_mut(4)
                .zip(dd.chunks_exact_mut(4))
                .zip(sc.chunks_exact(4))
                .zip(sd.chunks_exact(4))
            {
                if depth_sample(dd) > depth_sample(sd) {
                    dc.copy_from_slice(sc);
                    dd.copy_from_slice(sd);
                }
            }
        });
}

/// 2D tile paste. Clears the matching depth rows so later depth merges
/// see this tile as nearest.
pub(crate) fn merge_2d(
    color: &mut [u8],
    depth: Option<&mut [u8]>,
    dest: Viewport,
    image: &Image,
    offset: Offset,
) {
    let src = image.pixel_data(Buffer::Color);
    let pixel_size = src.pixel_size as usize;
    let at = Placement::new(dest, image, offset, pixel_size);
    let stride = dest.w as usize * pixel_size;

    color
        .par_chunks_mut(stride)
        .skip(at.row)
        .take(at.rows)
        .enumerate()
        .for_each(|(y, row)| {
            row[at.column..at.column + at.span]
                .copy_from_slice(&src.pixels[y * at.span..(y + 1) * at.span]);
        });

    if let Some(depth) = depth {
        let at = Placement::new(dest, image, offset, 4);
        depth
            .par_chunks_mut(dest.w as usize * 4)
            .skip(at.row)
            .take(at.rows)
            .for_each(|row| row[at.column..at.column + at.span].fill(0));
    }
}

/// Back-to-front alpha blend of a four-channel 8-bit image.
pub(crate) fn merge_blend(color: &mut [u8], dest: Viewport, image: &Image, offset: Offset) {
    let at = Placement::new(dest, image, offset, 4);
    let src = &image.pixel_data(Buffer::Color).pixels;

    color
        .par_chunks_mut(dest.w as usize * 4)
        .skip(at.row)
        .take(at.rows)
        .enumerate()
        .for_each(|(y, row)| {
            let sc = &src[y * at.span..(y + 1) * at.span];
            for (dst, src) in row[at.column..at.column + at.span]
                .chunks_exact_mut(4)
                .zip(sc.chunks_exact(4))
            {
                blend_pixel(dst, src);
            }
        });
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::PixelData;
    use crate::types::format;

    fn image(vp: Viewport, rgba: [u8; 4], depth: Option<u32>) -> Image {
        let mut img = Image::new();
        let mut c = PixelData::new(format::RGBA, format::RGBA, vp).unwrap();
        c.pixels.chunks_exact_mut(4).for_each(|px| px.copy_from_slice(&rgba));
        img.set_flat_pixel_data(Buffer::Color, c).unwrap();
        if let Some(z) = depth {
            let mut d = PixelData::new(format::DEPTH, format::DEPTH_UNSIGNED_INT, vp).unwrap();
            d.pixels.chunks_exact_mut(4).for_each(|px| px.copy_from_slice(&z.to_le_bytes()));
            img.set_flat_pixel_data(Buffer::Depth, d).unwrap();
        }
        img
    }

    #[test]
    fn opaque_source_replaces_color() {
        let mut dst = [10, 20, 30, 255];
        blend_pixel(&mut dst, &[200, 100, 50, 0]);
        assert_eq!(dst, [200, 100, 50, 0]);
    }

    #[test]
    fn transparent_source_keeps_destination_up_to_rounding() {
        for value in [0u8, 1, 17, 128, 200, 255] {
            let mut dst = [value, value, value, 255];
            blend_pixel(&mut dst, &[0, 0, 0, 255]);
            assert_eq!(dst[0], ((value as u32 * 255) >> 8) as u8);
            assert!(value - dst[0] <= 1);
        }
    }

    #[test]
    fn blend_saturates() {
        let mut dst = [255, 255, 255, 255];
        blend_pixel(&mut dst, &[200, 200, 200, 128]);
        assert_eq!(&dst[..3], &[255, 255, 255]);
        assert_eq!(dst[3], 127);
    }

    #[test]
    fn depth_merge_keeps_nearest_and_ties_keep_first() {
        let dest = Viewport::new(0, 0, 4, 1);
        let mut color = vec![0u8; 16];
        let mut depth = vec![0xFFu8; 16];

        let far = image(Viewport::new(0, 0, 4, 1), [255, 0, 0, 255], Some(100));
        let near = image(Viewport::new(2, 0, 2, 1), [0, 0, 255, 255], Some(50));
        let tie = image(Viewport::new(0, 0, 4, 1), [0, 255, 0, 255], Some(100));
        for img in [&far, &near, &tie] {
            merge_db(&mut color, &mut depth, dest, img, Offset::ZERO);
        }

        assert_eq!(&color[0..4], &[255, 0, 0, 255]);
        assert_eq!(&color[8..12], &[0, 0, 255, 255]);
        assert_eq!(depth_sample(&depth[0..4]), 100);
        assert_eq!(depth_sample(&depth[12..16]), 50);
    }

    #[test]
    fn paste_honours_offset_and_clears_depth() {
        let dest = Viewport::new(0, 0, 3, 3);
        let mut color = vec![0u8; 36];
        let mut depth = vec![0xFFu8; 36];
        let tile = image(Viewport::new(0, 0, 1, 1), [9, 9, 9, 9], None);
        merge_2d(&mut color, Some(&mut depth), dest, &tile, Offset::new(1, 2));

        let idx = (2 * 3 + 1) * 4;
        assert_eq!(&color[idx..idx + 4], &[9, 9, 9, 9]);
        assert_eq!(depth_sample(&depth[idx..idx + 4]), 0);
        assert_eq!(depth_sample(&depth[0..4]), u32::MAX);
        assert_eq!(color.iter().filter(|b| **b == 9).count(), 4);
    }
}

//! Contrast-limited adaptive histogram equalization on lightness.
//!
//! The image is split into a grid of tiles. Each tile gets its own
//! equalization lookup table built from a clipped 256-bin histogram of
//! L\*; pixels are then remapped by bilinear interpolation between the
//! tables of the four nearest tile centers, which avoids visible seams
//! at tile boundaries.
//!
//! Only L\* is touched. The a\*/b\* channels and alpha pass through, so
//! hue and chroma are preserved up to sRGB rounding.

use crate::color::{Lab, MAX_LIGHTNESS, Rgb, to_display, to_perceptual};
use crate::types::RgbaImage;

/// Number of histogram bins (one per 8-bit lightness level).
const BINS: usize = 256;

/// Scale from L\* (0–100) to bin index (0–255).
const BIN_SCALE: f32 = 255.0 / MAX_LIGHTNESS;

type Lut = [u8; BINS];

/// Enhance local contrast of `image`.
///
/// `tile_grid` is the number of tiles per axis, clamped to the image
/// width/height so every tile holds at least one pixel. `clip_limit` is
/// the maximum bin height as a multiple of the average bin height.
///
/// Both parameters are validated by
/// [`PipelineConfig::validate`](crate::PipelineConfig::validate); a zero
/// grid is treated as 1.
#[must_use = "returns the enhanced image"]
pub fn enhance(image: &RgbaImage, clip_limit: f32, tile_grid: u32) -> RgbaImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }

    let grid_x = tile_grid.clamp(1, width);
    let grid_y = tile_grid.clamp(1, height);
    let cols = tile_bounds(width, grid_x);
    let rows = tile_bounds(height, grid_y);

    let lab: Vec<Lab> = image
        .pixels()
        .map(|p| to_perceptual(Rgb::new(p.0[0], p.0[1], p.0[2])))
        .collect();
    let bins: Vec<u8> = lab.iter().map(|c| lightness_bin(c.l)).collect();

    let mut luts: Vec<Lut> = Vec::with_capacity(cols.len() * rows.len());
    for &(y0, y1) in &rows {
        for &(x0, x1) in &cols {
            luts.push(tile_lut(&bins, width, (x0, x1), (y0, y1), clip_limit));
        }
    }

    let col_centers = tile_centers(&cols);
    let row_centers = tile_centers(&rows);
    let grid_w = cols.len();

    let mut out = RgbaImage::new(width, height);
    for (x, y, px) in out.enumerate_pixels_mut() {
        let idx = y as usize * width as usize + x as usize;
        let bin = usize::from(bins[idx]);

        let (c0, c1, fx) = interpolation_span(x, &col_centers);
        let (r0, r1, fy) = interpolation_span(y, &row_centers);
        let sample = |r: usize, c: usize| f32::from(luts[r * grid_w + c][bin]);

        let top = sample(r0, c0).mul_add(1.0 - fx, sample(r0, c1) * fx);
        let bottom = sample(r1, c0).mul_add(1.0 - fx, sample(r1, c1) * fx);
        let mapped = top.mul_add(1.0 - fy, bottom * fy);

        let source = lab[idx];
        let rgb = to_display(Lab::new(mapped / BIN_SCALE, source.a, source.b));
        let alpha = image.as_raw()[idx * 4 + 3];
        *px = image::Rgba([rgb.r, rgb.g, rgb.b, alpha]);
    }

    tracing::debug!(
        grid_x,
        grid_y,
        clip_limit,
        "local contrast enhancement complete",
    );
    out
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn lightness_bin(l: f32) -> u8 {
    (l * BIN_SCALE).round().clamp(0.0, 255.0) as u8
}

/// Half-open pixel ranges of `grid` equal tiles along an axis. The last
/// tile absorbs the remainder.
fn tile_bounds(extent: u32, grid: u32) -> Vec<(u32, u32)> {
    let size = extent / grid;
    (0..grid)
        .map(|i| {
            let start = i * size;
            let end = if i + 1 == grid { extent } else { start + size };
            (start, end)
        })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn tile_centers(bounds: &[(u32, u32)]) -> Vec<f32> {
    bounds
        .iter()
        .map(|&(start, end)| (start + end - 1) as f32 / 2.0)
        .collect()
}

/// Locate `pos` between two adjacent tile centers. Returns the two tile
/// indices and the weight of the second. Positions outside the outermost
/// centers clamp to the nearest tile.
#[allow(clippy::cast_precision_loss)]
fn interpolation_span(pos: u32, centers: &[f32]) -> (usize, usize, f32) {
    let p = pos as f32;
    let last = centers.len() - 1;
    if p <= centers[0] {
        return (0, 0, 0.0);
    }
    if p >= centers[last] {
        return (last, last, 0.0);
    }
    // centers are strictly increasing, so the first center past `p`
    // exists and is not the first one.
    let upper = centers.partition_point(|&c| c <= p);
    let lower = upper - 1;
    let span = centers[upper] - centers[lower];
    (lower, upper, (p - centers[lower]) / span)
}

/// Histogram, clip and integrate one tile into a lookup table.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
fn tile_lut(bins: &[u8], width: u32, (x0, x1): (u32, u32), (y0, y1): (u32, u32), clip: f32) -> Lut {
    let mut hist = [0_u32; BINS];
    for y in y0..y1 {
        let row = y as usize * width as usize;
        for x in x0..x1 {
            hist[usize::from(bins[row + x as usize])] += 1;
        }
    }

    let area = (x1 - x0) * (y1 - y0);
    let limit = (clip * area as f32 / BINS as f32).max(1.0).floor() as u32;
    clip_histogram(&mut hist, limit);

    let scale = 255.0 / area as f32;
    let mut lut = [0_u8; BINS];
    let mut cdf = 0_u32;
    for (entry, &count) in lut.iter_mut().zip(&hist) {
        cdf += count;
        *entry = (cdf as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }
    lut
}

/// Clip every bin to `limit` and spread the excess back over the
/// histogram: an equal batch to every bin, then the remainder one count
/// at a time at a fixed stride. The total count is preserved.
fn clip_histogram(hist: &mut [u32; BINS], limit: u32) {
    let mut excess = 0;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }
    if excess == 0 {
        return;
    }

    let bins = BINS as u32;
    let batch = excess / bins;
    let residual = (excess % bins) as usize;
    for bin in hist.iter_mut() {
        *bin += batch;
    }
    if residual > 0 {
        let stride = (BINS / residual).max(1);
        for bin in hist.iter_mut().step_by(stride).take(residual) {
            *bin += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::cast_precision_loss)]
    fn lightness_stats(image: &RgbaImage) -> (f32, f32) {
        let ls: Vec<f32> = image
            .pixels()
            .map(|p| to_perceptual(Rgb::new(p.0[0], p.0[1], p.0[2])).l)
            .collect();
        let n = ls.len() as f32;
        let mean = ls.iter().sum::<f32>() / n;
        let var = ls.iter().map(|l| (l - mean) * (l - mean)).sum::<f32>() / n;
        (mean, var.sqrt())
    }

    /// A low-contrast horizontal gray ramp from 100 to 140.
    fn flat_ramp(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, _| {
            let v = 100 + (x * 40 / width.max(1)) as u8;
            image::Rgba([v, v, v, 255])
        })
    }

    #[test]
    fn dimensions_are_preserved() {
        for (w, h) in [(1, 1), (3, 2), (17, 9), (64, 64)] {
            let out = enhance(&flat_ramp(w, h), 2.0, 8);
            assert_eq!(out.dimensions(), (w, h));
        }
    }

    #[test]
    fn alpha_is_preserved() {
        let img = RgbaImage::from_fn(16, 16, |x, y| {
            image::Rgba([(x * 16) as u8, (y * 16) as u8, 80, (x + y) as u8])
        });
        let out = enhance(&img, 2.0, 4);
        for (a, b) in img.pixels().zip(out.pixels()) {
            assert_eq!(a.0[3], b.0[3]);
        }
    }

    #[test]
    fn low_contrast_ramp_gains_contrast() {
        let img = flat_ramp(64, 64);
        let out = enhance(&img, 4.0, 4);
        let (_, before) = lightness_stats(&img);
        let (_, after) = lightness_stats(&out);
        assert!(after > before, "spread {before} -> {after}");
    }

    #[test]
    fn gray_stays_gray() {
        let out = enhance(&flat_ramp(32, 32), 2.0, 4);
        for p in out.pixels() {
            let [r, g, b, _] = p.0;
            assert!(r.abs_diff(g) <= 2 && g.abs_diff(b) <= 2, "{:?}", p.0);
        }
    }

    #[test]
    fn uniform_image_stays_uniform() {
        let img = RgbaImage::from_pixel(32, 32, image::Rgba([120, 90, 60, 255]));
        let out = enhance(&img, 2.0, 4);
        let first = *out.get_pixel(0, 0);
        assert!(out.pixels().all(|p| *p == first));
    }

    #[test]
    fn tile_bounds_cover_extent() {
        let bounds = tile_bounds(10, 3);
        assert_eq!(bounds, vec![(0, 3), (3, 6), (6, 10)]);
    }

    #[test]
    fn interpolation_clamps_at_borders() {
        let centers = [1.5, 5.5, 9.5];
        assert_eq!(interpolation_span(0, &centers), (0, 0, 0.0));
        assert_eq!(interpolation_span(11, &centers), (2, 2, 0.0));
        let (a, b, w) = interpolation_span(3, &centers);
        assert_eq!((a, b), (0, 1));
        assert!((w - 0.375).abs() < 1e-6);
    }

    #[test]
    fn clipping_preserves_total_count() {
        let mut hist = [0_u32; BINS];
        hist[10] = 900;
        hist[200] = 100;
        clip_histogram(&mut hist, 20);
        assert_eq!(hist.iter().sum::<u32>(), 1000);
        assert!(hist.iter().all(|&c| c <= 20 + 4));
    }

    #[test]
    fn unclipped_histogram_is_untouched() {
        let mut hist = [3_u32; BINS];
        clip_histogram(&mut hist, 5);
        assert!(hist.iter().all(|&c| c == 3));
    }
}

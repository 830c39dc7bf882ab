//! Palette-constrained quantization with tolerance-bounded rebalancing.
//!
//! Pass 1 maps every pixel to its perceptually nearest palette entry.
//! Pass 2 then works each mask region on its own: palette colors whose
//! realized share overshoots `target + tolerance` give pixels to colors
//! that undershoot `target − tolerance`. The pixels that move are the
//! ones for which the swap costs the least perceptual error, so the
//! rebalanced image stays as close to the source as the targets allow.
//!
//! Rebalancing is a single pass over (surplus, deficit) pairs. When the
//! targets cannot be met in that pass, the result is still returned and
//! the unmet targets are reported in [`BalanceOutcome::BestEffortUnmet`].

use serde::{Deserialize, Serialize};

use crate::color::{Lab, Rgb, to_perceptual};
use crate::types::{Palette, Region, RgbaImage, SegmentationMask};

/// Slack for comparing realized percentages against the tolerance band,
/// absorbing floating-point error in `100 · count / total`.
const BAND_EPSILON: f64 = 1e-9;

/// Palette usage within one mask region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionUsage {
    /// Which region this describes.
    pub region: Region,
    /// Number of pixels in the region.
    pub pixel_count: usize,
    /// Pixels assigned to each palette entry.
    pub counts: Vec<usize>,
    /// Pixels moved to a different color by rebalancing.
    pub reassigned: usize,
}

impl RegionUsage {
    fn empty(region: Region, palette_len: usize) -> Self {
        Self {
            region,
            pixel_count: 0,
            counts: vec![0; palette_len],
            reassigned: 0,
        }
    }

    /// Realized share of palette entry `index`, in percent. An empty
    /// region reports 0 for every entry.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percentage(&self, index: usize) -> f64 {
        if self.pixel_count == 0 {
            return 0.0;
        }
        100.0 * self.counts[index] as f64 / self.pixel_count as f64
    }

    /// Realized share of every palette entry, in percent.
    #[must_use]
    pub fn percentages(&self) -> Vec<f64> {
        (0..self.counts.len()).map(|i| self.percentage(i)).collect()
    }
}

/// A palette entry whose realized share fell outside its tolerance band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToleranceViolation {
    /// Region in which the target was missed.
    pub region: Region,
    /// Palette index.
    pub palette_index: usize,
    /// Requested percentage.
    pub target: f64,
    /// Achieved percentage.
    pub realized: f64,
}

impl std::fmt::Display for ToleranceViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} color {}: {:.1}% (target {:.1}%)",
            self.region, self.palette_index, self.realized, self.target
        )
    }
}

/// Whether quantization landed every palette entry inside its band.
///
/// This is a report, not an error: the quantized image is always usable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BalanceOutcome {
    /// Every non-empty region meets every target within tolerance.
    Balanced,
    /// At least one target was missed.
    BestEffortUnmet {
        /// Every missed (region, palette entry) pair.
        violations: Vec<ToleranceViolation>,
    },
}

impl BalanceOutcome {
    /// `true` for [`BalanceOutcome::Balanced`].
    #[must_use]
    pub const fn is_balanced(&self) -> bool {
        matches!(self, Self::Balanced)
    }

    /// Missed targets; empty when balanced.
    #[must_use]
    pub fn violations(&self) -> &[ToleranceViolation] {
        match self {
            Self::Balanced => &[],
            Self::BestEffortUnmet { violations } => violations,
        }
    }
}

/// Output of [`quantize`].
#[derive(Debug, Clone)]
pub struct Quantization {
    /// Palette index per pixel, row-major.
    pub assignments: Vec<usize>,
    /// Palette-exact rendering of `assignments`.
    pub image: RgbaImage,
    /// Usage after nearest-color assignment, before rebalancing.
    pub initial_usage: [RegionUsage; 2],
    /// Usage after rebalancing.
    pub usage: [RegionUsage; 2],
    /// Balance check of `usage`.
    pub outcome: BalanceOutcome,
}

impl Quantization {
    /// Total pixels moved by rebalancing across both regions.
    #[must_use]
    pub fn reassigned(&self) -> usize {
        self.usage.iter().map(|u| u.reassigned).sum()
    }

    /// Recount usage for a later assignment vector (e.g. after
    /// dithering), keeping this quantization's rebalancing counts.
    #[must_use]
    pub fn usage_after(&self, assignments: &[usize], mask: &SegmentationMask) -> [RegionUsage; 2] {
        let mut usage = region_usage(assignments, mask, self.usage[0].counts.len());
        for (u, before) in usage.iter_mut().zip(&self.usage) {
            u.reassigned = before.reassigned;
        }
        usage
    }
}

/// Quantize `image` to `palette`, pushing per-region usage toward
/// `targets` within `tolerance` percentage points.
///
/// # Panics
///
/// Panics if `targets` does not have one entry per palette color or if
/// `mask` and `image` dimensions differ. The pipeline validates both
/// before this runs.
#[must_use = "returns the quantization"]
pub fn quantize(
    image: &RgbaImage,
    palette: &Palette,
    targets: &[f64],
    mask: &SegmentationMask,
    tolerance: f64,
) -> Quantization {
    assert_eq!(palette.len(), targets.len(), "one target per palette color");
    assert_eq!(
        image.dimensions(),
        mask.as_gray().dimensions(),
        "mask and image dimensions differ",
    );

    let lab: Vec<Lab> = image
        .pixels()
        .map(|p| to_perceptual(Rgb::new(p.0[0], p.0[1], p.0[2])))
        .collect();
    let mut assignments: Vec<usize> = lab.iter().map(|&c| palette.nearest(c)).collect();
    let initial_usage = region_usage(&assignments, mask, palette.len());

    let width = image.width() as usize;
    let reassigned = Region::ALL.map(|region| {
        let pixels: Vec<usize> = (0..assignments.len())
            .filter(|&i| mask.region_at(i) == region)
            .collect();
        let moved = rebalance_region(
            &pixels,
            &lab,
            width,
            &mut assignments,
            palette,
            targets,
            tolerance,
        );
        tracing::debug!(%region, pixels = pixels.len(), moved, "region rebalanced");
        moved
    });

    let mut usage = region_usage(&assignments, mask, palette.len());
    for (u, moved) in usage.iter_mut().zip(reassigned) {
        u.reassigned = moved;
    }
    let outcome = evaluate_balance(&usage, targets, tolerance);
    if let BalanceOutcome::BestEffortUnmet { violations } = &outcome {
        tracing::debug!(violations = violations.len(), "targets met on a best-effort basis");
    }

    Quantization {
        image: render(&assignments, palette, image),
        assignments,
        initial_usage,
        usage,
        outcome,
    }
}

/// Count palette usage per region for an arbitrary assignment vector.
///
/// `reassigned` is left at 0.
#[must_use]
pub fn region_usage(
    assignments: &[usize],
    mask: &SegmentationMask,
    palette_len: usize,
) -> [RegionUsage; 2] {
    let mut usage = Region::ALL.map(|region| RegionUsage::empty(region, palette_len));
    for (i, &color) in assignments.iter().enumerate() {
        let u = &mut usage[mask.region_at(i).index()];
        u.pixel_count += 1;
        u.counts[color] += 1;
    }
    usage
}

/// Compare realized usage against `targets ± tolerance`.
///
/// Empty regions trivially satisfy every target.
#[must_use]
pub fn evaluate_balance(usage: &[RegionUsage; 2], targets: &[f64], tolerance: f64) -> BalanceOutcome {
    let violations: Vec<ToleranceViolation> = usage
        .iter()
        .filter(|u| u.pixel_count > 0)
        .flat_map(|u| {
            targets.iter().enumerate().filter_map(move |(i, &target)| {
                let realized = u.percentage(i);
                let outside = realized > target + tolerance + BAND_EPSILON
                    || realized < target - tolerance - BAND_EPSILON;
                outside.then_some(ToleranceViolation {
                    region: u.region,
                    palette_index: i,
                    target,
                    realized,
                })
            })
        })
        .collect();

    if violations.is_empty() {
        BalanceOutcome::Balanced
    } else {
        BalanceOutcome::BestEffortUnmet { violations }
    }
}

/// Build the palette-exact image for `assignments`, taking alpha from
/// `alpha_source`.
#[must_use]
pub fn render(assignments: &[usize], palette: &Palette, alpha_source: &RgbaImage) -> RgbaImage {
    let mut out = alpha_source.clone();
    for (px, &color) in out.pixels_mut().zip(assignments) {
        let rgb = palette.color(color);
        px.0 = [rgb.r, rgb.g, rgb.b, px.0[3]];
    }
    out
}

/// Pixel count that corresponds to `target` percent of `total`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
fn target_count(target: f64, total: usize) -> usize {
    (target * total as f64 / 100.0).round().max(0.0) as usize
}

/// One rebalancing pass over a single region. Returns the number of
/// pixels whose color changed.
#[allow(clippy::cast_precision_loss)]
fn rebalance_region(
    pixels: &[usize],
    lab: &[Lab],
    width: usize,
    assignments: &mut [usize],
    palette: &Palette,
    targets: &[f64],
    tolerance: f64,
) -> usize {
    let total = pixels.len();
    if total == 0 {
        return 0;
    }

    let mut counts = vec![0_usize; palette.len()];
    for &p in pixels {
        counts[assignments[p]] += 1;
    }
    let realized = |count: usize| 100.0 * count as f64 / total as f64;

    // (palette index, distance outside the target) pairs, largest first,
    // ties to the lower index.
    let mut surplus: Vec<(usize, f64)> = Vec::new();
    let mut deficit: Vec<(usize, f64)> = Vec::new();
    for (i, (&count, &target)) in counts.iter().zip(targets).enumerate() {
        let pct = realized(count);
        if pct > target + tolerance + BAND_EPSILON {
            surplus.push((i, pct - target));
        } else if pct < target - tolerance - BAND_EPSILON {
            deficit.push((i, target - pct));
        }
    }
    let by_magnitude = |a: &(usize, f64), b: &(usize, f64)| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0));
    surplus.sort_by(by_magnitude);
    deficit.sort_by(by_magnitude);
    if surplus.is_empty() || deficit.is_empty() {
        return 0;
    }

    let (cx, cy) = spatial_centroid(pixels, width);
    let centroid_distance = |p: usize| {
        let dx = (p % width) as f64 - cx;
        let dy = (p / width) as f64 - cy;
        dx.mul_add(dx, dy * dy)
    };

    let mut moved = 0;
    for &(from, _) in &surplus {
        for &(to, _) in &deficit {
            let excess = counts[from].saturating_sub(target_count(targets[from], total));
            if excess == 0 {
                break;
            }
            let need = target_count(targets[to], total).saturating_sub(counts[to]);
            if need == 0 {
                continue;
            }

            let from_lab = palette.lab(from);
            let to_lab = palette.lab(to);
            let mut candidates: Vec<(usize, f32, f64)> = pixels
                .iter()
                .filter(|&&p| assignments[p] == from)
                .map(|&p| {
                    let cost = lab[p].distance(to_lab) - lab[p].distance(from_lab);
                    (p, cost, centroid_distance(p))
                })
                .collect();
            candidates.sort_by(|a, b| {
                a.1.total_cmp(&b.1)
                    .then_with(|| a.2.total_cmp(&b.2))
                    .then(a.0.cmp(&b.0))
            });

            let n = need.min(excess).min(candidates.len());
            for &(p, _, _) in &candidates[..n] {
                assignments[p] = to;
            }
            counts[from] -= n;
            counts[to] += n;
            moved += n;
        }
    }
    moved
}

#[allow(clippy::cast_precision_loss)]
fn spatial_centroid(pixels: &[usize], width: usize) -> (f64, f64) {
    let (sx, sy) = pixels.iter().fold((0.0, 0.0), |(sx, sy), &p| {
        (sx + (p % width) as f64, sy + (p / width) as f64)
    });
    let n = pixels.len() as f64;
    (sx / n, sy / n)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn skin_palette() -> Palette {
        Palette::new(&[
            Rgb::new(0xED, 0xE0, 0xD4),
            Rgb::new(0xDF, 0xC4, 0xB0),
            Rgb::new(0xA9, 0x82, 0x6D),
            Rgb::new(0x78, 0x5A, 0x4B),
            Rgb::new(0xFF, 0xE5, 0xCC),
        ])
        .unwrap()
    }

    const SKIN_TARGETS: [f64; 5] = [30.0, 20.0, 20.0, 15.0, 15.0];

    fn solid(width: u32, height: u32, rgb: Rgb) -> RgbaImage {
        RgbaImage::from_pixel(width, height, image::Rgba([rgb.r, rgb.g, rgb.b, 255]))
    }

    #[test]
    #[should_panic(expected = "mask and image dimensions differ")]
    fn larger_mask_is_rejected() {
        let img = solid(2, 2, Rgb::new(10, 10, 10));
        let mask = SegmentationMask::uniform(10, 10, Region::Foreground);
        let _ = quantize(&img, &skin_palette(), &SKIN_TARGETS, &mask, 15.0);
    }

    #[test]
    fn output_is_palette_exact() {
        let palette = skin_palette();
        let img = RgbaImage::from_fn(30, 20, |x, y| {
            image::Rgba([(x * 8) as u8, (y * 12) as u8, ((x + y) * 4) as u8, 200])
        });
        let mask = SegmentationMask::uniform(30, 20, Region::Foreground);
        let q = quantize(&img, &palette, &SKIN_TARGETS, &mask, 15.0);
        for (px, &a) in q.image.pixels().zip(&q.assignments) {
            let rgb = Rgb::new(px.0[0], px.0[1], px.0[2]);
            assert!(palette.contains(rgb));
            assert_eq!(rgb, palette.color(a));
            assert_eq!(px.0[3], 200);
        }
    }

    #[test]
    fn single_color_image_is_rebalanced_best_effort() {
        // 100 pixels that are all nearest to entry 0.
        let palette = skin_palette();
        let img = solid(10, 10, palette.color(0));
        let mask = SegmentationMask::uniform(10, 10, Region::Foreground);
        let q = quantize(&img, &palette, &SKIN_TARGETS, &mask, 15.0);

        assert_eq!(q.initial_usage[0].counts, vec![100, 0, 0, 0, 0]);
        // Entries 1 and 2 are below their bands and receive pixels;
        // entries 3 and 4 sit exactly on the lower edge (0 = 15 - 15).
        assert_eq!(q.usage[0].counts, vec![60, 20, 20, 0, 0]);
        assert_eq!(q.usage[0].reassigned, 40);

        let within = (0..5)
            .filter(|&i| (q.usage[0].percentage(i) - SKIN_TARGETS[i]).abs() <= 15.0)
            .count();
        assert!(within >= 3);
        assert_eq!(
            q.outcome.violations(),
            &[ToleranceViolation {
                region: Region::Foreground,
                palette_index: 0,
                target: 30.0,
                realized: 60.0,
            }]
        );
    }

    #[test]
    fn gradient_meets_most_targets() {
        let palette = skin_palette();
        let img = RgbaImage::from_fn(50, 40, |x, _| {
            let t = x as f32 / 49.0;
            let lerp = |a: u8, b: u8| (f32::from(a) + (f32::from(b) - f32::from(a)) * t) as u8;
            image::Rgba([lerp(0x60, 0xFF), lerp(0x45, 0xEA), lerp(0x38, 0xDA), 255])
        });
        let mask = SegmentationMask::uniform(50, 40, Region::Foreground);
        let q = quantize(&img, &palette, &SKIN_TARGETS, &mask, 15.0);
        let within = (0..5)
            .filter(|&i| (q.usage[0].percentage(i) - SKIN_TARGETS[i]).abs() <= 15.0 + 1e-9)
            .count();
        assert!(within >= 3, "only {within} of 5 within tolerance");
    }

    #[test]
    fn single_pixel_single_color() {
        let palette = Palette::new(&[Rgb::new(10, 200, 30)]).unwrap();
        let img = solid(1, 1, Rgb::new(240, 0, 250));
        let mask = SegmentationMask::uniform(1, 1, Region::Foreground);
        let q = quantize(&img, &palette, &[100.0], &mask, 15.0);
        assert_eq!(q.assignments, vec![0]);
        assert_eq!(q.image.get_pixel(0, 0).0, [10, 200, 30, 255]);
        assert!(q.outcome.is_balanced());
    }

    #[test]
    fn empty_region_is_skipped() {
        let palette = skin_palette();
        let img = solid(6, 6, palette.color(3));
        let mask = SegmentationMask::uniform(6, 6, Region::Background);
        let q = quantize(&img, &palette, &SKIN_TARGETS, &mask, 15.0);
        assert_eq!(q.usage[Region::Foreground.index()].pixel_count, 0);
        assert_eq!(q.usage[Region::Background.index()].pixel_count, 36);
        assert!(
            q.outcome
                .violations()
                .iter()
                .all(|v| v.region == Region::Background)
        );
    }

    #[test]
    fn regions_are_balanced_independently() {
        let palette = Palette::new(&[Rgb::new(0, 0, 0), Rgb::new(255, 255, 255)]).unwrap();
        // Left half black, right half white; left half is foreground.
        let img = RgbaImage::from_fn(10, 10, |x, _| {
            let v = if x < 5 { 0 } else { 255 };
            image::Rgba([v, v, v, 255])
        });
        let mask = SegmentationMask::from_gray(image::GrayImage::from_fn(10, 10, |x, _| {
            image::Luma([if x < 5 { 255 } else { 0 }])
        }));
        let q = quantize(&img, &palette, &[50.0, 50.0], &mask, 10.0);
        assert_eq!(q.usage[0].counts, vec![25, 25]);
        assert_eq!(q.usage[1].counts, vec![25, 25]);
        assert!(q.outcome.is_balanced());
    }

    #[test]
    fn ties_move_pixels_nearest_the_region_centroid() {
        let palette = Palette::new(&[Rgb::new(100, 100, 100), Rgb::new(250, 20, 20)]).unwrap();
        let img = solid(5, 1, Rgb::new(100, 100, 100));
        let mask = SegmentationMask::uniform(5, 1, Region::Foreground);
        let q = quantize(&img, &palette, &[60.0, 40.0], &mask, 0.0);
        assert_eq!(q.assignments, vec![0, 1, 1, 0, 0]);
    }

    #[test]
    fn cheapest_pixels_move_first() {
        // Two grays: darker pixels are cheaper to move to black.
        let palette = Palette::new(&[Rgb::new(255, 255, 255), Rgb::new(0, 0, 0)]).unwrap();
        let img = RgbaImage::from_fn(4, 1, |x, _| {
            let v = [250, 160, 200, 240][x as usize];
            image::Rgba([v, v, v, 255])
        });
        let mask = SegmentationMask::uniform(4, 1, Region::Foreground);
        let q = quantize(&img, &palette, &[75.0, 25.0], &mask, 0.0);
        assert_eq!(q.assignments, vec![0, 1, 0, 0]);
    }

    #[test]
    fn within_band_is_untouched() {
        let palette = Palette::new(&[Rgb::new(0, 0, 0), Rgb::new(255, 255, 255)]).unwrap();
        let img = RgbaImage::from_fn(10, 1, |x, _| {
            let v = if x < 4 { 0 } else { 255 };
            image::Rgba([v, v, v, 255])
        });
        let mask = SegmentationMask::uniform(10, 1, Region::Foreground);
        let q = quantize(&img, &palette, &[50.0, 50.0], &mask, 15.0);
        assert_eq!(q.reassigned(), 0);
        assert_eq!(q.initial_usage, q.usage);
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let json = serde_json::to_string(&BalanceOutcome::Balanced).unwrap();
        assert_eq!(json, r#"{"status":"balanced"}"#);
        let unmet = BalanceOutcome::BestEffortUnmet {
            violations: vec![ToleranceViolation {
                region: Region::Background,
                palette_index: 2,
                target: 20.0,
                realized: 1.0,
            }],
        };
        let json = serde_json::to_string(&unmet).unwrap();
        assert!(json.contains(r#""status":"best_effort_unmet""#));
        let back: BalanceOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back, unmet);
    }
}

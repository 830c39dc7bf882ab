//! Edge-preserving, mask-weighted error diffusion.
//!
//! Flat areas keep the quantizer's assignment untouched so the painted
//! regions stay large and clean. Only pixels near a strong luma edge
//! (Sobel magnitude at or above [`DitherOptions::gradient_threshold`],
//! grown by [`DitherOptions::neighborhood_radius`]) are re-dithered with
//! Floyd-Steinberg diffusion in L\*a\*b\*.
//!
//! Error only travels between active pixels. Diffused error is scaled by
//! the strength of the emitting pixel's region, so the background breaks
//! up less than the subject.

use image::GrayImage;
use imageproc::distance_transform::Norm;
use serde::{Deserialize, Serialize};

use crate::color::{Lab, MAX_LIGHTNESS, Rgb, to_perceptual};
use crate::quantize::{Quantization, render};
use crate::types::{Palette, PipelineError, Region, RgbaImage, SegmentationMask};

/// Floyd-Steinberg neighbors as `(dx, dy, weight)` for a left-to-right
/// scan. `dx` is mirrored on right-to-left rows.
///
/// ```text
///        X   7
///    3   5   1
/// ```
const FLOYD_STEINBERG: [(i32, u32, f32); 4] = [(1, 0, 7.0), (-1, 1, 3.0), (0, 1, 5.0), (1, 1, 1.0)];

const FLOYD_STEINBERG_DIVISOR: f32 = 16.0;

/// Range that accumulated a\*/b\* values are clamped to.
const CHROMA_MIN: f32 = -128.0;
const CHROMA_MAX: f32 = 127.0;

/// Parameters for [`dither`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DitherOptions {
    /// Minimum Sobel gradient magnitude (on 8-bit luma) for a pixel to
    /// count as an edge.
    pub gradient_threshold: u16,

    /// Chebyshev radius by which the edge set is dilated. `0` dithers
    /// only the edge pixels themselves.
    pub neighborhood_radius: u8,

    /// Fraction of the residual diffused from foreground pixels (0–1).
    pub foreground_strength: f32,

    /// Fraction of the residual diffused from background pixels (0–1).
    pub background_strength: f32,

    /// Alternate scan direction on every row.
    pub serpentine: bool,
}

impl DitherOptions {
    /// Default edge threshold.
    pub const DEFAULT_GRADIENT_THRESHOLD: u16 = 30;
    /// Default dilation radius.
    pub const DEFAULT_NEIGHBORHOOD_RADIUS: u8 = 1;
    /// Default foreground diffusion strength.
    pub const DEFAULT_FOREGROUND_STRENGTH: f32 = 1.0;
    /// Default background diffusion strength.
    pub const DEFAULT_BACKGROUND_STRENGTH: f32 = 0.5;

    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if either strength lies
    /// outside `0.0..=1.0`.
    pub fn validate(&self) -> Result<(), PipelineError> {
        for (name, value) in [
            ("foreground_strength", self.foreground_strength),
            ("background_strength", self.background_strength),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::InvalidConfig(format!(
                    "dither.{name} must be between 0 and 1, got {value}"
                )));
            }
        }
        Ok(())
    }

    const fn strength(&self, region: Region) -> f32 {
        match region {
            Region::Foreground => self.foreground_strength,
            Region::Background => self.background_strength,
        }
    }
}

impl Default for DitherOptions {
    fn default() -> Self {
        Self {
            gradient_threshold: Self::DEFAULT_GRADIENT_THRESHOLD,
            neighborhood_radius: Self::DEFAULT_NEIGHBORHOOD_RADIUS,
            foreground_strength: Self::DEFAULT_FOREGROUND_STRENGTH,
            background_strength: Self::DEFAULT_BACKGROUND_STRENGTH,
            serpentine: true,
        }
    }
}

/// Output of [`dither`].
#[derive(Debug, Clone)]
pub struct Dithering {
    /// Final palette index per pixel, row-major.
    pub assignments: Vec<usize>,
    /// Palette-exact rendering of `assignments`.
    pub image: RgbaImage,
    /// Pixels inside the dilated edge set.
    pub active_pixels: usize,
    /// Pixels whose palette index differs from the quantizer's.
    pub changed: usize,
}

/// Re-dither the edge neighborhoods of a quantized image.
///
/// `source` is the pre-quantization image: both the gradient and the
/// diffusion input come from it. Inactive pixels keep their entry from
/// `quantization`.
#[must_use = "returns the dithered result"]
pub fn dither(
    source: &RgbaImage,
    quantization: &Quantization,
    palette: &Palette,
    mask: &SegmentationMask,
    options: &DitherOptions,
) -> Dithering {
    let (width, height) = source.dimensions();
    let active = active_pixels(source, options);
    let (w, h) = (width as usize, height as usize);

    let lab: Vec<Lab> = source
        .pixels()
        .map(|p| to_perceptual(Rgb::new(p.0[0], p.0[1], p.0[2])))
        .collect();
    let mut assignments = quantization.assignments.clone();
    let mut error = vec![[0.0_f32; 3]; w * h];

    for y in 0..h {
        let reverse = options.serpentine && y % 2 == 1;
        for step in 0..w {
            let x = if reverse { w - 1 - step } else { step };
            let idx = y * w + x;
            if !active[idx] {
                continue;
            }

            let [el, ea, eb] = error[idx];
            let value = Lab::new(
                (lab[idx].l + el).clamp(0.0, MAX_LIGHTNESS),
                (lab[idx].a + ea).clamp(CHROMA_MIN, CHROMA_MAX),
                (lab[idx].b + eb).clamp(CHROMA_MIN, CHROMA_MAX),
            );
            let chosen = palette.nearest(value);
            assignments[idx] = chosen;

            let target = palette.lab(chosen);
            let strength = options.strength(mask.region_at(idx));
            let residual = [
                (value.l - target.l) * strength,
                (value.a - target.a) * strength,
                (value.b - target.b) * strength,
            ];

            for &(dx, dy, weight) in &FLOYD_STEINBERG {
                let dx = if reverse { -dx } else { dx };
                let Some(nx) = x.checked_add_signed(dx as isize) else {
                    continue;
                };
                let ny = y + dy as usize;
                if nx >= w || ny >= h {
                    continue;
                }
                let n = ny * w + nx;
                if !active[n] {
                    continue;
                }
                let share = weight / FLOYD_STEINBERG_DIVISOR;
                for (e, r) in error[n].iter_mut().zip(residual) {
                    *e += r * share;
                }
            }
        }
    }

    let active_count = active.iter().filter(|&&a| a).count();
    let changed = assignments
        .iter()
        .zip(&quantization.assignments)
        .filter(|(a, b)| a != b)
        .count();
    tracing::debug!(active = active_count, changed, "edge dithering complete");

    Dithering {
        image: render(&assignments, palette, source),
        assignments,
        active_pixels: active_count,
        changed,
    }
}

/// Row-major flags for the pixels that take part in diffusion.
fn active_pixels(source: &RgbaImage, options: &DitherOptions) -> Vec<bool> {
    let luma = luma_image(source);
    let gradients = imageproc::gradients::sobel_gradients(&luma);
    let edges = GrayImage::from_fn(luma.width(), luma.height(), |x, y| {
        let edge = gradients.get_pixel(x, y).0[0] >= options.gradient_threshold;
        image::Luma([if edge { 255 } else { 0 }])
    });
    let grown = if options.neighborhood_radius > 0 {
        imageproc::morphology::dilate(&edges, Norm::LInf, options.neighborhood_radius)
    } else {
        edges
    };
    grown.as_raw().iter().map(|&v| v > 0).collect()
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn luma_image(source: &RgbaImage) -> GrayImage {
    GrayImage::from_fn(source.width(), source.height(), |x, y| {
        let [r, g, b, _] = source.get_pixel(x, y).0;
        image::Luma([Rgb::new(r, g, b).luma().round().clamp(0.0, 255.0) as u8])
    })
}

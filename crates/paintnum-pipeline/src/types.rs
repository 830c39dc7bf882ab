//! Shared types for the paintnum pipeline.

use serde::{Deserialize, Serialize};

use crate::color::{Lab, Rgb};
use crate::dither::DitherOptions;
use crate::quantize::{BalanceOutcome, RegionUsage};
use crate::segment::SegmentOptions;

/// Re-export `GrayImage` so downstream crates can reference the
/// segmentation mask raster without depending on `image` directly.
pub use image::GrayImage;

/// Re-export `RgbaImage`, the pixel buffer type every stage consumes
/// and produces.
pub use image::RgbaImage;

/// Mask values strictly above this threshold are foreground.
pub const MASK_THRESHOLD: u8 = 127;

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Dimensions of an RGBA image.
    #[must_use]
    pub fn of(image: &RgbaImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
        }
    }

    /// Total pixel count.
    #[must_use]
    pub const fn pixel_count(self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// One of the two classes of the segmentation mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    /// The segmented subject.
    Foreground,
    /// Everything else.
    Background,
}

impl Region {
    /// Both regions, in report order.
    pub const ALL: [Self; 2] = [Self::Foreground, Self::Background];

    /// Position of this region in [`Region::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Foreground => 0,
            Self::Background => 1,
        }
    }

    /// The 0/255 mask value that encodes this region.
    #[must_use]
    pub const fn mask_value(self) -> u8 {
        match self {
            Self::Foreground => 255,
            Self::Background => 0,
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Foreground => f.write_str("foreground"),
            Self::Background => f.write_str("background"),
        }
    }
}

/// Binary foreground/background mask, one byte per pixel.
///
/// Produced once by the segmenter and consumed read-only by every later
/// stage. Values are 0/255 encoded; anything above [`MASK_THRESHOLD`]
/// counts as foreground.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentationMask(GrayImage);

impl SegmentationMask {
    /// Wrap an existing grayscale raster.
    #[must_use]
    pub const fn from_gray(gray: GrayImage) -> Self {
        Self(gray)
    }

    /// A mask that assigns every pixel to `region`.
    #[must_use]
    pub fn uniform(width: u32, height: u32, region: Region) -> Self {
        Self(GrayImage::from_pixel(
            width,
            height,
            image::Luma([region.mask_value()]),
        ))
    }

    /// The underlying raster.
    #[must_use]
    pub const fn as_gray(&self) -> &GrayImage {
        &self.0
    }

    /// Consume the mask and return the underlying raster.
    #[must_use]
    pub fn into_gray(self) -> GrayImage {
        self.0
    }

    /// Mask dimensions.
    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.0.width(),
            height: self.0.height(),
        }
    }

    /// Region of the pixel at `(x, y)`.
    #[must_use]
    pub fn region(&self, x: u32, y: u32) -> Region {
        region_of(self.0.get_pixel(x, y).0[0])
    }

    /// Region of the pixel at row-major `index`.
    #[must_use]
    pub fn region_at(&self, index: usize) -> Region {
        region_of(self.0.as_raw()[index])
    }

    /// Whether `(x, y)` is foreground.
    #[must_use]
    pub fn is_foreground(&self, x: u32, y: u32) -> bool {
        self.region(x, y) == Region::Foreground
    }

    /// Number of foreground pixels.
    #[must_use]
    pub fn foreground_count(&self) -> usize {
        self.0.as_raw().iter().filter(|&&v| v > MASK_THRESHOLD).count()
    }

    /// Fraction of pixels labeled foreground (0.0–1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn foreground_fraction(&self) -> f64 {
        let total = self.0.as_raw().len();
        if total == 0 {
            return 0.0;
        }
        self.foreground_count() as f64 / total as f64
    }
}

const fn region_of(value: u8) -> Region {
    if value > MASK_THRESHOLD {
        Region::Foreground
    } else {
        Region::Background
    }
}

/// The fixed set of allowed output colors, with their L\*a\*b\* values
/// precomputed.
#[derive(Debug, Clone, PartialEq)]
pub struct Palette {
    colors: Vec<Rgb>,
    lab: Vec<Lab>,
}

impl Palette {
    /// Build a palette from display colors.
    ///
    /// Duplicate colors are accepted, but they make target enforcement
    /// ill-posed.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::EmptyPalette`] if `colors` is empty.
    pub fn new(colors: &[Rgb]) -> Result<Self, PipelineError> {
        if colors.is_empty() {
            return Err(PipelineError::EmptyPalette);
        }
        Ok(Self {
            colors: colors.to_vec(),
            lab: colors.iter().map(|&c| Lab::from(c)).collect(),
        })
    }

    /// Number of entries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.colors.len()
    }

    /// Always `false`; a palette is never empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    /// All display colors in palette order.
    #[must_use]
    pub fn colors(&self) -> &[Rgb] {
        &self.colors
    }

    /// Display color of entry `index`.
    #[must_use]
    pub fn color(&self, index: usize) -> Rgb {
        self.colors[index]
    }

    /// L\*a\*b\* value of entry `index`.
    #[must_use]
    pub fn lab(&self, index: usize) -> Lab {
        self.lab[index]
    }

    /// Index of the perceptually nearest entry. Ties go to the lowest
    /// index.
    #[must_use]
    pub fn nearest(&self, color: Lab) -> usize {
        let mut best = 0;
        let mut best_dist = f32::INFINITY;
        for (i, &entry) in self.lab.iter().enumerate() {
            let d = color.distance_squared(entry);
            if d < best_dist {
                best = i;
                best_dist = d;
            }
        }
        best
    }

    /// Whether `color` is bit-exactly one of the entries.
    #[must_use]
    pub fn contains(&self, color: Rgb) -> bool {
        self.colors.contains(&color)
    }
}

/// Configuration for the image processing pipeline.
///
/// All parameters have defaults matching the product's tuned values.
/// [`validate`](Self::validate) is called before any processing starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// CLAHE clip limit, as a multiple of the average histogram bin
    /// height. Must be positive.
    pub clahe_clip_limit: f32,

    /// CLAHE tiles per axis. Must be at least 1.
    pub clahe_tile_grid: u32,

    /// Foreground lightness multiplier (> 1 brightens).
    pub foreground_boost: f32,

    /// Background chroma multiplier (< 1 desaturates).
    pub background_desaturate: f32,

    /// Symmetric tolerance band around each target percentage.
    pub tolerance_percent: f64,

    /// Foreground segmentation parameters.
    pub segment: SegmentOptions,

    /// Edge-preserving dithering parameters.
    pub dither: DitherOptions,
}

impl PipelineConfig {
    /// Default CLAHE clip limit.
    pub const DEFAULT_CLAHE_CLIP_LIMIT: f32 = 2.0;
    /// Default CLAHE grid size.
    pub const DEFAULT_CLAHE_TILE_GRID: u32 = 8;
    /// Default foreground lightness boost.
    pub const DEFAULT_FOREGROUND_BOOST: f32 = 1.15;
    /// Default background desaturation factor.
    pub const DEFAULT_BACKGROUND_DESATURATE: f32 = 0.7;
    /// Default tolerance in percentage points.
    pub const DEFAULT_TOLERANCE_PERCENT: f64 = 15.0;

    /// Check every parameter against its documented range.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] naming the first
    /// offending field.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::InvalidConfig(msg));

        if !(self.clahe_clip_limit.is_finite() && self.clahe_clip_limit > 0.0) {
            return invalid(format!(
                "clahe_clip_limit must be positive, got {}",
                self.clahe_clip_limit
            ));
        }
        if self.clahe_tile_grid == 0 {
            return invalid("clahe_tile_grid must be at least 1".to_string());
        }
        if !(self.foreground_boost.is_finite() && self.foreground_boost > 0.0) {
            return invalid(format!(
                "foreground_boost must be positive, got {}",
                self.foreground_boost
            ));
        }
        if !(self.background_desaturate.is_finite() && self.background_desaturate > 0.0) {
            return invalid(format!(
                "background_desaturate must be positive, got {}",
                self.background_desaturate
            ));
        }
        if !(self.tolerance_percent.is_finite() && self.tolerance_percent >= 0.0) {
            return invalid(format!(
                "tolerance_percent must be non-negative, got {}",
                self.tolerance_percent
            ));
        }
        self.segment.validate()?;
        self.dither.validate()
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            clahe_clip_limit: Self::DEFAULT_CLAHE_CLIP_LIMIT,
            clahe_tile_grid: Self::DEFAULT_CLAHE_TILE_GRID,
            foreground_boost: Self::DEFAULT_FOREGROUND_BOOST,
            background_desaturate: Self::DEFAULT_BACKGROUND_DESATURATE,
            tolerance_percent: Self::DEFAULT_TOLERANCE_PERCENT,
            segment: SegmentOptions::default(),
            dither: DitherOptions::default(),
        }
    }
}

/// Validate the caller-supplied image, palette and targets.
///
/// # Errors
///
/// Returns [`PipelineError::EmptyImage`], [`PipelineError::EmptyPalette`],
/// [`PipelineError::TargetLengthMismatch`] or
/// [`PipelineError::InvalidTarget`].
pub fn validate_inputs(
    image: &RgbaImage,
    palette: &[Rgb],
    targets: &[f64],
) -> Result<(), PipelineError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(PipelineError::EmptyImage);
    }
    if palette.is_empty() {
        return Err(PipelineError::EmptyPalette);
    }
    if palette.len() != targets.len() {
        return Err(PipelineError::TargetLengthMismatch {
            palette: palette.len(),
            targets: targets.len(),
        });
    }
    if let Some((index, &value)) = targets
        .iter()
        .enumerate()
        .find(|(_, t)| !(t.is_finite() && **t >= 0.0))
    {
        return Err(PipelineError::InvalidTarget { index, value });
    }
    Ok(())
}

/// Result of running the full pipeline.
///
/// `image` is palette-exact: every pixel's RGB triple equals one palette
/// entry. `assignments` holds the palette index of each pixel in
/// row-major order, for region numbering and legends.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    /// The palette-exact output buffer (alpha carried from the input).
    pub image: RgbaImage,
    /// Palette index per pixel, row-major.
    pub assignments: Vec<usize>,
    /// Dimensions of the output (always equal to the input's).
    pub dimensions: Dimensions,
    /// Realized palette usage per region, indexed by [`Region::index`].
    pub usage: [RegionUsage; 2],
    /// Whether every realized percentage landed inside the tolerance band.
    pub outcome: BalanceOutcome,
}

/// Result of running the pipeline with every intermediate preserved.
///
/// Each field captures the output of one stage so callers can display
/// or inspect the whole processing chain.
#[derive(Debug, Clone)]
pub struct StagedResult {
    /// Stage 0: the caller's input buffer.
    pub original: RgbaImage,
    /// Stage 1: foreground/background mask.
    pub mask: SegmentationMask,
    /// Stage 2: local contrast enhanced image.
    pub enhanced: RgbaImage,
    /// Stage 3: tone-mapped image (the quantizer's input).
    pub toned: RgbaImage,
    /// Stage 4: palette-constrained quantization, before dithering.
    pub quantized: RgbaImage,
    /// Stage 5: final dithered, palette-exact output.
    pub dithered: RgbaImage,
    /// Final palette index per pixel, row-major.
    pub assignments: Vec<usize>,
    /// Final realized usage per region.
    pub usage: [RegionUsage; 2],
    /// Final balance outcome.
    pub outcome: BalanceOutcome,
    /// Image dimensions in pixels.
    pub dimensions: Dimensions,
}

impl StagedResult {
    /// The final palette-exact output.
    #[must_use]
    pub const fn final_image(&self) -> &RgbaImage {
        &self.dithered
    }

    /// Drop the intermediates and keep only the final output.
    #[must_use]
    pub fn into_process_result(self) -> ProcessResult {
        ProcessResult {
            image: self.dithered,
            assignments: self.assignments,
            dimensions: self.dimensions,
            usage: self.usage,
            outcome: self.outcome,
        }
    }
}

/// Errors that can occur before pipeline processing starts.
///
/// Every variant is an input-validation failure; no stage fails once
/// processing has begun.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum PipelineError {
    /// The input image has zero width or height.
    #[error("input image is empty")]
    EmptyImage,

    /// The palette has no entries.
    #[error("palette is empty")]
    EmptyPalette,

    /// Palette and target arrays differ in length.
    #[error("palette has {palette} colors but {targets} target percentages were given")]
    TargetLengthMismatch {
        /// Palette length.
        palette: usize,
        /// Target array length.
        targets: usize,
    },

    /// A target percentage is negative or not finite.
    #[error("target percentage {index} is invalid: {value}")]
    InvalidTarget {
        /// Palette index of the offending target.
        index: usize,
        /// The rejected value.
        value: f64,
    },

    /// Pipeline configuration is invalid.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn rgba(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_pixel(width, height, image::Rgba([10, 20, 30, 255]))
    }

    // --- Region / mask tests ---

    #[test]
    fn region_indices_follow_all_order() {
        for (i, region) in Region::ALL.iter().enumerate() {
            assert_eq!(region.index(), i);
        }
    }

    #[test]
    fn mask_threshold_splits_at_127() {
        let mut gray = GrayImage::new(3, 1);
        gray.put_pixel(0, 0, image::Luma([127]));
        gray.put_pixel(1, 0, image::Luma([128]));
        gray.put_pixel(2, 0, image::Luma([255]));
        let mask = SegmentationMask::from_gray(gray);
        assert_eq!(mask.region(0, 0), Region::Background);
        assert_eq!(mask.region(1, 0), Region::Foreground);
        assert_eq!(mask.region_at(2), Region::Foreground);
        assert_eq!(mask.foreground_count(), 2);
    }

    #[test]
    fn uniform_mask_fraction() {
        let fg = SegmentationMask::uniform(4, 5, Region::Foreground);
        assert!((fg.foreground_fraction() - 1.0).abs() < f64::EPSILON);
        let bg = SegmentationMask::uniform(4, 5, Region::Background);
        assert!(bg.foreground_fraction().abs() < f64::EPSILON);
        assert_eq!(
            bg.dimensions(),
            Dimensions {
                width: 4,
                height: 5
            }
        );
    }

    // --- Palette tests ---

    #[test]
    fn empty_palette_is_rejected() {
        assert_eq!(Palette::new(&[]), Err(PipelineError::EmptyPalette));
    }

    #[test]
    fn nearest_prefers_lowest_index_on_tie() {
        let c = Rgb::new(50, 60, 70);
        let palette = Palette::new(&[c, c]).unwrap();
        assert_eq!(palette.nearest(Lab::from(c)), 0);
    }

    #[test]
    fn nearest_finds_closest_entry() {
        let palette = Palette::new(&[Rgb::new(0, 0, 0), Rgb::new(255, 255, 255)]).unwrap();
        assert_eq!(palette.nearest(Lab::from(Rgb::new(30, 30, 30))), 0);
        assert_eq!(palette.nearest(Lab::from(Rgb::new(220, 220, 220))), 1);
        assert!(palette.contains(Rgb::new(255, 255, 255)));
        assert!(!palette.contains(Rgb::new(254, 255, 255)));
    }

    // --- Input validation tests ---

    #[test]
    fn validate_rejects_empty_image() {
        let result = validate_inputs(&RgbaImage::new(0, 4), &[Rgb::new(0, 0, 0)], &[100.0]);
        assert_eq!(result, Err(PipelineError::EmptyImage));
    }

    #[test]
    fn validate_rejects_length_mismatch() {
        let result = validate_inputs(&rgba(2, 2), &[Rgb::new(0, 0, 0)], &[50.0, 50.0]);
        assert_eq!(
            result,
            Err(PipelineError::TargetLengthMismatch {
                palette: 1,
                targets: 2
            })
        );
    }

    #[test]
    fn validate_rejects_negative_target() {
        let palette = [Rgb::new(0, 0, 0), Rgb::new(9, 9, 9)];
        let result = validate_inputs(&rgba(2, 2), &palette, &[110.0, -10.0]);
        assert!(matches!(
            result,
            Err(PipelineError::InvalidTarget { index: 1, .. })
        ));
    }

    #[test]
    fn validate_accepts_targets_not_summing_to_100() {
        let palette = [Rgb::new(0, 0, 0), Rgb::new(9, 9, 9)];
        assert!(validate_inputs(&rgba(2, 2), &palette, &[10.0, 10.0]).is_ok());
    }

    // --- PipelineConfig tests ---

    #[test]
    fn pipeline_config_defaults() {
        let config = PipelineConfig::default();
        assert!((config.clahe_clip_limit - 2.0).abs() < f32::EPSILON);
        assert_eq!(config.clahe_tile_grid, 8);
        assert!((config.foreground_boost - 1.15).abs() < f32::EPSILON);
        assert!((config.background_desaturate - 0.7).abs() < f32::EPSILON);
        assert!((config.tolerance_percent - 15.0).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn pipeline_config_rejects_zero_tile_grid() {
        let config = PipelineConfig {
            clahe_tile_grid: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(ref s)) if s.contains("clahe_tile_grid")
        ));
    }

    #[test]
    fn pipeline_config_rejects_non_positive_clip_limit() {
        for clip in [0.0, -1.0, f32::NAN] {
            let config = PipelineConfig {
                clahe_clip_limit: clip,
                ..PipelineConfig::default()
            };
            assert!(config.validate().is_err(), "clip {clip} accepted");
        }
    }

    #[test]
    fn pipeline_config_rejects_negative_tolerance() {
        let config = PipelineConfig {
            tolerance_percent: -0.5,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn pipeline_config_serde_round_trip() {
        let config = PipelineConfig {
            clahe_clip_limit: 3.5,
            clahe_tile_grid: 4,
            foreground_boost: 1.3,
            background_desaturate: 0.5,
            tolerance_percent: 10.0,
            ..PipelineConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn pipeline_config_partial_json_uses_defaults() {
        let config: PipelineConfig = serde_json::from_str(r#"{"tolerance_percent": 5.0}"#).unwrap();
        assert!((config.tolerance_percent - 5.0).abs() < f64::EPSILON);
        assert_eq!(config.clahe_tile_grid, PipelineConfig::DEFAULT_CLAHE_TILE_GRID);
    }

    // --- PipelineError tests ---

    #[test]
    fn error_display_messages() {
        assert_eq!(PipelineError::EmptyImage.to_string(), "input image is empty");
        assert_eq!(
            PipelineError::TargetLengthMismatch {
                palette: 5,
                targets: 4
            }
            .to_string(),
            "palette has 5 colors but 4 target percentages were given",
        );
        assert_eq!(
            PipelineError::InvalidConfig("bad".to_string()).to_string(),
            "invalid pipeline configuration: bad",
        );
    }

    #[test]
    fn pipeline_error_serde_round_trip() {
        let err = PipelineError::InvalidTarget {
            index: 3,
            value: -2.0,
        };
        let json = serde_json::to_string(&err).unwrap();
        let deserialized: PipelineError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, deserialized);
    }
}

//! Incremental pipeline: advance stage-by-stage, inspecting each
//! intermediate result before continuing.
//!
//! Unlike [`crate::process`] which runs the entire pipeline in one call,
//! [`Pipeline`] lets the caller drive execution one step at a time:
//!
//! ```rust
//! # use paintnum_pipeline::{Pipeline, PipelineConfig, PipelineError, Rgb, RgbaImage};
//! # fn run(image: RgbaImage) -> Result<(), PipelineError> {
//! let palette = [Rgb::new(0, 0, 0), Rgb::new(255, 255, 255)];
//! let pipeline = Pipeline::new(image, &palette, &[50.0, 50.0], PipelineConfig::default())?
//!     .segment()
//!     .enhance()
//!     .tone_map()
//!     .quantize()
//!     .dither();
//!
//! let staged = pipeline.into_result();
//! # Ok(())
//! # }
//! ```
//!
//! All validation happens in [`Pipeline::new`]. Once a [`Pending`] stage
//! exists every transition is infallible. Each stage method consumes
//! `self` and returns the next state, carrying all previously computed
//! intermediates.
//!
//! # Memory
//!
//! Every stage retains the full raster stack computed so far. For a
//! 1000×1000 source this is roughly 20 MB by [`Dithered`], pinned until
//! [`Dithered::into_result`] consumes it. Callers that only need the
//! final region map should prefer [`crate::process`].

use crate::color::Rgb;
use crate::diagnostics::StageMetrics;
use crate::dither::Dithering;
use crate::quantize::{BalanceOutcome, Quantization, RegionUsage, evaluate_balance};
use crate::segment::Segmentation;
use crate::types::{
    Dimensions, Palette, PipelineConfig, PipelineError, RgbaImage, SegmentationMask, StagedResult,
    validate_inputs,
};

/// Inputs every stage carries forward unchanged.
struct Context {
    config: PipelineConfig,
    palette: Palette,
    targets: Vec<f64>,
    original: RgbaImage,
}

impl Context {
    fn dimensions(&self) -> Dimensions {
        Dimensions::of(&self.original)
    }
}

// ───────────────────────── Stage 0: Pending ──────────────────────────

/// Pipeline state after validation, before any processing.
///
/// Call [`segment`](Self::segment) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing; call .segment() to continue"]
pub struct Pending {
    ctx: Context,
}

impl Pending {
    /// The caller's input image.
    #[must_use]
    pub const fn original(&self) -> &RgbaImage {
        &self.ctx.original
    }

    /// The validated palette.
    #[must_use]
    pub const fn palette(&self) -> &Palette {
        &self.ctx.palette
    }

    /// Split the image into foreground and background.
    pub fn segment(self) -> Segmented {
        let segmentation = crate::segment::segment(&self.ctx.original, &self.ctx.config.segment);
        Segmented {
            ctx: self.ctx,
            segmentation,
        }
    }
}

// ───────────────────────── Stage 1: Segmented ────────────────────────

/// Pipeline state after foreground segmentation.
///
/// Call [`enhance`](Self::enhance) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing; call .enhance() to continue"]
pub struct Segmented {
    ctx: Context,
    segmentation: Segmentation,
}

impl Segmented {
    /// The foreground/background mask.
    #[must_use]
    pub const fn mask(&self) -> &SegmentationMask {
        &self.segmentation.mask
    }

    /// Full segmentation details (iterations, cluster sizes, fallback).
    #[must_use]
    pub const fn segmentation(&self) -> &Segmentation {
        &self.segmentation
    }

    /// Apply local contrast enhancement.
    pub fn enhance(self) -> Enhanced {
        let enhanced = crate::clahe::enhance(
            &self.ctx.original,
            self.ctx.config.clahe_clip_limit,
            self.ctx.config.clahe_tile_grid,
        );
        Enhanced {
            ctx: self.ctx,
            segmentation: self.segmentation,
            enhanced,
        }
    }

    pub(crate) fn stage_metrics(&self) -> StageMetrics {
        StageMetrics::Segment {
            iterations: self.segmentation.iterations,
            converged: self.segmentation.converged,
            fallback: self.segmentation.fallback,
            cluster_sizes: self.segmentation.cluster_sizes.clone(),
            foreground_fraction: self.segmentation.mask.foreground_fraction(),
        }
    }
}

// ───────────────────────── Stage 2: Enhanced ─────────────────────────

/// Pipeline state after CLAHE.
///
/// Call [`tone_map`](Self::tone_map) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing; call .tone_map() to continue"]
pub struct Enhanced {
    ctx: Context,
    segmentation: Segmentation,
    enhanced: RgbaImage,
}

impl Enhanced {
    /// The contrast-enhanced image.
    #[must_use]
    pub const fn enhanced(&self) -> &RgbaImage {
        &self.enhanced
    }

    /// Apply the per-region tone curves.
    pub fn tone_map(self) -> ToneMapped {
        let toned = crate::tone::apply_tone_curves(
            &self.enhanced,
            &self.segmentation.mask,
            self.ctx.config.foreground_boost,
            self.ctx.config.background_desaturate,
        );
        ToneMapped {
            ctx: self.ctx,
            segmentation: self.segmentation,
            enhanced: self.enhanced,
            toned,
        }
    }

    pub(crate) fn stage_metrics(&self) -> StageMetrics {
        let dims = self.ctx.dimensions();
        let grid = self.ctx.config.clahe_tile_grid.max(1);
        StageMetrics::Enhance {
            clip_limit: self.ctx.config.clahe_clip_limit,
            tiles_x: grid.min(dims.width),
            tiles_y: grid.min(dims.height),
        }
    }
}

// ───────────────────────── Stage 3: ToneMapped ───────────────────────

/// Pipeline state after segment-aware tone mapping.
///
/// Call [`quantize`](Self::quantize) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing; call .quantize() to continue"]
pub struct ToneMapped {
    ctx: Context,
    segmentation: Segmentation,
    enhanced: RgbaImage,
    toned: RgbaImage,
}

impl ToneMapped {
    /// The tone-mapped image.
    #[must_use]
    pub const fn toned(&self) -> &RgbaImage {
        &self.toned
    }

    /// Map to the palette and rebalance toward the targets.
    pub fn quantize(self) -> Quantized {
        let quantization = crate::quantize::quantize(
            &self.toned,
            &self.ctx.palette,
            &self.ctx.targets,
            &self.segmentation.mask,
            self.ctx.config.tolerance_percent,
        );
        Quantized {
            ctx: self.ctx,
            segmentation: self.segmentation,
            enhanced: self.enhanced,
            toned: self.toned,
            quantization,
        }
    }

    pub(crate) fn stage_metrics(&self) -> StageMetrics {
        StageMetrics::ToneMap {
            foreground_boost: self.ctx.config.foreground_boost,
            background_desaturate: self.ctx.config.background_desaturate,
        }
    }
}

// ───────────────────────── Stage 4: Quantized ────────────────────────

/// Pipeline state after palette-constrained quantization.
///
/// Call [`dither`](Self::dither) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing; call .dither() to continue"]
pub struct Quantized {
    ctx: Context,
    segmentation: Segmentation,
    enhanced: RgbaImage,
    toned: RgbaImage,
    quantization: Quantization,
}

impl Quantized {
    /// The palette-exact image before dithering.
    #[must_use]
    pub const fn quantized(&self) -> &RgbaImage {
        &self.quantization.image
    }

    /// Full quantization details (usage, balance outcome).
    #[must_use]
    pub const fn quantization(&self) -> &Quantization {
        &self.quantization
    }

    /// Re-dither the edge neighborhoods.
    pub fn dither(self) -> Dithered {
        let dithering = crate::dither::dither(
            &self.toned,
            &self.quantization,
            &self.ctx.palette,
            &self.segmentation.mask,
            &self.ctx.config.dither,
        );
        let usage = self
            .quantization
            .usage_after(&dithering.assignments, &self.segmentation.mask);
        let outcome = evaluate_balance(&usage, &self.ctx.targets, self.ctx.config.tolerance_percent);
        Dithered {
            ctx: self.ctx,
            segmentation: self.segmentation,
            enhanced: self.enhanced,
            toned: self.toned,
            quantization: self.quantization,
            dithering,
            usage,
            outcome,
        }
    }

    pub(crate) fn stage_metrics(&self) -> StageMetrics {
        StageMetrics::Quantize {
            palette_size: self.ctx.palette.len(),
            tolerance: self.ctx.config.tolerance_percent,
            reassigned: self.quantization.reassigned(),
            violations: self.quantization.outcome.violations().len(),
        }
    }
}

// ───────────────────────── Stage 5: Dithered ─────────────────────────

/// Pipeline state after edge-preserving dithering, the final stage.
///
/// Call [`into_result`](Self::into_result) to extract the
/// [`StagedResult`] containing all intermediates.
#[must_use = "call .into_result() to extract the StagedResult"]
pub struct Dithered {
    ctx: Context,
    segmentation: Segmentation,
    enhanced: RgbaImage,
    toned: RgbaImage,
    quantization: Quantization,
    dithering: Dithering,
    usage: [RegionUsage; 2],
    outcome: BalanceOutcome,
}

impl Dithered {
    /// The final palette-exact image.
    #[must_use]
    pub const fn dithered(&self) -> &RgbaImage {
        &self.dithering.image
    }

    /// Final palette usage per region.
    #[must_use]
    pub const fn usage(&self) -> &[RegionUsage; 2] {
        &self.usage
    }

    /// Balance check of the final usage.
    #[must_use]
    pub const fn outcome(&self) -> &BalanceOutcome {
        &self.outcome
    }

    /// Image dimensions.
    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        self.ctx.dimensions()
    }

    /// Consume the pipeline and return the full [`StagedResult`].
    #[must_use]
    pub fn into_result(self) -> StagedResult {
        let dimensions = self.ctx.dimensions();
        StagedResult {
            original: self.ctx.original,
            mask: self.segmentation.mask,
            enhanced: self.enhanced,
            toned: self.toned,
            quantized: self.quantization.image,
            dithered: self.dithering.image,
            assignments: self.dithering.assignments,
            usage: self.usage,
            outcome: self.outcome,
            dimensions,
        }
    }

    pub(crate) fn stage_metrics(&self) -> StageMetrics {
        StageMetrics::Dither {
            active_pixels: self.dithering.active_pixels,
            changed: self.dithering.changed,
            total_pixel_count: self.ctx.dimensions().pixel_count(),
        }
    }
}

// ──────────────────── PipelineStage trait + Stage enum ────────────────

/// Total number of stages in the pipeline.
pub const STAGE_COUNT: usize = 6;

/// The output produced by a single pipeline stage.
///
/// Each variant borrows the data that the corresponding stage computed.
#[must_use]
pub enum StageOutput<'a> {
    /// The caller's input image.
    Source {
        /// The original image.
        original: &'a RgbaImage,
    },
    /// Foreground/background mask.
    Segmented {
        /// The mask.
        mask: &'a SegmentationMask,
    },
    /// CLAHE result.
    Enhanced {
        /// The enhanced image.
        enhanced: &'a RgbaImage,
    },
    /// Tone mapping result.
    ToneMapped {
        /// The tone-mapped image.
        toned: &'a RgbaImage,
    },
    /// Palette-constrained quantization.
    Quantized {
        /// The palette-exact image.
        quantized: &'a RgbaImage,
        /// Palette index per pixel.
        assignments: &'a [usize],
    },
    /// Final dithered region map.
    Dithered {
        /// The palette-exact image.
        dithered: &'a RgbaImage,
        /// Palette index per pixel.
        assignments: &'a [usize],
        /// Image dimensions.
        dimensions: Dimensions,
    },
}

/// Trait implemented by every pipeline stage, enabling uniform iteration.
///
/// Both the typed API (individual stage structs) and the dynamic API
/// ([`Stage`] enum) are available. This trait bridges the two.
///
/// # Loop pattern
///
/// ```rust
/// # use paintnum_pipeline::{Pipeline, PipelineConfig, PipelineError, Rgb, RgbaImage};
/// # use paintnum_pipeline::pipeline::{Stage, Advance};
/// # fn run(image: RgbaImage, palette: &[Rgb], targets: &[f64]) -> Result<(), PipelineError> {
/// let mut stage: Stage = Pipeline::new(image, palette, targets, PipelineConfig::default())?.into();
/// loop {
///     match stage.advance() {
///         Advance::Next(next) => stage = next,
///         Advance::Complete(done) => { stage = done; break; }
///     }
/// }
/// let result = stage.complete();
/// # Ok(())
/// # }
/// ```
pub trait PipelineStage: Sized {
    /// Human-readable name of this stage (e.g. `"source"`, `"dither"`).
    const NAME: &str;

    /// Zero-based index of this stage (`0` for Pending through `5` for
    /// Dithered).
    const INDEX: usize;

    /// The output this stage produced.
    fn output(&self) -> StageOutput<'_>;

    /// Stage-specific metrics for diagnostics.
    ///
    /// Returns `None` for the initial [`Pending`] stage, which has not
    /// yet performed any processing.
    fn metrics(&self) -> Option<StageMetrics>;

    /// Advance to the next stage, or `None` at the final stage.
    fn next(self) -> Option<Stage>;

    /// Run all remaining stages and return the final [`StagedResult`].
    fn complete(self) -> StagedResult;
}

impl PipelineStage for Pending {
    const NAME: &str = "source";
    const INDEX: usize = 0;

    fn output(&self) -> StageOutput<'_> {
        StageOutput::Source {
            original: &self.ctx.original,
        }
    }

    fn metrics(&self) -> Option<StageMetrics> {
        None
    }

    fn next(self) -> Option<Stage> {
        Some(Stage::Segmented(self.segment()))
    }

    fn complete(self) -> StagedResult {
        self.segment().complete()
    }
}

impl PipelineStage for Segmented {
    const NAME: &str = "segment";
    const INDEX: usize = 1;

    fn output(&self) -> StageOutput<'_> {
        StageOutput::Segmented {
            mask: &self.segmentation.mask,
        }
    }

    fn metrics(&self) -> Option<StageMetrics> {
        Some(self.stage_metrics())
    }

    fn next(self) -> Option<Stage> {
        Some(Stage::Enhanced(self.enhance()))
    }

    fn complete(self) -> StagedResult {
        self.enhance().complete()
    }
}

impl PipelineStage for Enhanced {
    const NAME: &str = "enhance";
    const INDEX: usize = 2;

    fn output(&self) -> StageOutput<'_> {
        StageOutput::Enhanced {
            enhanced: &self.enhanced,
        }
    }

    fn metrics(&self) -> Option<StageMetrics> {
        Some(self.stage_metrics())
    }

    fn next(self) -> Option<Stage> {
        Some(Stage::ToneMapped(self.tone_map()))
    }

    fn complete(self) -> StagedResult {
        self.tone_map().complete()
    }
}

impl PipelineStage for ToneMapped {
    const NAME: &str = "tone";
    const INDEX: usize = 3;

    fn output(&self) -> StageOutput<'_> {
        StageOutput::ToneMapped { toned: &self.toned }
    }

    fn metrics(&self) -> Option<StageMetrics> {
        Some(self.stage_metrics())
    }

    fn next(self) -> Option<Stage> {
        Some(Stage::Quantized(self.quantize()))
    }

    fn complete(self) -> StagedResult {
        self.quantize().complete()
    }
}

impl PipelineStage for Quantized {
    const NAME: &str = "quantize";
    const INDEX: usize = 4;

    fn output(&self) -> StageOutput<'_> {
        StageOutput::Quantized {
            quantized: &self.quantization.image,
            assignments: &self.quantization.assignments,
        }
    }

    fn metrics(&self) -> Option<StageMetrics> {
        Some(self.stage_metrics())
    }

    fn next(self) -> Option<Stage> {
        Some(Stage::Dithered(self.dither()))
    }

    fn complete(self) -> StagedResult {
        self.dither().complete()
    }
}

impl PipelineStage for Dithered {
    const NAME: &str = "dither";
    const INDEX: usize = 5;

    fn output(&self) -> StageOutput<'_> {
        StageOutput::Dithered {
            dithered: &self.dithering.image,
            assignments: &self.dithering.assignments,
            dimensions: self.ctx.dimensions(),
        }
    }

    fn metrics(&self) -> Option<StageMetrics> {
        Some(self.stage_metrics())
    }

    fn next(self) -> Option<Stage> {
        None
    }

    fn complete(self) -> StagedResult {
        self.into_result()
    }
}

/// Enum wrapping all pipeline stages for uniform, loopable access.
///
/// Use [`From`] conversions to enter the dynamic API from any typed
/// stage, then call [`advance`](Self::advance) in a loop.
#[must_use]
pub enum Stage {
    /// See [`Pending`].
    Pending(Pending),
    /// See [`Segmented`].
    Segmented(Segmented),
    /// See [`Enhanced`].
    Enhanced(Enhanced),
    /// See [`ToneMapped`].
    ToneMapped(ToneMapped),
    /// See [`Quantized`].
    Quantized(Quantized),
    /// See [`Dithered`].
    Dithered(Dithered),
}

/// Compile-time guard: adding a [`Stage`] variant makes this match
/// non-exhaustive, a reminder to bump [`STAGE_COUNT`].
#[allow(dead_code, clippy::match_same_arms)]
const fn _stage_count_guard(s: &Stage) {
    match s {
        Stage::Pending(_)
        | Stage::Segmented(_)
        | Stage::Enhanced(_)
        | Stage::ToneMapped(_)
        | Stage::Quantized(_)
        | Stage::Dithered(_) => {}
    }
}

/// Result of [`Stage::advance`]: either the next stage or the
/// completed final stage returned unchanged.
#[must_use]
pub enum Advance {
    /// The pipeline advanced to this next stage.
    Next(Stage),
    /// The pipeline was already at the final stage and is returned unchanged.
    Complete(Stage),
}

/// Delegate a method call to whichever `Stage` variant is active.
macro_rules! delegate {
    ($self:ident, $method:ident $(, $arg:expr)*) => {
        match $self {
            Self::Pending(s) => s.$method($($arg),*),
            Self::Segmented(s) => s.$method($($arg),*),
            Self::Enhanced(s) => s.$method($($arg),*),
            Self::ToneMapped(s) => s.$method($($arg),*),
            Self::Quantized(s) => s.$method($($arg),*),
            Self::Dithered(s) => s.$method($($arg),*),
        }
    };
}

impl Stage {
    /// Human-readable name of the current stage.
    #[must_use]
    pub fn name(&self) -> &'static str {
        delegate!(self, name)
    }

    /// Zero-based index of the current stage.
    #[must_use]
    pub fn index(&self) -> usize {
        delegate!(self, index)
    }

    /// The output this stage produced.
    pub fn output(&self) -> StageOutput<'_> {
        delegate!(self, output)
    }

    /// Stage-specific metrics; `None` for `Pending`.
    #[must_use]
    pub fn metrics(&self) -> Option<StageMetrics> {
        delegate!(self, metrics)
    }

    /// Whether the pipeline is at the final stage.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Dithered(_))
    }

    /// Advance to the next stage. Returns `None` if already complete
    /// (the final stage is consumed).
    #[must_use]
    pub fn next(self) -> Option<Self> {
        delegate!(self, next)
    }

    /// Advance to the next stage, returning `self` unchanged if already
    /// complete.
    ///
    /// This is the loop-friendly version of [`next`](Self::next).
    pub fn advance(self) -> Advance {
        match self {
            Self::Pending(s) => Advance::Next(s.segment().into()),
            Self::Segmented(s) => Advance::Next(s.enhance().into()),
            Self::Enhanced(s) => Advance::Next(s.tone_map().into()),
            Self::ToneMapped(s) => Advance::Next(s.quantize().into()),
            Self::Quantized(s) => Advance::Next(s.dither().into()),
            done @ Self::Dithered(_) => Advance::Complete(done),
        }
    }

    /// Run all remaining stages to completion.
    #[must_use]
    pub fn complete(self) -> StagedResult {
        delegate!(self, complete)
    }
}

// `PipelineStage`'s associated constants aren't reachable via `self`, so
// the delegate macro goes through this helper.
trait StageMetadata {
    fn name(&self) -> &'static str;
    fn index(&self) -> usize;
}

impl<T: PipelineStage> StageMetadata for T {
    fn name(&self) -> &'static str {
        T::NAME
    }

    fn index(&self) -> usize {
        T::INDEX
    }
}

impl From<Pending> for Stage {
    fn from(s: Pending) -> Self {
        Self::Pending(s)
    }
}

impl From<Segmented> for Stage {
    fn from(s: Segmented) -> Self {
        Self::Segmented(s)
    }
}

impl From<Enhanced> for Stage {
    fn from(s: Enhanced) -> Self {
        Self::Enhanced(s)
    }
}

impl From<ToneMapped> for Stage {
    fn from(s: ToneMapped) -> Self {
        Self::ToneMapped(s)
    }
}

impl From<Quantized> for Stage {
    fn from(s: Quantized) -> Self {
        Self::Quantized(s)
    }
}

impl From<Dithered> for Stage {
    fn from(s: Dithered) -> Self {
        Self::Dithered(s)
    }
}

// ───────────────────── Pipeline entry point ──────────────────────────

/// Incremental image processing pipeline.
///
/// Created via [`Pipeline::new`], which validates every input and
/// stores it without doing any processing. Each stage method consumes
/// the current state and returns the next, making it a compile-time
/// error to skip stages or call them out of order.
pub struct Pipeline;

impl Pipeline {
    /// Validate the inputs and create the [`Pending`] stage.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::EmptyImage`], [`PipelineError::EmptyPalette`],
    /// [`PipelineError::TargetLengthMismatch`],
    /// [`PipelineError::InvalidTarget`] or [`PipelineError::InvalidConfig`].
    #[allow(clippy::new_ret_no_self)]
    pub fn new(
        image: RgbaImage,
        palette: &[Rgb],
        targets: &[f64],
        config: PipelineConfig,
    ) -> Result<Pending, PipelineError> {
        validate_inputs(&image, palette, targets)?;
        config.validate()?;
        let palette = Palette::new(palette)?;
        tracing::debug!(
            width = image.width(),
            height = image.height(),
            palette = palette.len(),
            "pipeline inputs validated",
        );
        Ok(Pending {
            ctx: Context {
                config,
                palette,
                targets: targets.to_vec(),
                original: image,
            },
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn palette() -> [Rgb; 3] {
        [Rgb::new(20, 20, 20), Rgb::new(200, 60, 50), Rgb::new(230, 230, 230)]
    }

    /// A red disc on a light background.
    #[allow(clippy::cast_precision_loss)]
    fn subject(size: u32) -> RgbaImage {
        let c = (size as f32 - 1.0) / 2.0;
        RgbaImage::from_fn(size, size, |x, y| {
            if (x as f32 - c).hypot(y as f32 - c) < size as f32 / 4.0 {
                image::Rgba([190, 50, 45, 255])
            } else {
                image::Rgba([225, 225, 220, 255])
            }
        })
    }

    fn pending(size: u32) -> Pending {
        Pipeline::new(
            subject(size),
            &palette(),
            &[20.0, 30.0, 50.0],
            PipelineConfig::default(),
        )
        .unwrap()
    }

    // ─────────── Validation ─────────────────────────────────────

    #[test]
    fn new_rejects_empty_image() {
        let result = Pipeline::new(
            RgbaImage::new(0, 0),
            &palette(),
            &[20.0, 30.0, 50.0],
            PipelineConfig::default(),
        );
        assert!(matches!(result, Err(PipelineError::EmptyImage)));
    }

    #[test]
    fn new_rejects_invalid_config() {
        let config = PipelineConfig {
            foreground_boost: 0.0,
            ..PipelineConfig::default()
        };
        let result = Pipeline::new(subject(8), &palette(), &[20.0, 30.0, 50.0], config);
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn new_rejects_target_mismatch() {
        let result = Pipeline::new(subject(8), &palette(), &[50.0, 50.0], PipelineConfig::default());
        assert!(matches!(
            result,
            Err(PipelineError::TargetLengthMismatch {
                palette: 3,
                targets: 2
            })
        ));
    }

    // ─────────── Typed API ──────────────────────────────────────

    #[test]
    fn typed_chain_preserves_dimensions() {
        let dithered = pending(24).segment().enhance().tone_map().quantize().dither();
        assert_eq!(dithered.dimensions(), Dimensions { width: 24, height: 24 });
        let result = dithered.into_result();
        assert_eq!(result.mask.as_gray().dimensions(), (24, 24));
        assert_eq!(result.enhanced.dimensions(), (24, 24));
        assert_eq!(result.toned.dimensions(), (24, 24));
        assert_eq!(result.quantized.dimensions(), (24, 24));
        assert_eq!(result.assignments.len(), 24 * 24);
    }

    #[test]
    fn segmented_exposes_mask() {
        let segmented = pending(32).segment();
        assert!(segmented.mask().is_foreground(16, 16));
        assert!(!segmented.mask().is_foreground(0, 0));
    }

    #[test]
    fn final_usage_matches_assignments() {
        let dithered = pending(20).segment().enhance().tone_map().quantize().dither();
        let total: usize = dithered.usage().iter().map(|u| u.pixel_count).sum();
        assert_eq!(total, 400);
    }

    // ─────────── Dynamic API ────────────────────────────────────

    #[test]
    fn stage_loop_visits_every_stage_in_order() {
        let mut stage: Stage = pending(16).into();
        let mut names = vec![stage.name()];
        assert_eq!(stage.index(), 0);
        assert!(stage.metrics().is_none());
        loop {
            match stage.advance() {
                Advance::Next(next) => {
                    assert!(next.metrics().is_some());
                    assert_eq!(next.index(), names.len());
                    names.push(next.name());
                    stage = next;
                }
                Advance::Complete(done) => {
                    stage = done;
                    break;
                }
            }
        }
        assert_eq!(names.len(), STAGE_COUNT);
        assert_eq!(
            names,
            ["source", "segment", "enhance", "tone", "quantize", "dither"]
        );
        assert!(stage.is_complete());
        let result = stage.complete();
        assert_eq!(result.dimensions, Dimensions { width: 16, height: 16 });
    }

    #[test]
    fn next_on_final_stage_returns_none() {
        let stage: Stage = pending(8).segment().enhance().tone_map().quantize().dither().into();
        assert!(stage.next().is_none());
    }

    #[test]
    fn complete_from_any_stage_matches_typed_chain() {
        let from_pending = pending(16).complete();
        let from_quantized = pending(16).segment().enhance().tone_map().quantize().complete();
        assert_eq!(from_pending.assignments, from_quantized.assignments);
        assert_eq!(from_pending.dithered, from_quantized.dithered);
    }

    #[test]
    fn output_variants_match_stage() {
        let stage: Stage = pending(8).segment().into();
        assert!(matches!(stage.output(), StageOutput::Segmented { .. }));
        let stage = stage.next().unwrap().next().unwrap().next().unwrap();
        assert!(matches!(
            stage.output(),
            StageOutput::Quantized { assignments, .. } if assignments.len() == 64
        ));
    }
}

//! paintnum-pipeline: palette-constrained image quantization (sans-IO).
//!
//! Turns a photograph and a fixed paint palette into a palette-exact
//! region map for paint-by-numbers kits through:
//! segmentation -> local contrast enhancement -> tone mapping ->
//! palette-constrained quantization -> edge-preserving dithering.
//!
//! Palette usage is pushed toward caller-supplied target percentages,
//! separately for the segmented subject and its background.
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! [`RgbaImage`] buffers and returns structured data. Decoding and
//! encoding image files is left to the caller.

pub mod clahe;
pub mod color;
pub mod diagnostics;
pub mod dither;
pub mod pipeline;
pub mod quantize;
pub mod segment;
pub mod tone;
pub mod types;

pub use color::{Lab, ParseColorError, Rgb, perceptual_distance, to_display, to_perceptual};
pub use dither::DitherOptions;
pub use pipeline::Pipeline;
pub use quantize::{BalanceOutcome, RegionUsage, ToleranceViolation};
pub use segment::SegmentOptions;
pub use types::{
    Dimensions, GrayImage, Palette, PipelineConfig, PipelineError, ProcessResult, Region,
    RgbaImage, SegmentationMask, StagedResult,
};

/// Run the full pipeline and return the palette-exact region map.
///
/// # Pipeline steps
///
/// 1. Validate image, palette, targets and config
/// 2. Segment foreground from background (k-means)
/// 3. CLAHE on lightness
/// 4. Foreground lightness boost, background desaturation
/// 5. Nearest-color quantization with per-region rebalancing
/// 6. Floyd-Steinberg dithering near strong edges
///
/// Unmet targets are not an error; they are reported in
/// [`ProcessResult::outcome`].
///
/// # Errors
///
/// Returns [`PipelineError::EmptyImage`], [`PipelineError::EmptyPalette`],
/// [`PipelineError::TargetLengthMismatch`],
/// [`PipelineError::InvalidTarget`] or [`PipelineError::InvalidConfig`]
/// before any processing starts.
pub fn process(
    image: &RgbaImage,
    palette: &[Rgb],
    targets: &[f64],
    config: &PipelineConfig,
) -> Result<ProcessResult, PipelineError> {
    types::validate_inputs(image, palette, targets)?;
    config.validate()?;
    let palette = Palette::new(palette)?;

    // 1. Segmentation.
    let mask = segment::segment(image, &config.segment).mask;

    // 2. Local contrast.
    let enhanced = clahe::enhance(image, config.clahe_clip_limit, config.clahe_tile_grid);

    // 3. Tone curves.
    let toned = tone::apply_tone_curves(
        &enhanced,
        &mask,
        config.foreground_boost,
        config.background_desaturate,
    );

    // 4. Quantization and rebalancing.
    let quantization = quantize::quantize(&toned, &palette, targets, &mask, config.tolerance_percent);

    // 5. Edge dithering.
    let dithering = dither::dither(&toned, &quantization, &palette, &mask, &config.dither);

    let usage = quantization.usage_after(&dithering.assignments, &mask);
    let outcome = quantize::evaluate_balance(&usage, targets, config.tolerance_percent);
    Ok(ProcessResult {
        image: dithering.image,
        assignments: dithering.assignments,
        dimensions: Dimensions::of(image),
        usage,
        outcome,
    })
}

/// Run the full pipeline, keeping every intermediate.
///
/// Equivalent to driving [`Pipeline`] through all stages.
///
/// # Errors
///
/// Same as [`process`].
pub fn process_staged(
    image: &RgbaImage,
    palette: &[Rgb],
    targets: &[f64],
    config: &PipelineConfig,
) -> Result<StagedResult, PipelineError> {
    Ok(Pipeline::new(image.clone(), palette, targets, config.clone())?
        .segment()
        .enhance()
        .tone_map()
        .quantize()
        .dither()
        .into_result())
}

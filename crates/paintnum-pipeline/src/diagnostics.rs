//! Pipeline diagnostics: timing, counts, and other metrics for each stage.
//!
//! These diagnostics are permanent instrumentation intended for
//! parameter tuning. [`process_staged_with_diagnostics`] runs the typed
//! pipeline and records one [`StageDiagnostics`] per stage.
//!
//! Time is read through the [`Clock`] trait so this crate stays free of
//! platform timing APIs; callers pass whatever clock fits their
//! environment.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::color::Rgb;
use crate::pipeline::Pipeline;
use crate::quantize::ToleranceViolation;
use crate::types::{PipelineConfig, PipelineError, RgbaImage, StagedResult};

/// Source of monotonic time for stage measurements.
pub trait Clock {
    /// Opaque timestamp.
    type Instant;

    /// The current time.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics collected from a single pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDiagnostics {
    /// Stage 1: foreground segmentation.
    pub segment: StageDiagnostics,
    /// Stage 2: local contrast enhancement.
    pub enhance: StageDiagnostics,
    /// Stage 3: segment-aware tone mapping.
    pub tone_map: StageDiagnostics,
    /// Stage 4: palette-constrained quantization.
    pub quantize: StageDiagnostics,
    /// Stage 5: edge-preserving dithering.
    pub dither: StageDiagnostics,
    /// Total wall-clock duration, including input validation (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Summary across all stages.
    pub summary: PipelineSummary,
}

/// Diagnostics for a single pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics.
    pub metrics: StageMetrics,
}

/// Stage-specific metrics that vary by pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Foreground segmentation metrics.
    Segment {
        /// Lloyd iterations run.
        iterations: usize,
        /// Whether assignments stopped changing before the cap.
        converged: bool,
        /// Whether the degenerate-cluster fallback chose the foreground.
        fallback: bool,
        /// Pixels per cluster.
        cluster_sizes: Vec<usize>,
        /// Fraction of pixels in the final mask's foreground.
        foreground_fraction: f64,
    },
    /// CLAHE metrics.
    Enhance {
        /// Clip limit used.
        clip_limit: f32,
        /// Tiles along x after clamping to the width.
        tiles_x: u32,
        /// Tiles along y after clamping to the height.
        tiles_y: u32,
    },
    /// Tone mapping metrics.
    ToneMap {
        /// Foreground lightness multiplier.
        foreground_boost: f32,
        /// Background chroma multiplier.
        background_desaturate: f32,
    },
    /// Quantization metrics.
    Quantize {
        /// Number of palette entries.
        palette_size: usize,
        /// Tolerance band in percentage points.
        tolerance: f64,
        /// Pixels moved by rebalancing.
        reassigned: usize,
        /// Targets missed after rebalancing.
        violations: usize,
    },
    /// Dithering metrics.
    Dither {
        /// Pixels in the dilated edge set.
        active_pixels: usize,
        /// Pixels whose palette entry changed.
        changed: usize,
        /// Total pixel count, for computing densities.
        total_pixel_count: usize,
    },
}

/// High-level summary for the entire pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    /// Source image width in pixels.
    pub image_width: u32,
    /// Source image height in pixels.
    pub image_height: u32,
    /// Total pixel count.
    pub pixel_count: u64,
    /// Number of palette entries.
    pub palette_size: usize,
    /// Fraction of pixels in the foreground (0.0–1.0).
    pub foreground_fraction: f64,
    /// Targets missed in the final output.
    pub violations: Vec<ToleranceViolation>,
}

impl PipelineDiagnostics {
    /// The stages in pipeline order, labeled for display.
    #[must_use]
    pub fn stages(&self) -> [(&'static str, &StageDiagnostics); 5] {
        [
            ("Segment", &self.segment),
            ("Enhance", &self.enhance),
            ("Tone Map", &self.tone_map),
            ("Quantize", &self.quantize),
            ("Dither", &self.dither),
        ]
    }

    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Pipeline Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Image: {}x{} ({} pixels)  Palette: {} colors",
            self.summary.image_width,
            self.summary.image_height,
            self.summary.pixel_count,
            self.summary.palette_size,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        for (name, diag) in self.stages() {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        lines.push(format!(
            "Foreground: {:.1}%  |  Outcome: {}",
            self.summary.foreground_fraction * 100.0,
            if self.summary.violations.is_empty() {
                "balanced".to_string()
            } else {
                format!("best effort ({} unmet)", self.summary.violations.len())
            },
        ));
        for violation in &self.summary.violations {
            lines.push(format!("  {violation}"));
        }

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
#[must_use]
pub fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
#[allow(clippy::cast_precision_loss)]
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Segment {
            iterations,
            converged,
            fallback,
            cluster_sizes,
            foreground_fraction,
        } => {
            let sizes: Vec<String> = cluster_sizes.iter().map(ToString::to_string).collect();
            format!(
                "iters={iterations}{} clusters=[{}] fg={:.1}%{}",
                if *converged { "" } else { " (capped)" },
                sizes.join(","),
                foreground_fraction * 100.0,
                if *fallback { " fallback" } else { "" },
            )
        }
        StageMetrics::Enhance {
            clip_limit,
            tiles_x,
            tiles_y,
        } => format!("clip={clip_limit:.2} tiles={tiles_x}x{tiles_y}"),
        StageMetrics::ToneMap {
            foreground_boost,
            background_desaturate,
        } => format!("boost={foreground_boost:.2} desaturate={background_desaturate:.2}"),
        StageMetrics::Quantize {
            palette_size,
            tolerance,
            reassigned,
            violations,
        } => format!(
            "{palette_size} colors tol={tolerance:.1}% reassigned={reassigned} unmet={violations}"
        ),
        StageMetrics::Dither {
            active_pixels,
            changed,
            total_pixel_count,
        } => {
            let density = if *total_pixel_count > 0 {
                *active_pixels as f64 / *total_pixel_count as f64 * 100.0
            } else {
                0.0
            };
            format!("active={active_pixels} ({density:.1}%) changed={changed}")
        }
    }
}

/// Run the full pipeline, timing every stage with `clock`.
///
/// # Errors
///
/// Returns the same validation errors as [`Pipeline::new`].
pub fn process_staged_with_diagnostics<C: Clock>(
    image: &RgbaImage,
    palette: &[Rgb],
    targets: &[f64],
    config: &PipelineConfig,
    clock: &C,
) -> Result<(StagedResult, PipelineDiagnostics), PipelineError> {
    let total_start = clock.now();
    let pending = Pipeline::new(image.clone(), palette, targets, config.clone())?;
    let palette_size = pending.palette().len();

    let start = clock.now();
    let segmented = pending.segment();
    let segment = StageDiagnostics {
        duration: clock.elapsed(&start),
        metrics: segmented.stage_metrics(),
    };

    let start = clock.now();
    let enhanced = segmented.enhance();
    let enhance = StageDiagnostics {
        duration: clock.elapsed(&start),
        metrics: enhanced.stage_metrics(),
    };

    let start = clock.now();
    let toned = enhanced.tone_map();
    let tone_map = StageDiagnostics {
        duration: clock.elapsed(&start),
        metrics: toned.stage_metrics(),
    };

    let start = clock.now();
    let quantized = toned.quantize();
    let quantize = StageDiagnostics {
        duration: clock.elapsed(&start),
        metrics: quantized.stage_metrics(),
    };

    let start = clock.now();
    let dithered = quantized.dither();
    let dither = StageDiagnostics {
        duration: clock.elapsed(&start),
        metrics: dithered.stage_metrics(),
    };

    let staged = dithered.into_result();
    let total_duration = clock.elapsed(&total_start);

    let summary = PipelineSummary {
        image_width: staged.dimensions.width,
        image_height: staged.dimensions.height,
        pixel_count: u64::from(staged.dimensions.width) * u64::from(staged.dimensions.height),
        palette_size,
        foreground_fraction: staged.mask.foreground_fraction(),
        violations: staged.outcome.violations().to_vec(),
    };

    tracing::debug!(
        total_ms = duration_ms(total_duration),
        balanced = staged.outcome.is_balanced(),
        "pipeline complete",
    );

    Ok((
        staged,
        PipelineDiagnostics {
            segment,
            enhance,
            tone_map,
            quantize,
            dither,
            total_duration,
            summary,
        },
    ))
}

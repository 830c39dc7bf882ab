//! paintnum-bench: CLI tool for palette quantization experiments and diagnostics.
//!
//! Runs the quantization pipeline on an image file with a chosen palette,
//! target percentages and tuning parameters, then prints per-stage timings,
//! palette usage per region and any targets the rebalancer could not meet.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin paintnum-bench -- [OPTIONS] <IMAGE_PATH>
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use paintnum_pipeline::diagnostics::{self, Clock, PipelineDiagnostics};
use paintnum_pipeline::{PipelineConfig, RegionUsage, Rgb, StagedResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Five-color skin palette used when `--palette` is not given.
const DEFAULT_PALETTE: &str = "#EDE0D4,#DFC4B0,#A9826D,#785A4B,#FFE5CC";

/// Targets paired with [`DEFAULT_PALETTE`].
const DEFAULT_TARGETS: &str = "30,20,20,15,15";

/// Palette-constrained quantization for paint-by-numbers kits.
///
/// Segments the subject, enhances and tone-maps the image, maps every pixel
/// to the palette with per-region usage rebalancing and dithers near edges.
#[derive(Parser)]
#[command(name = "paintnum-bench", version)]
struct Cli {
    /// Path to the input image (PNG, JPEG, BMP, WebP).
    image_path: PathBuf,

    /// Comma-separated hex palette (`#RRGGBB` or `#RGB`).
    #[arg(long, default_value = DEFAULT_PALETTE)]
    palette: String,

    /// Comma-separated target percentages, one per palette color.
    #[arg(long, default_value = DEFAULT_TARGETS)]
    targets: String,

    /// CLAHE clip limit.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_CLAHE_CLIP_LIMIT)]
    clip_limit: f32,

    /// CLAHE tile grid (tiles per side).
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_CLAHE_TILE_GRID)]
    tile_grid: u32,

    /// Foreground lightness multiplier.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_FOREGROUND_BOOST)]
    foreground_boost: f32,

    /// Background chroma multiplier.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_BACKGROUND_DESATURATE)]
    background_desaturate: f32,

    /// Allowed deviation from each target, in percentage points.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_TOLERANCE_PERCENT)]
    tolerance: f64,

    /// Write the palette-exact output image (PNG).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Write the segmentation mask (PNG, 255 = foreground).
    #[arg(long)]
    mask_output: Option<PathBuf>,

    /// Number of runs for averaging.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    runs: usize,

    /// Output diagnostics as JSON instead of human-readable report.
    #[arg(long)]
    json: bool,

    /// Full pipeline config as a JSON string.
    ///
    /// When provided, the individual tuning flags are ignored. Palette and
    /// targets still come from `--palette` and `--targets`.
    #[arg(long)]
    config_json: Option<String>,
}

/// Parse a comma-separated list of hex colors.
fn parse_palette(list: &str) -> Result<Vec<Rgb>, String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Rgb>().map_err(|e| e.to_string()))
        .collect()
}

/// Parse a comma-separated list of percentages.
fn parse_targets(list: &str) -> Result<Vec<f64>, String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.trim_end_matches('%')
                .parse::<f64>()
                .map_err(|e| format!("invalid target {s:?}: {e}"))
        })
        .collect()
}

/// Build a [`PipelineConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and the
/// individual tuning flags are ignored.
fn config_from_cli(cli: &Cli) -> Result<PipelineConfig, String> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }

    Ok(PipelineConfig {
        clahe_clip_limit: cli.clip_limit,
        clahe_tile_grid: cli.tile_grid,
        foreground_boost: cli.foreground_boost,
        background_desaturate: cli.background_desaturate,
        tolerance_percent: cli.tolerance,
        ..PipelineConfig::default()
    })
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let inputs = config_from_cli(&cli).and_then(|config| {
        Ok((
            config,
            parse_palette(&cli.palette)?,
            parse_targets(&cli.targets)?,
        ))
    });
    let (config, palette, targets) = match inputs {
        Ok(inputs) => inputs,
        Err(msg) => {
            tracing::error!("{msg}");
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let image = match image::open(&cli.image_path) {
        Ok(img) => img.to_rgba8(),
        Err(e) => {
            tracing::error!(path = %cli.image_path.display(), "failed to load image: {e}");
            eprintln!("Error reading {}: {e}", cli.image_path.display());
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        path = %cli.image_path.display(),
        width = image.width(),
        height = image.height(),
        palette = palette.len(),
        runs = cli.runs,
        "loaded image",
    );
    eprintln!("Config: {config:#?}");
    eprintln!();

    let mut all_diagnostics = Vec::with_capacity(cli.runs);

    for run in 0..cli.runs {
        if cli.runs > 1 {
            eprintln!("--- Run {}/{} ---", run + 1, cli.runs);
        }

        match diagnostics::process_staged_with_diagnostics(
            &image, &palette, &targets, &config, &StdClock,
        ) {
            Ok((staged, diagnostics)) => {
                if cli.json {
                    match serde_json::to_string_pretty(&diagnostics) {
                        Ok(json) => println!("{json}"),
                        Err(e) => {
                            eprintln!("Error serializing diagnostics: {e}");
                            return ExitCode::FAILURE;
                        }
                    }
                } else {
                    println!("{}", diagnostics.report());
                    println!();
                    println!("{}", usage_report(&staged.usage, &palette, &targets));
                }

                // Outputs are identical across runs; write them once.
                if run == 0 && !write_outputs(&cli, &staged) {
                    return ExitCode::FAILURE;
                }

                all_diagnostics.push(diagnostics);
            }
            Err(e) => {
                tracing::error!("pipeline error: {e}");
                eprintln!("Pipeline error: {e}");
                return ExitCode::FAILURE;
            }
        }

        if cli.runs > 1 {
            eprintln!();
        }
    }

    if cli.runs > 1 {
        print_multi_run_summary(&all_diagnostics);
    }

    ExitCode::SUCCESS
}

/// Save the requested PNG outputs. Returns `false` if any write failed.
fn write_outputs(cli: &Cli, staged: &StagedResult) -> bool {
    let mut ok = true;
    if let Some(ref path) = cli.output {
        ok &= save_png(path, "output", || staged.dithered.save(path));
    }
    if let Some(ref path) = cli.mask_output {
        ok &= save_png(path, "mask", || staged.mask.as_gray().save(path));
    }
    ok
}

fn save_png(path: &Path, what: &str, save: impl FnOnce() -> image::ImageResult<()>) -> bool {
    match save() {
        Ok(()) => {
            eprintln!("{what} written to {}", path.display());
            true
        }
        Err(e) => {
            tracing::error!(path = %path.display(), "failed to write {what}: {e}");
            eprintln!("Error writing {what} to {}: {e}", path.display());
            false
        }
    }
}

/// Format realized palette usage against the targets, one table per region.
fn usage_report(usage: &[RegionUsage; 2], palette: &[Rgb], targets: &[f64]) -> String {
    let mut lines = vec![format!(
        "{:<12} {:<8} {:>9} {:>9} {:>9}",
        "Region", "Color", "Target", "Realized", "Pixels"
    )];
    lines.push("-".repeat(52));
    for region in usage {
        let percentages = region.percentages();
        for (i, color) in palette.iter().enumerate() {
            lines.push(format!(
                "{:<12} {:<8} {:>8.1}% {:>8.1}% {:>9}",
                region.region.to_string(),
                color.to_string(),
                targets.get(i).copied().unwrap_or(0.0),
                percentages.get(i).copied().unwrap_or(0.0),
                region.counts.get(i).copied().unwrap_or(0),
            ));
        }
        lines.push(format!(
            "{:<12} {} pixels, {} reassigned",
            "", region.pixel_count, region.reassigned
        ));
    }
    lines.join("\n")
}

/// [`Clock`] implementation backed by [`std::time::Instant`].
struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn elapsed(&self, since: &Instant) -> Duration {
        since.elapsed()
    }
}

/// Print aggregated statistics across multiple runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(all_diagnostics: &[PipelineDiagnostics]) {
    println!();
    println!(
        "Summary ({} runs)\n{}",
        all_diagnostics.len(),
        "=".repeat(60),
    );

    if all_diagnostics.is_empty() {
        println!("Warning: no diagnostics to summarize");
        return;
    }

    let totals: Vec<f64> = all_diagnostics
        .iter()
        .map(|d| diagnostics::duration_ms(d.total_duration))
        .collect();
    let (min, mean, max) = spread(&totals);
    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    println!();
    println!("{:<24} {:>12}", "Stage", "Mean (ms)");
    println!("{}", "-".repeat(40));

    let names = all_diagnostics[0].stages().map(|(name, _)| name);
    for (i, name) in names.into_iter().enumerate() {
        let stage: Vec<f64> = all_diagnostics
            .iter()
            .map(|d| diagnostics::duration_ms(d.stages()[i].1.duration))
            .collect();
        let (_, stage_mean, _) = spread(&stage);
        println!("{name:<24} {stage_mean:>10.3}ms");
    }
}

/// Minimum, mean and maximum of a non-empty sample.
#[allow(clippy::cast_precision_loss)]
fn spread(values: &[f64]) -> (f64, f64, f64) {
    let min = values.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = values.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    };
    (min, mean, max)
}

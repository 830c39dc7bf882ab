//! Unsupervised foreground/background segmentation.
//!
//! Pixels are clustered with k-means over a five-dimensional feature
//! vector: L\*a\*b\* color (scaled to roughly unit range) plus the pixel's
//! normalized position, weighted by [`SegmentOptions::spatial_weight`].
//! The position terms favor spatially coherent regions over scattered
//! color matches.
//!
//! Seeding is deterministic (image center first, then farthest-point), so
//! the same input always yields the same mask.
//!
//! The foreground is the cluster that sits furthest from the image
//! border on average. If any cluster holds less than
//! [`MIN_CLUSTER_FRACTION`] of the pixels the clustering is treated as
//! degenerate and the cluster whose spatial centroid is nearest the
//! image center becomes foreground instead, so a usable mask is always
//! produced.

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::color::{Lab, Rgb};
use crate::types::{PipelineError, RgbaImage, SegmentationMask};

/// Clusters smaller than this fraction of the image trigger the
/// spatial-centrality fallback.
pub const MIN_CLUSTER_FRACTION: f64 = 0.05;

/// Number of feature dimensions: L, a, b, x, y.
const FEATURES: usize = 5;

type Feature = [f32; FEATURES];

/// Parameters for [`segment`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentOptions {
    /// Number of k-means clusters. Exactly one cluster becomes
    /// foreground. Must be at least 2.
    pub clusters: usize,

    /// Upper bound on Lloyd iterations. Must be at least 1.
    pub max_iterations: usize,

    /// Weight of the normalized `(x, y)` position relative to the
    /// color terms. `0.0` clusters on color alone.
    pub spatial_weight: f32,

    /// Radius of the median filter applied to the finished mask. Skipped
    /// when the degenerate-cluster fallback picked the foreground.
    /// `0` disables smoothing.
    pub median_radius: u32,
}

impl SegmentOptions {
    /// Default number of clusters.
    pub const DEFAULT_CLUSTERS: usize = 2;
    /// Default iteration cap.
    pub const DEFAULT_MAX_ITERATIONS: usize = 20;
    /// Default spatial weight.
    pub const DEFAULT_SPATIAL_WEIGHT: f32 = 0.3;
    /// Default mask smoothing radius.
    pub const DEFAULT_MEDIAN_RADIUS: u32 = 1;

    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if `clusters < 2`,
    /// `max_iterations == 0`, or `spatial_weight` is negative or not
    /// finite.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.clusters < 2 {
            return Err(PipelineError::InvalidConfig(format!(
                "segment.clusters must be at least 2, got {}",
                self.clusters
            )));
        }
        if self.max_iterations == 0 {
            return Err(PipelineError::InvalidConfig(
                "segment.max_iterations must be at least 1".to_string(),
            ));
        }
        if !(self.spatial_weight.is_finite() && self.spatial_weight >= 0.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "segment.spatial_weight must be non-negative, got {}",
                self.spatial_weight
            )));
        }
        Ok(())
    }
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            clusters: Self::DEFAULT_CLUSTERS,
            max_iterations: Self::DEFAULT_MAX_ITERATIONS,
            spatial_weight: Self::DEFAULT_SPATIAL_WEIGHT,
            median_radius: Self::DEFAULT_MEDIAN_RADIUS,
        }
    }
}

/// Output of [`segment`]: the mask plus how it was obtained.
#[derive(Debug, Clone)]
pub struct Segmentation {
    /// The binary foreground/background mask.
    pub mask: SegmentationMask,
    /// Lloyd iterations actually run.
    pub iterations: usize,
    /// Whether assignments stopped changing before the iteration cap.
    pub converged: bool,
    /// Pixel count per cluster.
    pub cluster_sizes: Vec<usize>,
    /// Which cluster was labeled foreground.
    pub foreground_cluster: usize,
    /// Whether the degenerate-cluster fallback decided the labeling.
    pub fallback: bool,
}

/// Segment `image` into foreground and background.
///
/// The returned mask always has the same dimensions as `image`. An empty
/// image yields an empty mask.
#[must_use = "returns the segmentation"]
pub fn segment(image: &RgbaImage, options: &SegmentOptions) -> Segmentation {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Segmentation {
            mask: SegmentationMask::from_gray(GrayImage::new(width, height)),
            iterations: 0,
            converged: true,
            cluster_sizes: Vec::new(),
            foreground_cluster: 0,
            fallback: false,
        };
    }

    let features = extract_features(image, options.spatial_weight);
    let k = options.clusters.max(2);
    let center_index = (height / 2) as usize * width as usize + (width / 2) as usize;

    let mut centroids = seed_centroids(&features, k, center_index);
    let mut labels = vec![usize::MAX; features.len()];
    let mut iterations = 0;
    let mut converged = false;

    for _ in 0..options.max_iterations.max(1) {
        iterations += 1;
        let mut changed = false;
        for (label, feature) in labels.iter_mut().zip(&features) {
            let nearest = nearest_centroid(feature, &centroids);
            if *label != nearest {
                *label = nearest;
                changed = true;
            }
        }
        if !changed {
            converged = true;
            break;
        }
        update_centroids(&features, &labels, &mut centroids);
    }

    let stats = cluster_stats(&labels, k, width, height);
    let (foreground_cluster, fallback) = choose_foreground(&stats, labels[center_index], width, height);

    let raw = GrayImage::from_fn(width, height, |x, y| {
        let label = labels[y as usize * width as usize + x as usize];
        image::Luma([if label == foreground_cluster { 255 } else { 0 }])
    });
    // A fallback cluster may be a single pixel; smoothing would erase it.
    let smoothed = if options.median_radius > 0 && !fallback {
        imageproc::filter::median_filter(&raw, options.median_radius, options.median_radius)
    } else {
        raw
    };
    let mask = SegmentationMask::from_gray(smoothed);

    tracing::debug!(
        iterations,
        converged,
        fallback,
        foreground_cluster,
        foreground_fraction = mask.foreground_fraction(),
        "segmentation complete",
    );

    Segmentation {
        mask,
        iterations,
        converged,
        cluster_sizes: stats.iter().map(|s| s.size).collect(),
        foreground_cluster,
        fallback,
    }
}

/// Build the `(L, a, b, x, y)` feature vector for every pixel.
#[allow(clippy::cast_precision_loss)]
fn extract_features(image: &RgbaImage, spatial_weight: f32) -> Vec<Feature> {
    let (width, height) = image.dimensions();
    let norm = |v: u32, extent: u32| {
        if extent > 1 {
            v as f32 / (extent - 1) as f32
        } else {
            0.5
        }
    };
    image
        .enumerate_pixels()
        .map(|(x, y, px)| {
            let lab = Lab::from(Rgb::new(px.0[0], px.0[1], px.0[2]));
            [
                lab.l / 100.0,
                lab.a / 100.0,
                lab.b / 100.0,
                spatial_weight * norm(x, width),
                spatial_weight * norm(y, height),
            ]
        })
        .collect()
}

fn distance_squared(a: &Feature, b: &Feature) -> f32 {
    a.iter().zip(b).map(|(p, q)| (p - q) * (p - q)).sum()
}

/// Deterministic farthest-point seeding starting from the center pixel.
fn seed_centroids(features: &[Feature], k: usize, center_index: usize) -> Vec<Feature> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(features[center_index]);
    let mut nearest: Vec<f32> = features
        .iter()
        .map(|f| distance_squared(f, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let mut far_index = 0;
        let mut far_dist = f32::NEG_INFINITY;
        for (i, &d) in nearest.iter().enumerate() {
            if d > far_dist {
                far_index = i;
                far_dist = d;
            }
        }
        let seed = features[far_index];
        centroids.push(seed);
        for (n, f) in nearest.iter_mut().zip(features) {
            *n = n.min(distance_squared(f, &seed));
        }
    }
    centroids
}

fn nearest_centroid(feature: &Feature, centroids: &[Feature]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let d = distance_squared(feature, c);
        if d < best_dist {
            best = i;
            best_dist = d;
        }
    }
    best
}

/// Move every centroid to the mean of its members. Empty clusters keep
/// their previous centroid.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn update_centroids(features: &[Feature], labels: &[usize], centroids: &mut [Feature]) {
    let mut sums = vec![[0.0_f64; FEATURES]; centroids.len()];
    let mut counts = vec![0_usize; centroids.len()];
    for (feature, &label) in features.iter().zip(labels) {
        counts[label] += 1;
        for (s, &v) in sums[label].iter_mut().zip(feature) {
            *s += f64::from(v);
        }
    }
    for ((centroid, sum), &count) in centroids.iter_mut().zip(&sums).zip(&counts) {
        if count == 0 {
            continue;
        }
        for (c, &s) in centroid.iter_mut().zip(sum) {
            *c = (s / count as f64) as f32;
        }
    }
}

/// Per-cluster spatial statistics used for labeling.
#[derive(Debug, Clone, Copy, Default)]
struct ClusterStats {
    size: usize,
    mean_border_distance: f64,
    centroid_x: f64,
    centroid_y: f64,
}

#[allow(clippy::cast_precision_loss)]
fn cluster_stats(labels: &[usize], k: usize, width: u32, height: u32) -> Vec<ClusterStats> {
    let mut stats = vec![ClusterStats::default(); k];
    let w = width as usize;
    let right = f64::from(width - 1);
    let bottom = f64::from(height - 1);
    for (i, &label) in labels.iter().enumerate() {
        let x = (i % w) as f64;
        let y = (i / w) as f64;
        let border = x.min(right - x).min(y).min(bottom - y);
        let s = &mut stats[label];
        s.size += 1;
        s.mean_border_distance += border;
        s.centroid_x += x;
        s.centroid_y += y;
    }
    for s in &mut stats {
        if s.size > 0 {
            let n = s.size as f64;
            s.mean_border_distance /= n;
            s.centroid_x /= n;
            s.centroid_y /= n;
        }
    }
    stats
}

/// Pick the foreground cluster. Returns `(cluster, fallback_used)`.
#[allow(clippy::cast_precision_loss)]
fn choose_foreground(
    stats: &[ClusterStats],
    center_label: usize,
    width: u32,
    height: u32,
) -> (usize, bool) {
    let total: usize = stats.iter().map(|s| s.size).sum();
    let min_size = MIN_CLUSTER_FRACTION * total as f64;
    let degenerate = stats.iter().any(|s| (s.size as f64) < min_size);

    if degenerate {
        let cx = f64::from(width - 1) / 2.0;
        let cy = f64::from(height - 1) / 2.0;
        let mut best = center_label;
        let mut best_dist = f64::INFINITY;
        for (i, s) in stats.iter().enumerate() {
            if s.size == 0 {
                continue;
            }
            let d = (s.centroid_x - cx).hypot(s.centroid_y - cy);
            if d < best_dist {
                best = i;
                best_dist = d;
            }
        }
        return (best, true);
    }

    let mut best = center_label;
    let mut best_border = stats[center_label].mean_border_distance;
    for (i, s) in stats.iter().enumerate() {
        if s.mean_border_distance > best_border + 1e-9 {
            best = i;
            best_border = s.mean_border_distance;
        }
    }
    (best, false)
}

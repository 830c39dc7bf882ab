//! Segment-aware tone mapping.
//!
//! The subject is lifted (foreground L\* scaled by a boost factor) and the
//! surroundings are muted (background a\*/b\* scaled toward neutral), so
//! the later palette fit spends its lighter, more saturated colors on the
//! subject.

use crate::color::{Lab, MAX_LIGHTNESS, Rgb, to_display, to_perceptual};
use crate::types::{Region, RgbaImage, SegmentationMask};

/// Apply per-region tone curves.
///
/// Foreground pixels get `L ← clamp(L · foreground_boost, 0, 100)`;
/// background pixels get `a ← a · background_desaturate` and
/// `b ← b · background_desaturate` with L unchanged. Alpha is kept.
///
/// # Panics
///
/// Panics if `mask` and `image` dimensions differ.
#[must_use = "returns the tone-mapped image"]
pub fn apply_tone_curves(
    image: &RgbaImage,
    mask: &SegmentationMask,
    foreground_boost: f32,
    background_desaturate: f32,
) -> RgbaImage {
    assert_eq!(
        image.dimensions(),
        mask.as_gray().dimensions(),
        "mask and image dimensions differ",
    );

    let mut out = image.clone();
    for (x, y, px) in out.enumerate_pixels_mut() {
        let [r, g, b, a] = px.0;
        let lab = to_perceptual(Rgb::new(r, g, b));
        let mapped = match mask.region(x, y) {
            Region::Foreground => Lab::new(
                (lab.l * foreground_boost).clamp(0.0, MAX_LIGHTNESS),
                lab.a,
                lab.b,
            ),
            Region::Background => Lab::new(
                lab.l,
                lab.a * background_desaturate,
                lab.b * background_desaturate,
            ),
        };
        let rgb = to_display(mapped);
        *px = image::Rgba([rgb.r, rgb.g, rgb.b, a]);
    }

    tracing::debug!(
        foreground_boost,
        background_desaturate,
        "tone curves applied",
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    fn half_mask(width: u32, height: u32) -> SegmentationMask {
        SegmentationMask::from_gray(GrayImage::from_fn(width, height, |x, _| {
            image::Luma([if x < width / 2 { 255 } else { 0 }])
        }))
    }

    fn chroma(px: &image::Rgba<u8>) -> f32 {
        let lab = to_perceptual(Rgb::new(px.0[0], px.0[1], px.0[2]));
        lab.a.hypot(lab.b)
    }

    /// Equal up to sRGB round-trip rounding.
    fn close(a: &image::Rgba<u8>, b: &image::Rgba<u8>) -> bool {
        a.0.iter().zip(b.0).all(|(&p, q)| p.abs_diff(q) <= 2)
    }

    fn lightness(px: &image::Rgba<u8>) -> f32 {
        to_perceptual(Rgb::new(px.0[0], px.0[1], px.0[2])).l
    }

    #[test]
    #[should_panic(expected = "mask and image dimensions differ")]
    fn mismatched_mask_is_rejected() {
        let image = RgbaImage::new(4, 4);
        let _ = apply_tone_curves(&image, &half_mask(8, 8), 1.2, 0.5);
    }

    #[test]
    fn foreground_is_brightened() {
        let img = RgbaImage::from_pixel(4, 1, image::Rgba([120, 100, 90, 255]));
        let out = apply_tone_curves(&img, &half_mask(4, 1), 1.2, 1.0);
        assert!(lightness(out.get_pixel(0, 0)) > lightness(img.get_pixel(0, 0)) + 5.0);
        assert!(close(out.get_pixel(3, 0), img.get_pixel(3, 0)));
    }

    #[test]
    fn background_is_desaturated() {
        let img = RgbaImage::from_pixel(4, 1, image::Rgba([200, 60, 40, 255]));
        let out = apply_tone_curves(&img, &half_mask(4, 1), 1.0, 0.5);
        let before = chroma(img.get_pixel(3, 0));
        let after = chroma(out.get_pixel(3, 0));
        assert!(after < before * 0.6, "chroma {before} -> {after}");
        assert!((lightness(out.get_pixel(3, 0)) - lightness(img.get_pixel(3, 0))).abs() < 1.5);
        assert!(close(out.get_pixel(0, 0), img.get_pixel(0, 0)));
    }

    #[test]
    fn boost_clamps_at_white() {
        let img = RgbaImage::from_pixel(2, 2, image::Rgba([250, 250, 250, 255]));
        let mask = SegmentationMask::uniform(2, 2, Region::Foreground);
        let out = apply_tone_curves(&img, &mask, 3.0, 1.0);
        assert!(out.pixels().all(|p| p.0[..3].iter().all(|&c| c >= 254)));
    }

    #[test]
    fn alpha_and_dimensions_are_kept() {
        let img = RgbaImage::from_fn(5, 3, |x, y| image::Rgba([90, 120, 150, (x * 40 + y) as u8]));
        let out = apply_tone_curves(&img, &half_mask(5, 3), 1.15, 0.7);
        assert_eq!(out.dimensions(), (5, 3));
        for (a, b) in img.pixels().zip(out.pixels()) {
            assert_eq!(a.0[3], b.0[3]);
        }
    }
}

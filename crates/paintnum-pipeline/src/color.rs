//! Display ↔ perceptual color conversion and the CIE76 distance metric.
//!
//! Every stage that reasons about "how different two colors look" goes
//! through this module. Display colors are 8-bit sRGB triples ([`Rgb`]);
//! perceptual colors are CIE L\*a\*b\* under the D65 white point
//! ([`Lab`]).
//!
//! The forward transform is the standard two-stage one:
//!
//! 1. sRGB → linear RGB (IEC 61966-2-1 transfer curve) → CIE XYZ
//! 2. XYZ → L\*a\*b\* (cube-root nonlinearity relative to the D65 white)
//!
//! All functions are pure and infallible. Out-of-gamut L\*a\*b\* values are
//! clamped only when converting back to 8-bit display values.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// D65 reference white in XYZ (Y normalized to 1).
const WHITE_X: f32 = 0.950_47;
const WHITE_Y: f32 = 1.0;
const WHITE_Z: f32 = 1.088_83;

/// CIE constants: `(6/29)^3` and `(29/3)^3`.
const EPSILON: f32 = 216.0 / 24389.0;
const KAPPA: f32 = 24389.0 / 27.0;

/// Maximum L\* value.
pub const MAX_LIGHTNESS: f32 = 100.0;

/// An 8-bit display color (sRGB).
///
/// Serialized as a `[r, g, b]` array. Parses from `#RRGGBB`, `RRGGBB`
/// or the short `#RGB` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[u8; 3]", into = "[u8; 3]")]
pub struct Rgb {
    /// Red channel.
    pub r: u8,
    /// Green channel.
    pub g: u8,
    /// Blue channel.
    pub b: u8,
}

impl Rgb {
    /// Create a color from its three channels.
    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// The channels as a `[r, g, b]` array.
    #[must_use]
    pub const fn to_array(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }

    /// Rec. 601 luma, as used for gradient measurement.
    #[must_use]
    pub fn luma(self) -> f32 {
        0.114_f32.mul_add(
            f32::from(self.b),
            0.299_f32.mul_add(f32::from(self.r), 0.587 * f32::from(self.g)),
        )
    }
}

impl From<[u8; 3]> for Rgb {
    fn from([r, g, b]: [u8; 3]) -> Self {
        Self { r, g, b }
    }
}

impl From<Rgb> for [u8; 3] {
    fn from(c: Rgb) -> Self {
        c.to_array()
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Error returned when a hex color string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid hex color {input:?}: expected #RRGGBB or #RGB")]
pub struct ParseColorError {
    input: String,
}

impl FromStr for Rgb {
    type Err = ParseColorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseColorError {
            input: s.to_string(),
        };
        let hex = s.trim();
        let hex = hex.strip_prefix('#').unwrap_or(hex);
        if !hex.is_ascii() {
            return Err(err());
        }
        let channel = |digits: &str| u8::from_str_radix(digits, 16).map_err(|_| err());
        match hex.len() {
            6 => Ok(Self::new(
                channel(&hex[0..2])?,
                channel(&hex[2..4])?,
                channel(&hex[4..6])?,
            )),
            3 => {
                // #RGB expands each digit: "A" -> "AA".
                let short = |i: usize| channel(&hex[i..=i]).map(|v| v * 17);
                Ok(Self::new(short(0)?, short(1)?, short(2)?))
            }
            _ => Err(err()),
        }
    }
}

/// A color in CIE L\*a\*b\* (D65).
///
/// - `l`: lightness, 0 (black) to 100 (white)
/// - `a`: green (−) to red (+)
/// - `b`: blue (−) to yellow (+)
///
/// Components are not clamped; intermediate values produced by tone
/// curves or error diffusion may leave the display gamut.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Lab {
    /// Lightness (0–100 for in-gamut colors).
    pub l: f32,
    /// Green–red axis.
    pub a: f32,
    /// Blue–yellow axis.
    pub b: f32,
}

impl Lab {
    /// Create a new L\*a\*b\* color.
    #[must_use]
    pub const fn new(l: f32, a: f32, b: f32) -> Self {
        Self { l, a, b }
    }

    /// Squared CIE76 distance. Use for comparisons to skip the square root.
    #[must_use]
    pub fn distance_squared(self, other: Self) -> f32 {
        let dl = self.l - other.l;
        let da = self.a - other.a;
        let db = self.b - other.b;
        dl.mul_add(dl, da.mul_add(da, db * db))
    }

    /// CIE76 distance: `sqrt(ΔL² + Δa² + Δb²)`.
    #[must_use]
    pub fn distance(self, other: Self) -> f32 {
        self.distance_squared(other).sqrt()
    }

    /// Convert back to an 8-bit display color, rounding and clamping.
    #[must_use]
    pub fn to_rgb(self) -> Rgb {
        to_display(self)
    }
}

impl From<Rgb> for Lab {
    fn from(c: Rgb) -> Self {
        to_perceptual(c)
    }
}

/// sRGB transfer curve: encoded 0–255 channel to linear light 0–1.
fn srgb_to_linear(channel: u8) -> f32 {
    let c = f32::from(channel) / 255.0;
    if c <= 0.040_45 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

/// Inverse sRGB transfer curve: linear light to encoded 0–255, clamped.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn linear_to_srgb(linear: f32) -> u8 {
    let v = linear.clamp(0.0, 1.0);
    let c = if v <= 0.003_130_8 {
        v * 12.92
    } else {
        1.055_f32.mul_add(v.powf(1.0 / 2.4), -0.055)
    };
    (c * 255.0).round().clamp(0.0, 255.0) as u8
}

fn lab_f(t: f32) -> f32 {
    if t > EPSILON {
        t.cbrt()
    } else {
        KAPPA.mul_add(t, 16.0) / 116.0
    }
}

fn lab_f_inv(t: f32) -> f32 {
    let cube = t * t * t;
    if cube > EPSILON {
        cube
    } else {
        116.0_f32.mul_add(t, -16.0) / KAPPA
    }
}

/// Convert a display color to CIE L\*a\*b\*.
#[must_use]
pub fn to_perceptual(color: Rgb) -> Lab {
    let r = srgb_to_linear(color.r);
    let g = srgb_to_linear(color.g);
    let b = srgb_to_linear(color.b);

    let x = 0.180_437_5_f32.mul_add(b, 0.412_456_4_f32.mul_add(r, 0.357_576_1 * g));
    let y = 0.072_175_f32.mul_add(b, 0.212_672_9_f32.mul_add(r, 0.715_152_2 * g));
    let z = 0.950_304_1_f32.mul_add(b, 0.019_333_9_f32.mul_add(r, 0.119_192 * g));

    let fx = lab_f(x / WHITE_X);
    let fy = lab_f(y / WHITE_Y);
    let fz = lab_f(z / WHITE_Z);

    Lab {
        l: 116.0_f32.mul_add(fy, -16.0),
        a: 500.0 * (fx - fy),
        b: 200.0 * (fy - fz),
    }
}

/// Convert a CIE L\*a\*b\* color to the nearest 8-bit display color.
#[must_use]
pub fn to_display(lab: Lab) -> Rgb {
    let fy = (lab.l + 16.0) / 116.0;
    let fx = fy + lab.a / 500.0;
    let fz = fy - lab.b / 200.0;

    let x = lab_f_inv(fx) * WHITE_X;
    let y = lab_f_inv(fy) * WHITE_Y;
    let z = lab_f_inv(fz) * WHITE_Z;

    let r = (-0.498_531_4_f32).mul_add(z, 3.240_454_2_f32.mul_add(x, -1.537_138_5 * y));
    let g = 0.041_556_f32.mul_add(z, (-0.969_266_f32).mul_add(x, 1.876_010_8 * y));
    let b = 1.057_225_2_f32.mul_add(z, 0.055_643_4_f32.mul_add(x, -0.204_025_9 * y));

    Rgb::new(linear_to_srgb(r), linear_to_srgb(g), linear_to_srgb(b))
}

/// CIE76 perceptual distance between two colors.
///
/// Symmetric, zero only for identical inputs, and monotonic in each
/// component's difference.
#[must_use]
pub fn perceptual_distance(a: Lab, b: Lab) -> f32 {
    a.distance(b)
}

//! Capture-side metadata types shared by the session and its collaborators.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Capture (decoded picture) pixel layout negotiated with the consumer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Two planes: full-size Y, interleaved half-height UV.
    #[default]
    Nv12m,
    /// Three planes: full-size Y, quarter-size U and V.
    Yuv420m,
    /// Single-plane compressed tiled layout (body + header blocks).
    Am21c,
}

impl PixelFormat {
    /// Number of memory planes a buffer of this format carries.
    pub fn num_planes(self) -> usize {
        match self {
            Self::Nv12m => 2,
            Self::Yuv420m => 3,
            Self::Am21c => 1,
        }
    }

    /// FourCC-style name, for logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Nv12m => "NM12",
            Self::Yuv420m => "YM12",
            Self::Am21c => "AM21",
        }
    }
}

/// Interlace classification attached to a completed capture buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    /// Progressive frame.
    #[default]
    None,
    /// Both fields interleaved, top field first.
    InterlacedTb,
    /// Both fields interleaved, bottom field first.
    InterlacedBt,
}

/// Unsigned fraction, used for the pixel aspect ratio.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: u32,
    pub den: u32,
}

impl Rational {
    /// Square pixels.
    pub const ONE: Self = Self { num: 1, den: 1 };

    pub fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Reduce the fraction by the greatest common divisor of both terms.
    ///
    /// A zero fraction (both terms zero) is returned unchanged.
    pub fn reduced(self) -> Self {
        let div = gcd(self.num, self.den);
        if div == 0 {
            return self;
        }
        Self {
            num: self.num / div,
            den: self.den / div,
        }
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self::ONE
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.num, self.den)
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rational_reduces_by_gcd() {
        assert_eq!(Rational::new(1080 * 16, 1920 * 9).reduced(), Rational::ONE);
        assert_eq!(Rational::new(480 * 4, 720 * 3).reduced(), Rational::new(8, 9));
        assert_eq!(Rational::new(0, 0).reduced(), Rational::new(0, 0));
    }

    #[test]
    fn plane_counts() {
        assert_eq!(PixelFormat::Nv12m.num_planes(), 2);
        assert_eq!(PixelFormat::Yuv420m.num_planes(), 3);
        assert_eq!(PixelFormat::Am21c.num_planes(), 1);
    }

    #[test]
    fn rational_display() {
        assert_eq!(Rational::new(8, 9).to_string(), "8:9");
    }
}

//! Math utilities and types
//!
//! Provides the host-side vector types used by the clipper and primitive
//! assembly, plus the rounding helpers the setup path relies on.

pub use nalgebra::{Vector2, Vector3, Vector4};

/// 2D vector type
pub type Vec2 = Vector2<f32>;

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D homogeneous vector type
pub type Vec4 = Vector4<f32>;

/// Round to the nearest integer, halfway cases away from zero
#[inline]
pub fn iround(x: f32) -> i32 {
    x.round() as i32
}

/// Clamp `x` into `[lo, hi]`
#[inline]
pub fn clamp(x: f32, lo: f32, hi: f32) -> f32 {
    x.max(lo).min(hi)
}

/// Canonicalize a float for state-key hashing: all NaNs map to one
/// representative and -0.0 maps to +0.0.
#[inline]
pub fn canonical_bits(x: f32) -> u32 {
    if x.is_nan() {
        f32::NAN.to_bits()
    } else if x == 0.0 {
        0
    } else {
        x.to_bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iround_half_away_from_zero() {
        assert_eq!(iround(0.5), 1);
        assert_eq!(iround(-0.5), -1);
        assert_eq!(iround(2.4), 2);
    }

    #[test]
    fn test_canonical_bits_zero_and_nan() {
        assert_eq!(canonical_bits(-0.0), canonical_bits(0.0));
        assert_eq!(canonical_bits(f32::NAN), canonical_bits(-f32::NAN));
        assert_ne!(canonical_bits(1.0), canonical_bits(-1.0));
    }
}

//! The precision axis of the engine.
//!
//! Every kernel and reducer is generic over [`Real`], which is implemented
//! for `f32` and `f64`. The trait carries the two per-precision layout
//! constants (the pattern padding modulus and the auto-scaling exponent
//! threshold) plus the exponent manipulation used by power-of-two
//! rescaling, so the rest of the crate never branches on the concrete
//! float type.

use num_traits::Float;
use std::fmt::Debug;
use std::ops::{AddAssign, DivAssign, MulAssign, SubAssign};

pub trait Real:
    Float
    + AddAssign
    + SubAssign
    + MulAssign
    + DivAssign
    + Default
    + Debug
    + Send
    + Sync
    + 'static
{
    /// Pattern counts are padded up to a multiple of this.
    const PATTERN_MODULUS: usize;

    /// Auto-scaling extracts a power-of-two once the magnitude of a
    /// partial leaves `2^-THRESHOLD ..= 2^THRESHOLD`.
    const SCALING_EXPONENT_THRESHOLD: i32;

    /// Reported in the instance flag word.
    const IS_DOUBLE: bool;

    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;

    /// Unbiased binary exponent of `|self|`; zero input reports 0.
    fn exponent(self) -> i32;

    /// `self * 2^e`, exact, valid for any exponent reachable from a
    /// finite input (the product itself must stay finite).
    fn scalb(self, e: i32) -> Self;
}

impl Real for f64 {
    const PATTERN_MODULUS: usize = 2;
    const SCALING_EXPONENT_THRESHOLD: i32 = 200;
    const IS_DOUBLE: bool = true;

    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    #[inline]
    fn exponent(self) -> i32 {
        if self == 0.0 {
            return 0;
        }
        let biased = ((self.to_bits() >> 52) & 0x7ff) as i32;
        if biased == 0 {
            // subnormal
            -1022
        } else {
            biased - 1023
        }
    }

    #[inline]
    fn scalb(self, e: i32) -> Self {
        // Single multiply when the power of two is itself representable
        // as a normal; otherwise split into two steps.
        if (-1022..=1023).contains(&e) {
            self * f64::from_bits(((e + 1023) as u64) << 52)
        } else {
            let half = e / 2;
            self.scalb(half).scalb(e - half)
        }
    }
}

impl Real for f32 {
    const PATTERN_MODULUS: usize = 4;
    const SCALING_EXPONENT_THRESHOLD: i32 = 20;
    const IS_DOUBLE: bool = false;

    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn exponent(self) -> i32 {
        if self == 0.0 {
            return 0;
        }
        let biased = ((self.to_bits() >> 23) & 0xff) as i32;
        if biased == 0 {
            -126
        } else {
            biased - 127
        }
    }

    #[inline]
    fn scalb(self, e: i32) -> Self {
        if (-126..=127).contains(&e) {
            self * f32::from_bits(((e + 127) as u32) << 23)
        } else {
            let half = e / 2;
            self.scalb(half).scalb(e - half)
        }
    }
}

/// Round a pattern count up to the padding modulus of `R`.
#[inline]
pub fn padded_pattern_count<R: Real>(pattern_count: usize) -> usize {
    pattern_count.div_ceil(R::PATTERN_MODULUS) * R::PATTERN_MODULUS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponent_matches_powers_of_two() {
        assert_eq!(1.0f64.exponent(), 0);
        assert_eq!(2.0f64.exponent(), 1);
        assert_eq!(0.5f64.exponent(), -1);
        assert_eq!(0.75f64.exponent(), -1);
        assert_eq!(3.0f32.exponent(), 1);
        assert_eq!(0.0f64.exponent(), 0);
    }

    #[test]
    fn scalb_round_trips() {
        let x = 1.2345f64;
        assert_eq!(x.scalb(40).scalb(-40), x);
        let y = 0.5f32;
        assert_eq!(y.scalb(10), 512.0);
    }

    #[test]
    fn scalb_large_exponent_splits() {
        // 2^-1040 is subnormal territory for the single-step path
        let x = 1.0f64.scalb(-1040);
        assert!(x > 0.0);
        assert_eq!(x.scalb(1040), 1.0);
    }

    #[test]
    fn padding_modulus() {
        assert_eq!(padded_pattern_count::<f64>(5), 6);
        assert_eq!(padded_pattern_count::<f64>(6), 6);
        assert_eq!(padded_pattern_count::<f32>(5), 8);
        assert_eq!(padded_pattern_count::<f32>(8), 8);
    }
}

//! Rescaling passes run after a peeling kernel.
//!
//! Dynamic rescaling divides each pattern column by its maximum and
//! records the factor (linear or log per the instance flags), optionally
//! folding the log into a cumulative buffer on the fly. Auto rescaling
//! instead extracts a power-of-two exponent into a signed-short buffer
//! once the column magnitude leaves the representable comfort zone.

use crate::buffers::BufferLayout;
use crate::real::Real;
use std::ops::Range;

/// Divide each pattern column of `dest` by its max across categories and
/// states; write the factor to `scale_factors` and add its log into
/// `cumulative` when present. An all-zero column records a factor of one.
///
/// # Safety
/// See the module contract in [`crate::kernels`]; additionally
/// `scale_factors` (and `cumulative` when non-null) point to buffers of
/// `layout.padded_pattern_count` elements whose `patterns` range is
/// exclusively owned by the caller.
pub unsafe fn rescale_partials<R: Real>(
    dest: *mut R,
    scale_factors: *mut R,
    cumulative: Option<*mut R>,
    scalers_log: bool,
    layout: &BufferLayout,
    patterns: Range<usize>,
) {
    let s = layout.state_count;
    for p in patterns {
        let mut max = R::zero();
        for c in 0..layout.category_count {
            let off = layout.partials_offset(c, p);
            for i in 0..s {
                // SAFETY: in-bounds read of the caller's pattern range.
                let v = unsafe { *dest.add(off + i) }.abs();
                if v > max {
                    max = v;
                }
            }
        }
        if max == R::zero() {
            max = R::one();
        }
        for c in 0..layout.category_count {
            let off = layout.partials_offset(c, p);
            for i in 0..s {
                // SAFETY: in-bounds write of the caller's pattern range.
                unsafe {
                    *dest.add(off + i) = *dest.add(off + i) / max;
                }
            }
        }
        let log_max = max.ln();
        // SAFETY: p < padded_pattern_count, exclusive range.
        unsafe {
            *scale_factors.add(p) = if scalers_log { log_max } else { max };
            if let Some(cum) = cumulative {
                *cum.add(p) = *cum.add(p) + log_max;
            }
        }
    }
}

/// Extract a power-of-two exponent per pattern when the column magnitude
/// passes the per-precision threshold; returns whether any pattern was
/// rescaled so the scheduler can mark the buffer active.
///
/// # Safety
/// See the module contract in [`crate::kernels`]; `exponents` points to a
/// buffer of `layout.padded_pattern_count` i16 whose `patterns` range is
/// exclusively owned by the caller.
pub unsafe fn auto_rescale_partials<R: Real>(
    dest: *mut R,
    exponents: *mut i16,
    layout: &BufferLayout,
    patterns: Range<usize>,
) -> bool {
    let s = layout.state_count;
    let mut activated = false;
    for p in patterns {
        let mut max = R::zero();
        for c in 0..layout.category_count {
            let off = layout.partials_offset(c, p);
            for i in 0..s {
                // SAFETY: in-bounds read of the caller's pattern range.
                let v = unsafe { *dest.add(off + i) }.abs();
                if v > max {
                    max = v;
                }
            }
        }
        let exp = max.exponent();
        if exp.abs() > R::SCALING_EXPONENT_THRESHOLD && max > R::zero() {
            for c in 0..layout.category_count {
                let off = layout.partials_offset(c, p);
                for i in 0..s {
                    // SAFETY: in-bounds write of the caller's pattern range.
                    unsafe {
                        *dest.add(off + i) = (*dest.add(off + i)).scalb(-exp);
                    }
                }
            }
            // SAFETY: p < padded_pattern_count, exclusive range.
            unsafe { *exponents.add(p) = exp as i16 };
            activated = true;
        } else {
            // SAFETY: as above.
            unsafe { *exponents.add(p) = 0 };
        }
    }
    activated
}

//! Peeling kernel for two partials children, the workhorse of deep trees.

use crate::buffers::BufferLayout;
use crate::real::Real;
use std::ops::Range;

/// D[c,p,i] = (sum_j M1[c,i,j] P1[c,p,j]) * (sum_j M2[c,i,j] P2[c,p,j]).
///
/// # Safety
/// See the module contract in [`crate::kernels`].
pub unsafe fn partials_partials<R: Real>(
    dest: *mut R,
    partials1: &[R],
    matrices1: &[R],
    partials2: &[R],
    matrices2: &[R],
    layout: &BufferLayout,
    patterns: Range<usize>,
) {
    let s = layout.state_count;
    let stride = layout.matrix_stride;
    for c in 0..layout.category_count {
        let cat = c * layout.category_matrix_len();
        for p in patterns.clone() {
            let off = layout.partials_offset(c, p);
            for i in 0..s {
                let row = cat + i * stride;
                let mut sum1 = R::zero();
                let mut sum2 = R::zero();
                for j in 0..s {
                    sum1 = sum1 + matrices1[row + j] * partials1[off + j];
                    sum2 = sum2 + matrices2[row + j] * partials2[off + j];
                }
                // SAFETY: off + i < layout.partials_len(); exclusive range.
                unsafe {
                    *dest.add(off + i) = sum1 * sum2;
                }
            }
        }
    }
}

/// As [`partials_partials`], divided by a precomputed per-pattern factor.
///
/// # Safety
/// See the module contract in [`crate::kernels`].
#[allow(clippy::too_many_arguments)]
pub unsafe fn partials_partials_fixed_scaling<R: Real>(
    dest: *mut R,
    partials1: &[R],
    matrices1: &[R],
    partials2: &[R],
    matrices2: &[R],
    scale_factors: &[R],
    scalers_log: bool,
    layout: &BufferLayout,
    patterns: Range<usize>,
) {
    let s = layout.state_count;
    let stride = layout.matrix_stride;
    for c in 0..layout.category_count {
        let cat = c * layout.category_matrix_len();
        for p in patterns.clone() {
            let divisor = super::scale_divisor(scale_factors[p], scalers_log);
            let off = layout.partials_offset(c, p);
            for i in 0..s {
                let row = cat + i * stride;
                let mut sum1 = R::zero();
                let mut sum2 = R::zero();
                for j in 0..s {
                    sum1 = sum1 + matrices1[row + j] * partials1[off + j];
                    sum2 = sum2 + matrices2[row + j] * partials2[off + j];
                }
                // SAFETY: off + i < layout.partials_len(); exclusive range.
                unsafe {
                    *dest.add(off + i) = sum1 * sum2 / divisor;
                }
            }
        }
    }
}

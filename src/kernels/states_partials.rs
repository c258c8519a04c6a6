//! Peeling kernel for one compact-state child and one partials child.
//!
//! The scheduler swaps children so the states child always comes first;
//! there is no partials-states twin.

use crate::buffers::BufferLayout;
use crate::real::Real;
use std::ops::Range;

/// D[c,p,i] = M1[c,i,s1(p)] * sum_j M2[c,i,j] * P2[c,p,j].
///
/// # Safety
/// See the module contract in [`crate::kernels`].
pub unsafe fn states_partials<R: Real>(
    dest: *mut R,
    states1: &[i32],
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
            let s1 = states1[p] as usize;
            let off = layout.partials_offset(c, p);
            for i in 0..s {
                let row = cat + i * stride;
                let mut sum = R::zero();
                for j in 0..s {
                    sum = sum + matrices2[row + j] * partials2[off + j];
                }
                // SAFETY: off + i < layout.partials_len(); exclusive range.
                unsafe {
                    *dest.add(off + i) = matrices1[row + s1] * sum;
                }
            }
        }
    }
}

/// As [`states_partials`], divided by a precomputed per-pattern factor.
///
/// # Safety
/// See the module contract in [`crate::kernels`].
#[allow(clippy::too_many_arguments)]
pub unsafe fn states_partials_fixed_scaling<R: Real>(
    dest: *mut R,
    states1: &[i32],
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
            let s1 = states1[p] as usize;
            let off = layout.partials_offset(c, p);
            for i in 0..s {
                let row = cat + i * stride;
                let mut sum = R::zero();
                for j in 0..s {
                    sum = sum + matrices2[row + j] * partials2[off + j];
                }
                // SAFETY: off + i < layout.partials_len(); exclusive range.
                unsafe {
                    *dest.add(off + i) = matrices1[row + s1] * sum / divisor;
                }
            }
        }
    }
}

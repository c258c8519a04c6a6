//! Peeling kernel for two compact-state children.
//!
//! Both children are tip states, so each destination entry is just a
//! product of two matrix-column lookups. The ambiguity state indexes the
//! padding column of each matrix.

use crate::buffers::BufferLayout;
use crate::real::Real;
use std::ops::Range;

/// D[c,p,i] = M1[c,i,s1(p)] * M2[c,i,s2(p)].
///
/// # Safety
/// See the module contract in [`crate::kernels`].
pub unsafe fn states_states<R: Real>(
    dest: *mut R,
    states1: &[i32],
    matrices1: &[R],
    states2: &[i32],
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
            let s2 = states2[p] as usize;
            let off = layout.partials_offset(c, p);
            let mut row = cat;
            for i in 0..s {
                // SAFETY: off + i < layout.partials_len(); exclusive range.
                unsafe {
                    *dest.add(off + i) = matrices1[row + s1] * matrices2[row + s2];
                }
                row += stride;
            }
        }
    }
}

/// As [`states_states`], divided by a precomputed per-pattern factor.
///
/// # Safety
/// See the module contract in [`crate::kernels`].
pub unsafe fn states_states_fixed_scaling<R: Real>(
    dest: *mut R,
    states1: &[i32],
    matrices1: &[R],
    states2: &[i32],
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
            let s2 = states2[p] as usize;
            let off = layout.partials_offset(c, p);
            let mut row = cat;
            for i in 0..s {
                // SAFETY: off + i < layout.partials_len(); exclusive range.
                unsafe {
                    *dest.add(off + i) = matrices1[row + s1] * matrices2[row + s2] / divisor;
                }
                row += stride;
            }
        }
    }
}

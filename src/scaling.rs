//! Scale-factor bookkeeping between peeling and reduction.
//!
//! Individual scale buffers hold the per-pattern rescaling divisors the
//! kernels recorded (linear or log per the instance flags). Cumulative
//! buffers are always log-space: accumulation adds `ln(factor)` for raw
//! buffers and the stored value for log buffers. Reducers later add the
//! cumulative value back onto the raw site log-likelihood.

use crate::buffers::BufferPool;
use crate::error::{EngineError, Result};
use crate::real::Real;
use std::ops::Range;

fn check_distinct(indices: &[usize], cumulative: usize) -> Result<()> {
    if indices.contains(&cumulative) {
        return Err(EngineError::InvalidConfiguration(
            "cumulative scale buffer listed among its own contributions",
        ));
    }
    Ok(())
}

/// Add (log-space) the named buffers into `cumulative`.
pub fn accumulate_scale_factors<R: Real>(
    pool: &BufferPool<R>,
    indices: &[usize],
    cumulative: usize,
    scalers_log: bool,
    patterns: Range<usize>,
) -> Result<()> {
    check_distinct(indices, cumulative)?;
    let cum = pool.scale_base(cumulative)?;
    for &index in indices {
        let factors = pool.scale_factors(index)?;
        for p in patterns.clone() {
            let log_factor = if scalers_log {
                factors[p]
            } else {
                factors[p].ln()
            };
            // SAFETY: cumulative is a distinct buffer of padded_pattern_count
            // elements and the caller holds the only mutable view of it.
            unsafe { *cum.add(p) = *cum.add(p) + log_factor };
        }
    }
    Ok(())
}

/// Subtract (log-space) the named buffers from `cumulative`; the inverse
/// of [`accumulate_scale_factors`].
pub fn remove_scale_factors<R: Real>(
    pool: &BufferPool<R>,
    indices: &[usize],
    cumulative: usize,
    scalers_log: bool,
    patterns: Range<usize>,
) -> Result<()> {
    check_distinct(indices, cumulative)?;
    let cum = pool.scale_base(cumulative)?;
    for &index in indices {
        let factors = pool.scale_factors(index)?;
        for p in patterns.clone() {
            let log_factor = if scalers_log {
                factors[p]
            } else {
                factors[p].ln()
            };
            // SAFETY: as in accumulate_scale_factors.
            unsafe { *cum.add(p) = *cum.add(p) - log_factor };
        }
    }
    Ok(())
}

/// Zero a cumulative buffer (the log-space identity).
pub fn reset_scale_factors<R: Real>(
    pool: &mut BufferPool<R>,
    cumulative: usize,
    patterns: Range<usize>,
) -> Result<()> {
    let buf = pool.scale_factors_mut(cumulative)?;
    for p in patterns {
        buf[p] = R::zero();
    }
    Ok(())
}

/// Duplicate `source` into `destination` over the pattern range.
pub fn copy_scale_factors<R: Real>(
    pool: &BufferPool<R>,
    destination: usize,
    source: usize,
    patterns: Range<usize>,
) -> Result<()> {
    if destination == source {
        return Ok(());
    }
    let src = pool.scale_factors(source)?;
    let dst = pool.scale_base(destination)?;
    for p in patterns {
        // SAFETY: destination is a distinct scale buffer of
        // padded_pattern_count elements.
        unsafe { *dst.add(p) = src[p] };
    }
    Ok(())
}

/// Copy a scale buffer out in double precision, real patterns only.
pub fn get_scale_factors<R: Real>(
    pool: &BufferPool<R>,
    source: usize,
    out: &mut [f64],
) -> Result<()> {
    let layout = *pool.layout();
    if out.len() != layout.pattern_count {
        return Err(EngineError::InvalidDimension {
            what: "scale factor output",
            expected: layout.pattern_count,
            got: out.len(),
        });
    }
    let src = pool.scale_factors(source)?;
    for (p, slot) in out.iter_mut().enumerate() {
        *slot = src[p].to_f64();
    }
    Ok(())
}

//! Root and edge log-likelihood reductions.
//!
//! Reductions are the single place where scaling is folded back in and
//! where numerical underflow becomes observable: a non-finite site
//! likelihood under a non-zero pattern weight is reported as
//! `FloatingPointUnderflow` after the pass completes. Whole-data
//! reductions run on the caller thread; the by-partition variants fan
//! out one task per partition entry when the worker pool is up.

use crate::buffers::{BufferLayout, BufferPool, ChildKind};
use crate::engine::LikelihoodEngine;
use crate::error::{EngineError, Result};
use crate::flags::ScalingMode;
use crate::real::Real;
use std::ops::Range;

const LN_2: f64 = std::f64::consts::LN_2;

/// Child view for edge reductions.
#[derive(Clone, Copy)]
enum EdgeChild<'a, R> {
    Partials(&'a [R]),
    States(&'a [i32]),
}

/// Everything one root reduction entry needs, resolved once against the
/// buffer pool (field-scoped so scratch stays independently borrowable).
struct RootEntry<'a, R: Real> {
    partials: &'a [R],
    weights: &'a [R],
    freqs: &'a [R],
    cumulative: Option<&'a [R]>,
    auto_exponents: Vec<&'a [i16]>,
}

fn active_auto_exponents<R: Real>(pool: &BufferPool<R>) -> Vec<&[i16]> {
    if !pool.auto_scaling_enabled() {
        return Vec::new();
    }
    (0..pool.buffer_count())
        .filter(|&b| pool.auto_scale_active(b))
        .map(|b| pool.auto_scale_exponents(b).unwrap())
        .collect()
}

fn resolve_root_entry<R: Real>(
    pool: &BufferPool<R>,
    buffer: usize,
    weight_index: usize,
    freq_index: usize,
    cumulative: Option<usize>,
) -> Result<RootEntry<'_, R>> {
    Ok(RootEntry {
        partials: pool.partials(buffer)?,
        weights: pool.category_weights(weight_index)?,
        freqs: pool.state_frequencies(freq_index)?,
        cumulative: match cumulative {
            Some(k) => Some(pool.scale_factors(k)?),
            None => None,
        },
        auto_exponents: active_auto_exponents(pool),
    })
}

fn resolve_edge_child<R: Real>(pool: &BufferPool<R>, index: usize) -> Result<EdgeChild<'_, R>> {
    Ok(match pool.child_kind(index)? {
        ChildKind::States => EdgeChild::States(pool.tip_states(index)?),
        ChildKind::Partials => EdgeChild::Partials(pool.partials(index)?),
    })
}

/// Per-site log-scale contributed by a cumulative buffer and the active
/// auto-scale exponents.
#[inline]
fn site_scale<R: Real>(cumulative: Option<&[R]>, auto_exponents: &[&[i16]], p: usize) -> f64 {
    let mut scale = match cumulative {
        Some(cum) => cum[p].to_f64(),
        None => 0.0,
    };
    for exps in auto_exponents {
        scale += exps[p] as f64 * LN_2;
    }
    scale
}

/// Root reduction over one pattern range.
///
/// # Safety
/// `integration` and `site_out` must cover the whole padded pattern
/// range and no other thread may touch `range` of them; all pointers
/// must address live buffers.
#[allow(clippy::too_many_arguments)]
unsafe fn root_reduce_range<R: Real>(
    layout: &BufferLayout,
    entry: &RootEntry<'_, R>,
    pattern_weights: &[f64],
    integration: *mut R,
    site_out: *mut f64,
    range: Range<usize>,
) -> (f64, Option<usize>) {
    let s = layout.state_count;
    let mut sum = 0.0;
    let mut bad = None;
    for p in range {
        let ioff = p * s;
        for i in 0..s {
            // SAFETY: exclusive pattern range of the scratch buffer.
            unsafe { *integration.add(ioff + i) = R::zero() };
        }
        for c in 0..layout.category_count {
            let w = entry.weights[c];
            let off = layout.partials_offset(c, p);
            for i in 0..s {
                // SAFETY: as above.
                unsafe {
                    *integration.add(ioff + i) =
                        *integration.add(ioff + i) + w * entry.partials[off + i];
                }
            }
        }
        let mut total = R::zero();
        for i in 0..s {
            // SAFETY: as above.
            total = total + entry.freqs[i] * unsafe { *integration.add(ioff + i) };
        }
        let ll = total.to_f64().ln() + site_scale(entry.cumulative, &entry.auto_exponents, p);
        // SAFETY: exclusive pattern range of the site vector.
        unsafe { *site_out.add(p) = ll };
        let pw = pattern_weights[p];
        if pw != 0.0 {
            if !ll.is_finite() && bad.is_none() {
                bad = Some(p);
            }
            sum += pw * ll;
        }
    }
    (sum, bad)
}

/// Linear (unlogged) site likelihood of a root entry at one pattern,
/// used by the mixture paths.
fn root_site_value<R: Real>(layout: &BufferLayout, entry: &RootEntry<'_, R>, p: usize) -> f64 {
    let s = layout.state_count;
    let mut value = 0.0;
    for i in 0..s {
        let mut integrated = R::zero();
        for c in 0..layout.category_count {
            let off = layout.partials_offset(c, p);
            integrated = integrated + entry.weights[c] * entry.partials[off + i];
        }
        value += entry.freqs[i].to_f64() * integrated.to_f64();
    }
    value
}

/// Raw mirror of a root entry plus its output slot, for worker tasks.
struct RootTask<R> {
    partials: *const R,
    weights: *const R,
    freqs: *const R,
    cumulative: Option<*const R>,
    auto_exponents: Vec<(*const i16, usize)>,
    pattern_weights: *const f64,
    integration: *mut R,
    site_out: *mut f64,
    range: Range<usize>,
    out: *mut (f64, Option<usize>),
}

// SAFETY: tasks address pool buffers that outlive the join and write
// only their own pattern range and output slot.
unsafe impl<R> Send for RootTask<R> {}

impl<R: Real> RootTask<R> {
    /// # Safety
    /// See [`root_reduce_range`]; additionally the output slot is
    /// exclusive to this task.
    unsafe fn run(self, layout: BufferLayout) {
        let pp = layout.padded_pattern_count;
        // SAFETY: shared reads of live pool buffers.
        let entry = unsafe {
            RootEntry {
                partials: std::slice::from_raw_parts(self.partials, layout.partials_len()),
                weights: std::slice::from_raw_parts(self.weights, layout.category_count),
                freqs: std::slice::from_raw_parts(self.freqs, layout.state_count),
                cumulative: self.cumulative.map(|c| std::slice::from_raw_parts(c, pp)),
                auto_exponents: self
                    .auto_exponents
                    .iter()
                    .map(|&(ptr, len)| std::slice::from_raw_parts(ptr, len))
                    .collect(),
            }
        };
        let pattern_weights = unsafe { std::slice::from_raw_parts(self.pattern_weights, pp) };
        // SAFETY: forwarded task contract.
        let result = unsafe {
            root_reduce_range(
                &layout,
                &entry,
                pattern_weights,
                self.integration,
                self.site_out,
                self.range,
            )
        };
        // SAFETY: exclusive output slot.
        unsafe { *self.out = result };
    }
}

/// Edge reduction over one pattern range, optionally with first and
/// second derivative accumulation.
///
/// # Safety
/// As [`root_reduce_range`], extended to the derivative scratch and
/// site vectors.
#[allow(clippy::too_many_arguments)]
unsafe fn edge_reduce_range<R: Real>(
    layout: &BufferLayout,
    parent: &[R],
    child: EdgeChild<'_, R>,
    matrices: &[R],
    d1_matrices: Option<&[R]>,
    d2_matrices: Option<&[R]>,
    weights: &[R],
    freqs: &[R],
    cumulative: Option<&[R]>,
    auto_exponents: &[&[i16]],
    pattern_weights: &[f64],
    integration: *mut R,
    deriv1: *mut R,
    deriv2: *mut R,
    site_ll: *mut f64,
    site_d1: *mut f64,
    site_d2: *mut f64,
    range: Range<usize>,
) -> (f64, f64, f64, Option<usize>) {
    let s = layout.state_count;
    let stride = layout.matrix_stride;
    let mut sum_ll = 0.0;
    let mut sum_d1 = 0.0;
    let mut sum_d2 = 0.0;
    let mut bad = None;
    for p in range {
        let ioff = p * s;
        for i in 0..s {
            // SAFETY: exclusive pattern range of the scratch buffers.
            unsafe {
                *integration.add(ioff + i) = R::zero();
                if d1_matrices.is_some() {
                    *deriv1.add(ioff + i) = R::zero();
                }
                if d2_matrices.is_some() {
                    *deriv2.add(ioff + i) = R::zero();
                }
            }
        }
        for c in 0..layout.category_count {
            let w = weights[c];
            let cat = c * layout.category_matrix_len();
            let off = layout.partials_offset(c, p);
            for i in 0..s {
                let row = cat + i * stride;
                let contract = |m: &[R]| -> R {
                    match child {
                        EdgeChild::Partials(ch) => {
                            let mut acc = R::zero();
                            for j in 0..s {
                                acc = acc + m[row + j] * ch[off + j];
                            }
                            acc
                        }
                        EdgeChild::States(st) => m[row + st[p] as usize],
                    }
                };
                let weighted_parent = w * parent[off + i];
                // SAFETY: exclusive pattern range of the scratch buffers.
                unsafe {
                    *integration.add(ioff + i) =
                        *integration.add(ioff + i) + weighted_parent * contract(matrices);
                    if let Some(d1) = d1_matrices {
                        *deriv1.add(ioff + i) =
                            *deriv1.add(ioff + i) + weighted_parent * contract(d1);
                    }
                    if let Some(d2) = d2_matrices {
                        *deriv2.add(ioff + i) =
                            *deriv2.add(ioff + i) + weighted_parent * contract(d2);
                    }
                }
            }
        }
        let mut value = 0.0;
        let mut value_d1 = 0.0;
        let mut value_d2 = 0.0;
        for i in 0..s {
            let f = freqs[i].to_f64();
            // SAFETY: as above.
            unsafe {
                value += f * (*integration.add(ioff + i)).to_f64();
                if d1_matrices.is_some() {
                    value_d1 += f * (*deriv1.add(ioff + i)).to_f64();
                }
                if d2_matrices.is_some() {
                    value_d2 += f * (*deriv2.add(ioff + i)).to_f64();
                }
            }
        }
        let ll = value.ln() + site_scale(cumulative, auto_exponents, p);
        // SAFETY: exclusive pattern range of the site vectors.
        unsafe { *site_ll.add(p) = ll };
        let pw = pattern_weights[p];
        if d1_matrices.is_some() {
            let ratio = value_d1 / value;
            // SAFETY: as above.
            unsafe { *site_d1.add(p) = ratio };
            if pw != 0.0 {
                sum_d1 += pw * ratio;
            }
            if d2_matrices.is_some() {
                let second = value_d2 / value - ratio * ratio;
                // SAFETY: as above.
                unsafe { *site_d2.add(p) = second };
                if pw != 0.0 {
                    sum_d2 += pw * second;
                }
            }
        }
        if pw != 0.0 {
            if !ll.is_finite() && bad.is_none() {
                bad = Some(p);
            }
            sum_ll += pw * ll;
        }
    }
    (sum_ll, sum_d1, sum_d2, bad)
}

/// Linear site likelihood of one edge entry at one pattern, for the
/// mixture path.
fn edge_site_value<R: Real>(
    layout: &BufferLayout,
    parent: &[R],
    child: EdgeChild<'_, R>,
    matrices: &[R],
    weights: &[R],
    freqs: &[R],
    p: usize,
) -> f64 {
    let s = layout.state_count;
    let stride = layout.matrix_stride;
    let mut value = 0.0;
    for c in 0..layout.category_count {
        let w = weights[c].to_f64();
        let cat = c * layout.category_matrix_len();
        let off = layout.partials_offset(c, p);
        for i in 0..s {
            let row = cat + i * stride;
            let contracted = match child {
                EdgeChild::Partials(ch) => {
                    let mut acc = R::zero();
                    for j in 0..s {
                        acc = acc + matrices[row + j] * ch[off + j];
                    }
                    acc.to_f64()
                }
                EdgeChild::States(st) => matrices[row + st[p] as usize].to_f64(),
            };
            value += w * freqs[i].to_f64() * parent[off + i].to_f64() * contracted;
        }
    }
    value
}

/// Raw mirror of an edge entry plus its output slot, for worker tasks.
struct EdgeTask<R> {
    parent: *const R,
    child_partials: Option<*const R>,
    child_states: Option<*const i32>,
    matrices: *const R,
    d1_matrices: Option<*const R>,
    d2_matrices: Option<*const R>,
    weights: *const R,
    freqs: *const R,
    cumulative: Option<*const R>,
    auto_exponents: Vec<(*const i16, usize)>,
    pattern_weights: *const f64,
    integration: *mut R,
    deriv1: *mut R,
    deriv2: *mut R,
    site_ll: *mut f64,
    site_d1: *mut f64,
    site_d2: *mut f64,
    range: Range<usize>,
    out: *mut (f64, f64, f64, Option<usize>),
}

// SAFETY: as RootTask.
unsafe impl<R> Send for EdgeTask<R> {}

impl<R: Real> EdgeTask<R> {
    /// # Safety
    /// See [`edge_reduce_range`]; the output slot is exclusive.
    unsafe fn run(self, layout: BufferLayout) {
        let pp = layout.padded_pattern_count;
        // SAFETY: shared reads of live pool buffers.
        let parent = unsafe { std::slice::from_raw_parts(self.parent, layout.partials_len()) };
        let child = if let Some(states) = self.child_states {
            EdgeChild::States(unsafe { std::slice::from_raw_parts(states, pp) })
        } else {
            EdgeChild::Partials(unsafe {
                std::slice::from_raw_parts(self.child_partials.unwrap(), layout.partials_len())
            })
        };
        let matrices = unsafe { std::slice::from_raw_parts(self.matrices, layout.matrix_len()) };
        let d1 = self
            .d1_matrices
            .map(|m| unsafe { std::slice::from_raw_parts(m, layout.matrix_len()) });
        let d2 = self
            .d2_matrices
            .map(|m| unsafe { std::slice::from_raw_parts(m, layout.matrix_len()) });
        let weights = unsafe { std::slice::from_raw_parts(self.weights, layout.category_count) };
        let freqs = unsafe { std::slice::from_raw_parts(self.freqs, layout.state_count) };
        let cumulative = self
            .cumulative
            .map(|c| unsafe { std::slice::from_raw_parts(c, pp) });
        let auto_exponents: Vec<&[i16]> = self
            .auto_exponents
            .iter()
            .map(|&(ptr, len)| unsafe { std::slice::from_raw_parts(ptr, len) })
            .collect();
        let pattern_weights = unsafe { std::slice::from_raw_parts(self.pattern_weights, pp) };
        // SAFETY: forwarded task contract.
        let result = unsafe {
            edge_reduce_range(
                &layout,
                parent,
                child,
                matrices,
                d1,
                d2,
                weights,
                freqs,
                cumulative,
                &auto_exponents,
                pattern_weights,
                self.integration,
                self.deriv1,
                self.deriv2,
                self.site_ll,
                self.site_d1,
                self.site_d2,
                self.range,
            )
        };
        // SAFETY: exclusive output slot.
        unsafe { *self.out = result };
    }
}

impl<R: Real> LikelihoodEngine<R> {
    /// Under always-scaling, fold every per-node buffer into the
    /// trailing cumulative slot and use that.
    fn always_mode_cumulative(&mut self) -> Result<Option<usize>> {
        if self.caps.scaling != ScalingMode::Always {
            return Ok(None);
        }
        let internal = self.pool.scale_buffer_count() - 1;
        let range = 0..self.pool.layout().padded_pattern_count;
        crate::scaling::reset_scale_factors(&mut self.pool, internal, range.clone())?;
        let indices: Vec<usize> = (0..internal).collect();
        crate::scaling::accumulate_scale_factors(
            &self.pool,
            &indices,
            internal,
            self.caps.scalers_log,
            range,
        )?;
        Ok(Some(internal))
    }

    /// Site and sum log-likelihoods at one or more root buffers.
    ///
    /// With a single entry this is the plain root reduction. With
    /// several, the site likelihood marginalises across the entries
    /// (each weighted through its own category weights), stabilised
    /// against the largest per-site scale.
    pub fn calculate_root_log_likelihoods(
        &mut self,
        buffer_indices: &[usize],
        category_weight_indices: &[usize],
        state_frequency_indices: &[usize],
        cumulative_scale_indices: &[Option<usize>],
    ) -> Result<f64> {
        let count = buffer_indices.len();
        if count == 0
            || category_weight_indices.len() != count
            || state_frequency_indices.len() != count
            || cumulative_scale_indices.len() != count
        {
            return Err(EngineError::InvalidDimension {
                what: "root reduction index arrays",
                expected: count.max(1),
                got: category_weight_indices
                    .len()
                    .min(state_frequency_indices.len())
                    .min(cumulative_scale_indices.len()),
            });
        }
        let layout = *self.pool.layout();
        let range = 0..layout.pattern_count;

        if count == 1 {
            let cumulative = match cumulative_scale_indices[0] {
                Some(k) => Some(k),
                None => self.always_mode_cumulative()?,
            };
            let entry = resolve_root_entry(
                &self.pool,
                buffer_indices[0],
                category_weight_indices[0],
                state_frequency_indices[0],
                cumulative,
            )?;
            // SAFETY: serial call; scratch and site vectors are owned by
            // self and no worker is running.
            let (sum, bad) = unsafe {
                root_reduce_range(
                    &layout,
                    &entry,
                    self.pool.pattern_weights(),
                    self.scratch.integration.base_ptr(),
                    self.scratch.site_log_likelihoods.base_ptr(),
                    range,
                )
            };
            self.sum_log_likelihood = sum;
            if let Some(pattern) = bad {
                return Err(EngineError::FloatingPointUnderflow { pattern });
            }
            return Ok(sum);
        }

        // mixture of root buffers
        if self.caps.scaling == ScalingMode::Auto {
            return Err(EngineError::InvalidConfiguration(
                "multi-buffer root reduction is unavailable under auto scaling",
            ));
        }
        for n in 0..count {
            let entry = resolve_root_entry(
                &self.pool,
                buffer_indices[n],
                category_weight_indices[n],
                state_frequency_indices[n],
                cumulative_scale_indices[n],
            )?;
            for p in range.clone() {
                let value = root_site_value(&layout, &entry, p);
                let scale = site_scale(entry.cumulative, &entry.auto_exponents, p);
                if n == 0 {
                    self.scratch.mix_value[p] = value;
                    self.scratch.mix_scale[p] = scale;
                } else {
                    if scale > self.scratch.mix_scale[p] {
                        self.scratch.mix_value[p] *= (self.scratch.mix_scale[p] - scale).exp();
                        self.scratch.mix_scale[p] = scale;
                    }
                    self.scratch.mix_value[p] += value * (scale - self.scratch.mix_scale[p]).exp();
                }
            }
        }
        let mut sum = 0.0;
        let mut bad = None;
        let site_out = self.scratch.site_log_likelihoods.as_mut_slice();
        for p in range {
            let ll = self.scratch.mix_value[p].ln() + self.scratch.mix_scale[p];
            site_out[p] = ll;
            let pw = self.pool.pattern_weights()[p];
            if pw != 0.0 {
                if !ll.is_finite() && bad.is_none() {
                    bad = Some(p);
                }
                sum += pw * ll;
            }
        }
        self.sum_log_likelihood = sum;
        if let Some(pattern) = bad {
            return Err(EngineError::FloatingPointUnderflow { pattern });
        }
        Ok(sum)
    }

    /// Per-partition root reduction; fills `out_sum_by_partition` and
    /// returns the overall sum.
    pub fn calculate_root_log_likelihoods_by_partition(
        &mut self,
        buffer_indices: &[usize],
        category_weight_indices: &[usize],
        state_frequency_indices: &[usize],
        cumulative_scale_indices: &[Option<usize>],
        partition_indices: &[usize],
        out_sum_by_partition: &mut [f64],
    ) -> Result<f64> {
        let count = partition_indices.len();
        if buffer_indices.len() != count
            || category_weight_indices.len() != count
            || state_frequency_indices.len() != count
            || cumulative_scale_indices.len() != count
            || out_sum_by_partition.len() != count
        {
            return Err(EngineError::InvalidDimension {
                what: "partitioned root reduction arrays",
                expected: count,
                got: buffer_indices.len(),
            });
        }
        let layout = *self.pool.layout();
        let mut results: Vec<(f64, Option<usize>)> = vec![(0.0, None); count];

        let mut distinct = partition_indices.to_vec();
        distinct.sort_unstable();
        distinct.dedup();
        let parallel = self.workers.is_some() && distinct.len() == count && count > 1;

        if parallel {
            let mut tasks = Vec::with_capacity(count);
            for n in 0..count {
                tasks.push(self.root_task(
                    buffer_indices[n],
                    category_weight_indices[n],
                    state_frequency_indices[n],
                    cumulative_scale_indices[n],
                    partition_indices[n],
                    &mut results[n] as *mut (f64, Option<usize>),
                )?);
            }
            let pool = self.workers.as_ref().unwrap();
            let workers = pool.worker_count();
            let mut handles = Vec::with_capacity(count);
            for (n, task) in tasks.into_iter().enumerate() {
                handles.push(pool.submit(n % workers, move || {
                    // SAFETY: partition entries are distinct, so scratch
                    // ranges and output slots are disjoint; buffers
                    // outlive the join below.
                    unsafe { task.run(layout) };
                }));
            }
            for handle in handles {
                handle.wait();
            }
        } else {
            for n in 0..count {
                let prange = self.partition_range_for(partition_indices[n])?;
                let entry = resolve_root_entry(
                    &self.pool,
                    buffer_indices[n],
                    category_weight_indices[n],
                    state_frequency_indices[n],
                    cumulative_scale_indices[n],
                )?;
                // SAFETY: serial call over a private pattern range.
                results[n] = unsafe {
                    root_reduce_range(
                        &layout,
                        &entry,
                        self.pool.pattern_weights(),
                        self.scratch.integration.base_ptr(),
                        self.scratch.site_log_likelihoods.base_ptr(),
                        prange,
                    )
                };
            }
        }

        let mut total = 0.0;
        let mut bad = None;
        for (n, (sum, first_bad)) in results.iter().enumerate() {
            out_sum_by_partition[n] = *sum;
            total += *sum;
            if bad.is_none() {
                bad = *first_bad;
            }
        }
        self.sum_log_likelihood = total;
        if let Some(pattern) = bad {
            return Err(EngineError::FloatingPointUnderflow { pattern });
        }
        Ok(total)
    }

    fn partition_range_for(&self, partition: usize) -> Result<Range<usize>> {
        self.partitions
            .as_ref()
            .ok_or(EngineError::InvalidConfiguration(
                "no pattern partitions defined",
            ))?
            .range(partition)
    }

    fn root_task(
        &self,
        buffer: usize,
        weight_index: usize,
        freq_index: usize,
        cumulative: Option<usize>,
        partition: usize,
        out: *mut (f64, Option<usize>),
    ) -> Result<RootTask<R>> {
        let entry =
            resolve_root_entry(&self.pool, buffer, weight_index, freq_index, cumulative)?;
        let range = self.partition_range_for(partition)?;
        Ok(RootTask {
            partials: entry.partials.as_ptr(),
            weights: entry.weights.as_ptr(),
            freqs: entry.freqs.as_ptr(),
            cumulative: entry.cumulative.map(|c| c.as_ptr()),
            auto_exponents: entry
                .auto_exponents
                .iter()
                .map(|e| (e.as_ptr(), e.len()))
                .collect(),
            pattern_weights: self.pool.pattern_weights().as_ptr(),
            integration: self.scratch.integration.base_ptr(),
            site_out: self.scratch.site_log_likelihoods.base_ptr(),
            range,
            out,
        })
    }

    /// Edge reduction: log-likelihood (and optionally first and second
    /// derivatives with respect to the edge length) for parent/child
    /// buffer pairs joined by a transition matrix.
    ///
    /// A single entry supports derivatives; multiple entries combine as
    /// a mixture (like the multi-buffer root reduction) and must not
    /// request derivatives.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate_edge_log_likelihoods(
        &mut self,
        parent_indices: &[usize],
        child_indices: &[usize],
        probability_indices: &[usize],
        first_derivative_indices: Option<&[usize]>,
        second_derivative_indices: Option<&[usize]>,
        category_weight_indices: &[usize],
        state_frequency_indices: &[usize],
        cumulative_scale_indices: &[Option<usize>],
    ) -> Result<f64> {
        let count = parent_indices.len();
        if count == 0
            || child_indices.len() != count
            || probability_indices.len() != count
            || category_weight_indices.len() != count
            || state_frequency_indices.len() != count
            || cumulative_scale_indices.len() != count
        {
            return Err(EngineError::InvalidDimension {
                what: "edge reduction index arrays",
                expected: count.max(1),
                got: child_indices.len().min(probability_indices.len()),
            });
        }
        if second_derivative_indices.is_some() && first_derivative_indices.is_none() {
            return Err(EngineError::InvalidConfiguration(
                "second derivatives require first derivatives",
            ));
        }
        let layout = *self.pool.layout();
        let range = 0..layout.pattern_count;

        if count == 1 {
            let cumulative_index = match cumulative_scale_indices[0] {
                Some(k) => Some(k),
                None => self.always_mode_cumulative()?,
            };
            let parent = self.pool.partials(parent_indices[0])?;
            let child = resolve_edge_child(&self.pool, child_indices[0])?;
            let matrices = self.pool.matrix(probability_indices[0])?;
            let d1 = match first_derivative_indices {
                Some(idx) => Some(self.pool.matrix(idx[0])?),
                None => None,
            };
            let d2 = match second_derivative_indices {
                Some(idx) => Some(self.pool.matrix(idx[0])?),
                None => None,
            };
            let weights = self.pool.category_weights(category_weight_indices[0])?;
            let freqs = self.pool.state_frequencies(state_frequency_indices[0])?;
            let cumulative = match cumulative_index {
                Some(k) => Some(self.pool.scale_factors(k)?),
                None => None,
            };
            let auto_exponents = active_auto_exponents(&self.pool);
            // SAFETY: serial call; scratch and site vectors owned by
            // self and no worker is running.
            let (sum_ll, sum_d1, sum_d2, bad) = unsafe {
                edge_reduce_range(
                    &layout,
                    parent,
                    child,
                    matrices,
                    d1,
                    d2,
                    weights,
                    freqs,
                    cumulative,
                    &auto_exponents,
                    self.pool.pattern_weights(),
                    self.scratch.integration.base_ptr(),
                    self.scratch.deriv1.base_ptr(),
                    self.scratch.deriv2.base_ptr(),
                    self.scratch.site_log_likelihoods.base_ptr(),
                    self.scratch.site_d1.base_ptr(),
                    self.scratch.site_d2.base_ptr(),
                    range,
                )
            };
            self.sum_log_likelihood = sum_ll;
            if first_derivative_indices.is_some() {
                self.sum_first_derivative = sum_d1;
                self.sum_second_derivative = if second_derivative_indices.is_some() {
                    sum_d2
                } else {
                    f64::NAN
                };
            }
            if let Some(pattern) = bad {
                return Err(EngineError::FloatingPointUnderflow { pattern });
            }
            return Ok(sum_ll);
        }

        if first_derivative_indices.is_some() {
            return Err(EngineError::InvalidConfiguration(
                "derivatives are unavailable for multi-entry edge reductions",
            ));
        }
        if self.caps.scaling == ScalingMode::Auto {
            return Err(EngineError::InvalidConfiguration(
                "multi-entry edge reduction is unavailable under auto scaling",
            ));
        }
        for n in 0..count {
            let parent = self.pool.partials(parent_indices[n])?;
            let child = resolve_edge_child(&self.pool, child_indices[n])?;
            let matrices = self.pool.matrix(probability_indices[n])?;
            let weights = self.pool.category_weights(category_weight_indices[n])?;
            let freqs = self.pool.state_frequencies(state_frequency_indices[n])?;
            let cumulative = match cumulative_scale_indices[n] {
                Some(k) => Some(self.pool.scale_factors(k)?),
                None => None,
            };
            for p in range.clone() {
                let value = edge_site_value(&layout, parent, child, matrices, weights, freqs, p);
                let scale = site_scale::<R>(cumulative, &[], p);
                if n == 0 {
                    self.scratch.mix_value[p] = value;
                    self.scratch.mix_scale[p] = scale;
                } else {
                    if scale > self.scratch.mix_scale[p] {
                        self.scratch.mix_value[p] *= (self.scratch.mix_scale[p] - scale).exp();
                        self.scratch.mix_scale[p] = scale;
                    }
                    self.scratch.mix_value[p] += value * (scale - self.scratch.mix_scale[p]).exp();
                }
            }
        }
        let mut sum = 0.0;
        let mut bad = None;
        let site_out = self.scratch.site_log_likelihoods.as_mut_slice();
        for p in range {
            let ll = self.scratch.mix_value[p].ln() + self.scratch.mix_scale[p];
            site_out[p] = ll;
            let pw = self.pool.pattern_weights()[p];
            if pw != 0.0 {
                if !ll.is_finite() && bad.is_none() {
                    bad = Some(p);
                }
                sum += pw * ll;
            }
        }
        self.sum_log_likelihood = sum;
        if let Some(pattern) = bad {
            return Err(EngineError::FloatingPointUnderflow { pattern });
        }
        Ok(sum)
    }

    /// Per-partition edge reduction; optional derivative sums per
    /// partition.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate_edge_log_likelihoods_by_partition(
        &mut self,
        parent_indices: &[usize],
        child_indices: &[usize],
        probability_indices: &[usize],
        first_derivative_indices: Option<&[usize]>,
        second_derivative_indices: Option<&[usize]>,
        category_weight_indices: &[usize],
        state_frequency_indices: &[usize],
        cumulative_scale_indices: &[Option<usize>],
        partition_indices: &[usize],
        out_sum_by_partition: &mut [f64],
        mut out_first_by_partition: Option<&mut [f64]>,
        mut out_second_by_partition: Option<&mut [f64]>,
    ) -> Result<f64> {
        let count = partition_indices.len();
        if parent_indices.len() != count
            || child_indices.len() != count
            || probability_indices.len() != count
            || category_weight_indices.len() != count
            || state_frequency_indices.len() != count
            || cumulative_scale_indices.len() != count
            || out_sum_by_partition.len() != count
        {
            return Err(EngineError::InvalidDimension {
                what: "partitioned edge reduction arrays",
                expected: count,
                got: parent_indices.len(),
            });
        }
        if second_derivative_indices.is_some() && first_derivative_indices.is_none() {
            return Err(EngineError::InvalidConfiguration(
                "second derivatives require first derivatives",
            ));
        }
        let layout = *self.pool.layout();
        let mut results: Vec<(f64, f64, f64, Option<usize>)> = vec![(0.0, 0.0, 0.0, None); count];

        let mut distinct = partition_indices.to_vec();
        distinct.sort_unstable();
        distinct.dedup();
        let parallel = self.workers.is_some() && distinct.len() == count && count > 1;

        if parallel {
            let mut tasks = Vec::with_capacity(count);
            for n in 0..count {
                tasks.push(self.edge_task(
                    parent_indices[n],
                    child_indices[n],
                    probability_indices[n],
                    first_derivative_indices.map(|d| d[n]),
                    second_derivative_indices.map(|d| d[n]),
                    category_weight_indices[n],
                    state_frequency_indices[n],
                    cumulative_scale_indices[n],
                    partition_indices[n],
                    &mut results[n] as *mut (f64, f64, f64, Option<usize>),
                )?);
            }
            let pool = self.workers.as_ref().unwrap();
            let workers = pool.worker_count();
            let mut handles = Vec::with_capacity(count);
            for (n, task) in tasks.into_iter().enumerate() {
                handles.push(pool.submit(n % workers, move || {
                    // SAFETY: distinct partitions, disjoint scratch ranges
                    // and output slots; buffers outlive the join.
                    unsafe { task.run(layout) };
                }));
            }
            for handle in handles {
                handle.wait();
            }
        } else {
            for n in 0..count {
                let prange = self.partition_range_for(partition_indices[n])?;
                let parent = self.pool.partials(parent_indices[n])?;
                let child = resolve_edge_child(&self.pool, child_indices[n])?;
                let matrices = self.pool.matrix(probability_indices[n])?;
                let d1 = match first_derivative_indices {
                    Some(idx) => Some(self.pool.matrix(idx[n])?),
                    None => None,
                };
                let d2 = match second_derivative_indices {
                    Some(idx) => Some(self.pool.matrix(idx[n])?),
                    None => None,
                };
                let weights = self.pool.category_weights(category_weight_indices[n])?;
                let freqs = self.pool.state_frequencies(state_frequency_indices[n])?;
                let cumulative = match cumulative_scale_indices[n] {
                    Some(k) => Some(self.pool.scale_factors(k)?),
                    None => None,
                };
                let auto_exponents = active_auto_exponents(&self.pool);
                // SAFETY: serial call over a private pattern range.
                results[n] = unsafe {
                    edge_reduce_range(
                        &layout,
                        parent,
                        child,
                        matrices,
                        d1,
                        d2,
                        weights,
                        freqs,
                        cumulative,
                        &auto_exponents,
                        self.pool.pattern_weights(),
                        self.scratch.integration.base_ptr(),
                        self.scratch.deriv1.base_ptr(),
                        self.scratch.deriv2.base_ptr(),
                        self.scratch.site_log_likelihoods.base_ptr(),
                        self.scratch.site_d1.base_ptr(),
                        self.scratch.site_d2.base_ptr(),
                        prange,
                    )
                };
            }
        }

        let mut total = 0.0;
        let mut total_d1 = 0.0;
        let mut total_d2 = 0.0;
        let mut bad = None;
        for (n, (sum, d1, d2, first_bad)) in results.iter().enumerate() {
            out_sum_by_partition[n] = *sum;
            if let Some(out) = out_first_by_partition.as_deref_mut() {
                out[n] = *d1;
            }
            if let Some(out) = out_second_by_partition.as_deref_mut() {
                out[n] = *d2;
            }
            total += *sum;
            total_d1 += *d1;
            total_d2 += *d2;
            if bad.is_none() {
                bad = *first_bad;
            }
        }
        self.sum_log_likelihood = total;
        if first_derivative_indices.is_some() {
            self.sum_first_derivative = total_d1;
            self.sum_second_derivative = if second_derivative_indices.is_some() {
                total_d2
            } else {
                f64::NAN
            };
        }
        if let Some(pattern) = bad {
            return Err(EngineError::FloatingPointUnderflow { pattern });
        }
        Ok(total)
    }

    #[allow(clippy::too_many_arguments)]
    fn edge_task(
        &self,
        parent: usize,
        child: usize,
        probability: usize,
        d1: Option<usize>,
        d2: Option<usize>,
        weight_index: usize,
        freq_index: usize,
        cumulative: Option<usize>,
        partition: usize,
        out: *mut (f64, f64, f64, Option<usize>),
    ) -> Result<EdgeTask<R>> {
        let range = self.partition_range_for(partition)?;
        let (child_partials, child_states) = match self.pool.child_kind(child)? {
            ChildKind::States => (None, Some(self.pool.tip_states(child)?.as_ptr())),
            ChildKind::Partials => (Some(self.pool.partials(child)?.as_ptr()), None),
        };
        Ok(EdgeTask {
            parent: self.pool.partials(parent)?.as_ptr(),
            child_partials,
            child_states,
            matrices: self.pool.matrix(probability)?.as_ptr(),
            d1_matrices: match d1 {
                Some(i) => Some(self.pool.matrix(i)?.as_ptr()),
                None => None,
            },
            d2_matrices: match d2 {
                Some(i) => Some(self.pool.matrix(i)?.as_ptr()),
                None => None,
            },
            weights: self.pool.category_weights(weight_index)?.as_ptr(),
            freqs: self.pool.state_frequencies(freq_index)?.as_ptr(),
            cumulative: match cumulative {
                Some(k) => Some(self.pool.scale_factors(k)?.as_ptr()),
                None => None,
            },
            auto_exponents: active_auto_exponents(&self.pool)
                .iter()
                .map(|e| (e.as_ptr(), e.len()))
                .collect(),
            pattern_weights: self.pool.pattern_weights().as_ptr(),
            integration: self.scratch.integration.base_ptr(),
            deriv1: self.scratch.deriv1.base_ptr(),
            deriv2: self.scratch.deriv2.base_ptr(),
            site_ll: self.scratch.site_log_likelihoods.base_ptr(),
            site_d1: self.scratch.site_d1.base_ptr(),
            site_d2: self.scratch.site_d2.base_ptr(),
            range,
            out,
        })
    }
}

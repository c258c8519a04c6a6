//! The engine instance: dimensions, capabilities, storage, and the
//! public setter/getter surface. The compute paths live in
//! `scheduler.rs` (peeling) and `reducers.rs` (log-likelihoods).

use crate::buffers::{AlignedBuffer, BufferLayout, BufferPool};
use crate::eigen::{self, EigenStore};
use crate::error::{EngineError, Result};
use crate::flags::{Capabilities, ScalingMode};
use crate::partition::PartitionSet;
use crate::pool::WorkerPool;
use crate::real::Real;

// Threading activation thresholds. Auto-slicing is only worth it once a
// problem carries enough patterns per worker.
pub(crate) const ASYNC_HW_THREAD_COUNT_THRESHOLD: usize = 16;
pub(crate) const ASYNC_MIN_PATTERN_COUNT_LOW: usize = 256;
pub(crate) const ASYNC_MIN_PATTERN_COUNT_HIGH: usize = 768;
pub(crate) const ASYNC_LIMIT_PATTERN_COUNT: usize = 262_144;
pub(crate) const MIN_PATTERNS_PER_WORKER: usize = 256;

/// Instance dimensions, fixed at creation.
#[derive(Debug, Clone, Copy)]
pub struct EngineDims {
    /// Tips 0..tip_count-1 carry observations (states or partials).
    pub tip_count: usize,
    /// Total partials slots, tips included.
    pub partials_buffer_count: usize,
    /// How many of the tips will use compact integer states.
    pub compact_buffer_count: usize,
    pub state_count: usize,
    pub pattern_count: usize,
    pub eigen_count: usize,
    pub matrix_count: usize,
    pub category_count: usize,
    pub scale_buffer_count: usize,
}

impl EngineDims {
    fn validate(&self) -> Result<()> {
        if self.state_count < 2 {
            return Err(EngineError::InvalidConfiguration(
                "state count must be at least two",
            ));
        }
        if self.pattern_count == 0 || self.category_count == 0 {
            return Err(EngineError::InvalidConfiguration(
                "pattern and category counts must be positive",
            ));
        }
        if self.partials_buffer_count < self.tip_count {
            return Err(EngineError::InvalidConfiguration(
                "partials buffer count must cover the tips",
            ));
        }
        if self.compact_buffer_count > self.tip_count {
            return Err(EngineError::InvalidConfiguration(
                "compact buffer count exceeds tip count",
            ));
        }
        Ok(())
    }
}

/// What the instance reports about itself.
#[derive(Debug, Clone)]
pub struct InstanceDetails {
    pub name: &'static str,
    pub flags: u64,
    pub thread_count: usize,
    pub padded_pattern_count: usize,
}

/// Per-instance temporaries used by the reducers; allocated once,
/// pattern-sliced disjointly under threaded reduction.
#[derive(Debug)]
pub(crate) struct ReduceScratch<R: Real> {
    /// Category-integrated partials, `P' * S`.
    pub integration: AlignedBuffer<R>,
    pub deriv1: AlignedBuffer<R>,
    pub deriv2: AlignedBuffer<R>,
    pub site_log_likelihoods: AlignedBuffer<f64>,
    pub site_d1: AlignedBuffer<f64>,
    pub site_d2: AlignedBuffer<f64>,
    /// Running linear likelihood and its log-scale, for multi-buffer
    /// reductions.
    pub mix_value: Vec<f64>,
    pub mix_scale: Vec<f64>,
}

impl<R: Real> ReduceScratch<R> {
    fn allocate(layout: &BufferLayout) -> Result<Self> {
        let pp = layout.padded_pattern_count;
        Ok(ReduceScratch {
            integration: AlignedBuffer::zeroed(pp * layout.state_count)?,
            deriv1: AlignedBuffer::zeroed(pp * layout.state_count)?,
            deriv2: AlignedBuffer::zeroed(pp * layout.state_count)?,
            site_log_likelihoods: AlignedBuffer::zeroed(pp)?,
            site_d1: AlignedBuffer::zeroed(pp)?,
            site_d2: AlignedBuffer::zeroed(pp)?,
            mix_value: vec![0.0; pp],
            mix_scale: vec![0.0; pp],
        })
    }
}

/// The CPU likelihood engine.
///
/// All user-facing calls run on the client thread; threaded execution
/// fans out internally and joins before returning.
#[derive(Debug)]
pub struct LikelihoodEngine<R: Real = f64> {
    pub(crate) dims: EngineDims,
    pub(crate) caps: Capabilities,
    pub(crate) pool: BufferPool<R>,
    pub(crate) eigens: EigenStore,
    pub(crate) partitions: Option<PartitionSet>,
    pub(crate) workers: Option<WorkerPool>,
    /// Worker count for pattern-sliced peeling; 0 means serial.
    pub(crate) auto_slice_workers: usize,
    pub(crate) scratch: ReduceScratch<R>,
    pub(crate) sum_log_likelihood: f64,
    pub(crate) sum_first_derivative: f64,
    pub(crate) sum_second_derivative: f64,
}

impl<R: Real> LikelihoodEngine<R> {
    /// Create an instance. Everything the hot paths touch is allocated
    /// here; creation failure leaves nothing behind.
    pub fn new(dims: EngineDims, preference_flags: u64, requirement_flags: u64) -> Result<Self> {
        let caps = Capabilities::parse::<R>(preference_flags, requirement_flags)?;
        dims.validate()?;
        let layout = BufferLayout::new::<R>(dims.state_count, dims.pattern_count, dims.category_count);

        let internal_count = dims.partials_buffer_count - dims.tip_count;
        let scale_count = match caps.scaling {
            // one slot per internal node plus a trailing cumulative slot
            ScalingMode::Always => internal_count + 1,
            ScalingMode::Auto => 0,
            _ => dims.scale_buffer_count,
        };
        let mut pool = BufferPool::allocate(
            layout,
            dims.partials_buffer_count,
            dims.tip_count,
            dims.matrix_count,
            scale_count,
            caps.scaling == ScalingMode::Auto,
            dims.eigen_count.max(1),
        )?;
        // every pattern counts once until the client says otherwise
        pool.set_pattern_weights(&vec![1.0; dims.pattern_count])?;
        if caps.scaling == ScalingMode::Always && !caps.scalers_log {
            // raw scale buffers start at the multiplicative identity so
            // never-written node slots accumulate as log(1) = 0
            for k in 0..pool.scale_buffer_count() {
                for v in pool.scale_factors_mut(k)? {
                    *v = num_traits::One::one();
                }
            }
        }

        let eigens = EigenStore::new(
            dims.state_count,
            dims.eigen_count.max(1),
            caps.complex_eigen,
        );
        let scratch = ReduceScratch::allocate(&layout)?;

        log::info!(
            "likelihood engine: {} states, {} patterns ({} padded), {} categories, {} buffers, scaling {:?}",
            dims.state_count,
            dims.pattern_count,
            layout.padded_pattern_count,
            dims.category_count,
            dims.partials_buffer_count,
            caps.scaling,
        );

        Ok(LikelihoodEngine {
            dims,
            caps,
            pool,
            eigens,
            partitions: None,
            workers: None,
            auto_slice_workers: 0,
            scratch,
            sum_log_likelihood: f64::NAN,
            sum_first_derivative: f64::NAN,
            sum_second_derivative: f64::NAN,
        })
    }

    /// (Re)build the worker pool. The auto-slicing heuristic follows
    /// fixed thresholds: small problems stay serial, and the worker
    /// count is capped so each worker owns a reasonable pattern span.
    pub fn set_thread_count(&mut self, thread_count: usize) -> Result<()> {
        self.workers = None;
        self.auto_slice_workers = 0;
        if thread_count <= 1 || !self.caps.threading {
            if thread_count > 1 {
                log::debug!("threading not enabled for this instance; staying serial");
            }
            return Ok(());
        }
        let patterns = self.dims.pattern_count;
        let hw_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let min_patterns = if hw_threads >= ASYNC_HW_THREAD_COUNT_THRESHOLD {
            ASYNC_MIN_PATTERN_COUNT_LOW
        } else {
            ASYNC_MIN_PATTERN_COUNT_HIGH
        };
        let capped = if patterns >= ASYNC_LIMIT_PATTERN_COUNT {
            thread_count
        } else {
            thread_count.min((patterns / MIN_PATTERNS_PER_WORKER).max(1))
        };
        self.auto_slice_workers = if patterns >= min_patterns && capped > 1 {
            capped
        } else {
            0
        };
        self.workers = Some(WorkerPool::new(thread_count)?);
        log::debug!(
            "thread count {thread_count}: auto-slice workers = {}",
            self.auto_slice_workers
        );
        Ok(())
    }

    // ----- setters -----

    pub fn set_tip_states(&mut self, tip_index: usize, states: &[i32]) -> Result<()> {
        self.pool.set_tip_states(tip_index, states)
    }

    pub fn set_tip_partials(&mut self, tip_index: usize, partials: &[f64]) -> Result<()> {
        self.pool.set_tip_partials(tip_index, partials)
    }

    pub fn set_partials(&mut self, buffer_index: usize, partials: &[f64]) -> Result<()> {
        self.pool.set_partials(buffer_index, partials)
    }

    /// Copy a partials buffer out, optionally multiplying a scale buffer
    /// back in.
    pub fn get_partials(
        &self,
        buffer_index: usize,
        scale_index: Option<usize>,
        out: &mut [f64],
    ) -> Result<()> {
        self.pool
            .get_partials(buffer_index, scale_index, self.caps.scalers_log, out)
    }

    pub fn set_eigen_decomposition(
        &mut self,
        eigen_index: usize,
        vectors: &[f64],
        inverse: &[f64],
        values: &[f64],
    ) -> Result<()> {
        self.eigens.set(eigen_index, vectors, inverse, values)
    }

    pub fn set_state_frequencies(&mut self, index: usize, frequencies: &[f64]) -> Result<()> {
        self.pool.set_state_frequencies(index, frequencies)
    }

    pub fn set_category_weights(&mut self, index: usize, weights: &[f64]) -> Result<()> {
        self.pool.set_category_weights(index, weights)
    }

    pub fn set_category_rates(&mut self, rates: &[f64]) -> Result<()> {
        self.pool.set_category_rates(0, rates)
    }

    pub fn set_category_rates_with_index(&mut self, index: usize, rates: &[f64]) -> Result<()> {
        self.pool.set_category_rates(index, rates)
    }

    pub fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<()> {
        self.pool.set_pattern_weights(weights)
    }

    /// Define pattern partitions. Interleaved ids trigger the stable
    /// reordering pass over every per-pattern array set so far; site
    /// vectors keep coming back in the client's original order.
    pub fn set_pattern_partitions(&mut self, partition_count: usize, ids: &[i32]) -> Result<()> {
        let (set, perm) = PartitionSet::build(self.pool.layout(), partition_count, ids)?;
        if let Some(perm) = perm {
            self.pool.permute_patterns(&perm)?;
            log::debug!("patterns reordered to make {partition_count} partitions contiguous");
        }
        self.partitions = Some(set);
        Ok(())
    }

    pub fn set_transition_matrix(
        &mut self,
        matrix_index: usize,
        matrix: &[f64],
        padded_value: f64,
    ) -> Result<()> {
        self.pool.set_transition_matrix(matrix_index, matrix, padded_value)
    }

    /// Bulk form of [`Self::set_transition_matrix`].
    pub fn set_transition_matrices(
        &mut self,
        matrix_indices: &[usize],
        matrices: &[f64],
        padded_values: &[f64],
    ) -> Result<()> {
        let layout = *self.pool.layout();
        let one = layout.category_count * layout.state_count * layout.state_count;
        if matrices.len() != one * matrix_indices.len() {
            return Err(EngineError::InvalidDimension {
                what: "transition matrices",
                expected: one * matrix_indices.len(),
                got: matrices.len(),
            });
        }
        if padded_values.len() != matrix_indices.len() {
            return Err(EngineError::InvalidDimension {
                what: "padded values",
                expected: matrix_indices.len(),
                got: padded_values.len(),
            });
        }
        for (n, &index) in matrix_indices.iter().enumerate() {
            self.pool
                .set_transition_matrix(index, &matrices[n * one..(n + 1) * one], padded_values[n])?;
        }
        Ok(())
    }

    pub fn get_transition_matrix(&self, matrix_index: usize, out: &mut [f64]) -> Result<()> {
        self.pool.get_transition_matrix(matrix_index, out)
    }

    // ----- transition-matrix updates -----

    /// Exponentiate the eigen decomposition along each edge into the
    /// named probability (and optionally derivative) matrix buffers.
    pub fn update_transition_matrices(
        &mut self,
        eigen_index: usize,
        probability_indices: &[usize],
        first_derivative_indices: Option<&[usize]>,
        second_derivative_indices: Option<&[usize]>,
        edge_lengths: &[f64],
    ) -> Result<()> {
        let rates = self.pool.category_rates(0)?.to_vec();
        eigen::update_transition_matrices(
            &self.eigens,
            &mut self.pool,
            eigen_index,
            &rates,
            probability_indices,
            first_derivative_indices,
            second_derivative_indices,
            edge_lengths,
            self.workers.is_some(),
        )
    }

    /// Multi-model variant: each edge selects its own eigen slot and
    /// category-rate vector.
    #[allow(clippy::too_many_arguments)]
    pub fn update_transition_matrices_with_multiple_models(
        &mut self,
        eigen_indices: &[usize],
        category_rate_indices: &[usize],
        probability_indices: &[usize],
        first_derivative_indices: Option<&[usize]>,
        second_derivative_indices: Option<&[usize]>,
        edge_lengths: &[f64],
    ) -> Result<()> {
        if category_rate_indices.len() != probability_indices.len() {
            return Err(EngineError::InvalidDimension {
                what: "category rate indices",
                expected: probability_indices.len(),
                got: category_rate_indices.len(),
            });
        }
        let rate_vecs: Vec<Vec<f64>> = category_rate_indices
            .iter()
            .map(|&i| self.pool.category_rates(i).map(|r| r.to_vec()))
            .collect::<Result<_>>()?;
        let rate_refs: Vec<&[f64]> = rate_vecs.iter().map(|v| v.as_slice()).collect();
        eigen::update_transition_matrices_multi(
            &self.eigens,
            &mut self.pool,
            eigen_indices,
            &rate_refs,
            probability_indices,
            first_derivative_indices,
            second_derivative_indices,
            edge_lengths,
            self.workers.is_some(),
        )
    }

    /// Category-wise matrix products, for epoch models.
    pub fn convolve_transition_matrices(
        &mut self,
        first_indices: &[usize],
        second_indices: &[usize],
        result_indices: &[usize],
    ) -> Result<()> {
        eigen::convolve_transition_matrices(
            &mut self.pool,
            first_indices,
            second_indices,
            result_indices,
        )
    }

    // ----- scale-factor operations -----

    fn full_pattern_range(&self) -> std::ops::Range<usize> {
        0..self.pool.layout().padded_pattern_count
    }

    fn partition_range(&self, partition: usize) -> Result<std::ops::Range<usize>> {
        self.partitions
            .as_ref()
            .ok_or(EngineError::InvalidConfiguration(
                "no pattern partitions defined",
            ))?
            .range(partition)
    }

    fn reject_auto_scale_ops(&self) -> Result<()> {
        if self.caps.scaling == ScalingMode::Auto {
            return Err(EngineError::InvalidConfiguration(
                "explicit scale-factor operations are unavailable under auto scaling",
            ));
        }
        Ok(())
    }

    pub fn accumulate_scale_factors(
        &mut self,
        scale_indices: &[usize],
        cumulative_index: usize,
    ) -> Result<()> {
        self.reject_auto_scale_ops()?;
        crate::scaling::accumulate_scale_factors(
            &self.pool,
            scale_indices,
            cumulative_index,
            self.caps.scalers_log,
            self.full_pattern_range(),
        )
    }

    pub fn accumulate_scale_factors_by_partition(
        &mut self,
        scale_indices: &[usize],
        cumulative_index: usize,
        partition: usize,
    ) -> Result<()> {
        self.reject_auto_scale_ops()?;
        let range = self.partition_range(partition)?;
        crate::scaling::accumulate_scale_factors(
            &self.pool,
            scale_indices,
            cumulative_index,
            self.caps.scalers_log,
            range,
        )
    }

    pub fn remove_scale_factors(
        &mut self,
        scale_indices: &[usize],
        cumulative_index: usize,
    ) -> Result<()> {
        self.reject_auto_scale_ops()?;
        crate::scaling::remove_scale_factors(
            &self.pool,
            scale_indices,
            cumulative_index,
            self.caps.scalers_log,
            self.full_pattern_range(),
        )
    }

    pub fn remove_scale_factors_by_partition(
        &mut self,
        scale_indices: &[usize],
        cumulative_index: usize,
        partition: usize,
    ) -> Result<()> {
        self.reject_auto_scale_ops()?;
        let range = self.partition_range(partition)?;
        crate::scaling::remove_scale_factors(
            &self.pool,
            scale_indices,
            cumulative_index,
            self.caps.scalers_log,
            range,
        )
    }

    pub fn reset_scale_factors(&mut self, cumulative_index: usize) -> Result<()> {
        self.reject_auto_scale_ops()?;
        let range = self.full_pattern_range();
        crate::scaling::reset_scale_factors(&mut self.pool, cumulative_index, range)
    }

    pub fn reset_scale_factors_by_partition(
        &mut self,
        cumulative_index: usize,
        partition: usize,
    ) -> Result<()> {
        self.reject_auto_scale_ops()?;
        let range = self.partition_range(partition)?;
        crate::scaling::reset_scale_factors(&mut self.pool, cumulative_index, range)
    }

    pub fn copy_scale_factors(&mut self, destination: usize, source: usize) -> Result<()> {
        self.reject_auto_scale_ops()?;
        crate::scaling::copy_scale_factors(
            &self.pool,
            destination,
            source,
            self.full_pattern_range(),
        )
    }

    pub fn copy_scale_factors_by_partition(
        &mut self,
        destination: usize,
        source: usize,
        partition: usize,
    ) -> Result<()> {
        self.reject_auto_scale_ops()?;
        let range = self.partition_range(partition)?;
        crate::scaling::copy_scale_factors(&self.pool, destination, source, range)
    }

    pub fn get_scale_factors(&self, source: usize, out: &mut [f64]) -> Result<()> {
        crate::scaling::get_scale_factors(&self.pool, source, out)
    }

    // ----- introspection -----

    pub fn name(&self) -> &'static str {
        if R::IS_DOUBLE {
            "ferrous-phylo-cpu-double"
        } else {
            "ferrous-phylo-cpu-single"
        }
    }

    pub fn flags(&self) -> u64 {
        self.caps.effective_flags::<R>()
    }

    pub fn instance_details(&self) -> InstanceDetails {
        InstanceDetails {
            name: self.name(),
            flags: self.flags(),
            thread_count: self.workers.as_ref().map_or(1, |w| w.worker_count()),
            padded_pattern_count: self.pool.layout().padded_pattern_count,
        }
    }

    /// Sum log-likelihood of the most recent reduction.
    pub fn log_likelihood(&self) -> Result<f64> {
        if self.sum_log_likelihood.is_nan() {
            return Err(EngineError::General("no reduction has run yet"));
        }
        Ok(self.sum_log_likelihood)
    }

    /// Summed derivatives of the most recent edge reduction.
    pub fn derivatives(&self) -> Result<(f64, f64)> {
        if self.sum_first_derivative.is_nan() {
            return Err(EngineError::General(
                "no derivative reduction has run yet",
            ));
        }
        Ok((self.sum_first_derivative, self.sum_second_derivative))
    }

    /// Per-site log-likelihoods of the most recent reduction, in the
    /// client's original pattern order.
    pub fn site_log_likelihoods(&self, out: &mut [f64]) -> Result<()> {
        self.copy_site_vector(self.scratch.site_log_likelihoods.as_slice(), out, "site log-likelihoods")
    }

    /// Per-site derivatives of the most recent edge reduction.
    pub fn site_derivatives(&self, out_first: &mut [f64], out_second: &mut [f64]) -> Result<()> {
        self.copy_site_vector(self.scratch.site_d1.as_slice(), out_first, "site derivatives")?;
        self.copy_site_vector(self.scratch.site_d2.as_slice(), out_second, "site derivatives")
    }

    fn copy_site_vector(&self, src: &[f64], out: &mut [f64], what: &'static str) -> Result<()> {
        let patterns = self.pool.layout().pattern_count;
        if out.len() != patterns {
            return Err(EngineError::InvalidDimension {
                what,
                expected: patterns,
                got: out.len(),
            });
        }
        match &self.partitions {
            Some(set) if set.reordered() => {
                for (old, slot) in out.iter_mut().enumerate() {
                    *slot = src[set.forward(old)];
                }
            }
            _ => out.copy_from_slice(&src[..patterns]),
        }
        Ok(())
    }
}

//! The operation scheduler: walks a batch of peeling operations,
//! resolves each to a kernel variant once, and executes serially,
//! pattern-sliced across the worker pool, or partition-by-partition.
//!
//! Kernels are pattern-local: destination values at pattern p depend
//! only on source values at p. Under pattern slicing each worker
//! therefore runs the whole op list on its own slice and never needs an
//! inter-op barrier; a worker's slice of op i is complete before its
//! slice of op i+1 starts, and no one else reads it.

use crate::buffers::{BufferLayout, ChildKind};
use crate::engine::LikelihoodEngine;
use crate::error::{EngineError, Result};
use crate::flags::ScalingMode;
use crate::kernels;
use crate::real::Real;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};

/// One peeling operation: combine two children through their edge
/// matrices into a destination partials buffer.
///
/// `write_scale` asks for dynamic rescaling into the named scale buffer;
/// otherwise `read_scale` selects the fixed-scaling kernel dividing by a
/// previously recorded buffer. Both `None` runs the plain kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub destination: usize,
    pub write_scale: Option<usize>,
    pub read_scale: Option<usize>,
    pub child1: usize,
    pub child1_matrix: usize,
    pub child2: usize,
    pub child2_matrix: usize,
}

/// A peeling operation bound to one pattern partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionOperation {
    pub operation: Operation,
    pub partition: usize,
    /// Cumulative buffer collecting this op's rescaling factors (over
    /// the partition's pattern span only).
    pub cumulative_scale: Option<usize>,
}

#[derive(Clone, Copy)]
enum ChildSource<R> {
    States(*const i32),
    Partials(*const R),
}

#[derive(Clone, Copy)]
enum ScaleAction<R> {
    None,
    FixedRead(*const R),
    Rescale {
        factors: *mut R,
        cumulative: Option<*mut R>,
    },
    Auto {
        exponents: *mut i16,
        active: *const AtomicBool,
    },
}

/// A fully resolved operation: raw buffer views plus the kernel variant,
/// selected once per batch. Copied to every worker under threading.
#[derive(Clone, Copy)]
struct OpPlan<R> {
    dest: *mut R,
    child1: ChildSource<R>,
    matrices1: *const R,
    child2: ChildSource<R>,
    matrices2: *const R,
    scale: ScaleAction<R>,
}

// SAFETY: the plan's pointers address pool buffers that outlive the
// batch; workers write only disjoint pattern ranges (see execute sites).
unsafe impl<R> Send for OpPlan<R> {}

/// Run one resolved op over a pattern range.
///
/// # Safety
/// The plan's destination (and scale targets) must not be touched by
/// anyone else over `patterns` for the duration of the call, and all
/// plan pointers must still address live pool buffers.
unsafe fn execute_plan<R: Real>(
    plan: &OpPlan<R>,
    layout: &BufferLayout,
    scalers_log: bool,
    patterns: Range<usize>,
) {
    let matrix_len = layout.matrix_len();
    let tip_len = layout.padded_pattern_count;
    let partials_len = layout.partials_len();
    // SAFETY: shared reads of live source buffers; sources never alias
    // the destination (checked at plan build).
    let m1 = unsafe { std::slice::from_raw_parts(plan.matrices1, matrix_len) };
    let m2 = unsafe { std::slice::from_raw_parts(plan.matrices2, matrix_len) };

    macro_rules! dispatch {
        (plain) => {
            match (plan.child1, plan.child2) {
                (ChildSource::States(s1), ChildSource::States(s2)) => {
                    let s1 = unsafe { std::slice::from_raw_parts(s1, tip_len) };
                    let s2 = unsafe { std::slice::from_raw_parts(s2, tip_len) };
                    unsafe { kernels::states_states(plan.dest, s1, m1, s2, m2, layout, patterns.clone()) }
                }
                (ChildSource::States(s1), ChildSource::Partials(p2)) => {
                    let s1 = unsafe { std::slice::from_raw_parts(s1, tip_len) };
                    let p2 = unsafe { std::slice::from_raw_parts(p2, partials_len) };
                    unsafe { kernels::states_partials(plan.dest, s1, m1, p2, m2, layout, patterns.clone()) }
                }
                (ChildSource::Partials(p1), ChildSource::Partials(p2)) => {
                    let p1 = unsafe { std::slice::from_raw_parts(p1, partials_len) };
                    let p2 = unsafe { std::slice::from_raw_parts(p2, partials_len) };
                    unsafe { kernels::partials_partials(plan.dest, p1, m1, p2, m2, layout, patterns.clone()) }
                }
                (ChildSource::Partials(_), ChildSource::States(_)) => {
                    unreachable!("children are normalised states-first at plan build")
                }
            }
        };
        (fixed $factors:expr) => {
            match (plan.child1, plan.child2) {
                (ChildSource::States(s1), ChildSource::States(s2)) => {
                    let s1 = unsafe { std::slice::from_raw_parts(s1, tip_len) };
                    let s2 = unsafe { std::slice::from_raw_parts(s2, tip_len) };
                    unsafe {
                        kernels::states_states_fixed_scaling(
                            plan.dest, s1, m1, s2, m2, $factors, scalers_log, layout, patterns.clone(),
                        )
                    }
                }
                (ChildSource::States(s1), ChildSource::Partials(p2)) => {
                    let s1 = unsafe { std::slice::from_raw_parts(s1, tip_len) };
                    let p2 = unsafe { std::slice::from_raw_parts(p2, partials_len) };
                    unsafe {
                        kernels::states_partials_fixed_scaling(
                            plan.dest, s1, m1, p2, m2, $factors, scalers_log, layout, patterns.clone(),
                        )
                    }
                }
                (ChildSource::Partials(p1), ChildSource::Partials(p2)) => {
                    let p1 = unsafe { std::slice::from_raw_parts(p1, partials_len) };
                    let p2 = unsafe { std::slice::from_raw_parts(p2, partials_len) };
                    unsafe {
                        kernels::partials_partials_fixed_scaling(
                            plan.dest, p1, m1, p2, m2, $factors, scalers_log, layout, patterns.clone(),
                        )
                    }
                }
                (ChildSource::Partials(_), ChildSource::States(_)) => {
                    unreachable!("children are normalised states-first at plan build")
                }
            }
        };
    }

    match plan.scale {
        ScaleAction::FixedRead(factors) => {
            // SAFETY: shared read of a live scale buffer.
            let factors = unsafe { std::slice::from_raw_parts(factors, tip_len) };
            dispatch!(fixed factors);
        }
        ScaleAction::None => {
            dispatch!(plain);
        }
        ScaleAction::Rescale { factors, cumulative } => {
            dispatch!(plain);
            // SAFETY: caller owns the patterns range of dest and the
            // scale targets.
            unsafe {
                kernels::rescale_partials(
                    plan.dest,
                    factors,
                    cumulative,
                    scalers_log,
                    layout,
                    patterns,
                )
            };
        }
        ScaleAction::Auto { exponents, active } => {
            dispatch!(plain);
            // SAFETY: as above; the activity flag is atomic and shared.
            let activated =
                unsafe { kernels::auto_rescale_partials(plan.dest, exponents, layout, patterns) };
            if activated {
                unsafe { (*active).store(true, Ordering::Release) };
            }
        }
    }
}

impl<R: Real> LikelihoodEngine<R> {
    fn build_plan(
        &self,
        op: &Operation,
        batch_cumulative: Option<usize>,
    ) -> Result<OpPlan<R>> {
        if op.destination == op.child1 || op.destination == op.child2 {
            return Err(EngineError::InvalidConfiguration(
                "peeling destination aliases one of its sources",
            ));
        }
        let dest = self.pool.partials_base(op.destination)?;
        let kind1 = self.pool.child_kind(op.child1)?;
        let kind2 = self.pool.child_kind(op.child2)?;
        let source = |index: usize, kind: ChildKind| -> Result<ChildSource<R>> {
            Ok(match kind {
                ChildKind::States => ChildSource::States(self.pool.tip_states(index)?.as_ptr()),
                ChildKind::Partials => ChildSource::Partials(self.pool.partials(index)?.as_ptr()),
            })
        };
        let mut child1 = source(op.child1, kind1)?;
        let mut matrices1 = self.pool.matrix(op.child1_matrix)?.as_ptr();
        let mut child2 = source(op.child2, kind2)?;
        let mut matrices2 = self.pool.matrix(op.child2_matrix)?.as_ptr();
        // states-first normalisation: there is no partials-states kernel
        if kind1 == ChildKind::Partials && kind2 == ChildKind::States {
            std::mem::swap(&mut child1, &mut child2);
            std::mem::swap(&mut matrices1, &mut matrices2);
        }

        let cumulative = match batch_cumulative {
            Some(index) => Some(self.pool.scale_base(index)?),
            None => None,
        };
        let scale = match self.caps.scaling {
            ScalingMode::Auto => ScaleAction::Auto {
                exponents: self.pool.auto_scale_base(op.destination)?,
                active: self.pool.auto_scale_active_flag(op.destination) as *const AtomicBool,
            },
            ScalingMode::Always => {
                if op.destination < self.pool.tip_count() {
                    return Err(EngineError::InvalidConfiguration(
                        "always-scaling expects internal destinations",
                    ));
                }
                ScaleAction::Rescale {
                    factors: self
                        .pool
                        .scale_base(op.destination - self.pool.tip_count())?,
                    cumulative,
                }
            }
            _ => {
                if let Some(write) = op.write_scale {
                    ScaleAction::Rescale {
                        factors: self.pool.scale_base(write)?,
                        cumulative,
                    }
                } else if let Some(read) = op.read_scale {
                    ScaleAction::FixedRead(self.pool.scale_factors(read)?.as_ptr())
                } else {
                    ScaleAction::None
                }
            }
        };

        Ok(OpPlan {
            dest,
            child1,
            matrices1,
            child2,
            matrices2,
            scale,
        })
    }

    /// Execute a batch of peeling operations in submission order.
    ///
    /// Sources of each op must be complete when the batch is submitted
    /// (tips, earlier batches, or earlier ops of this batch); the
    /// scheduler does not detect cyclic orderings.
    pub fn update_partials(
        &mut self,
        operations: &[Operation],
        cumulative_scale_index: Option<usize>,
    ) -> Result<()> {
        let plans: Vec<OpPlan<R>> = operations
            .iter()
            .map(|op| self.build_plan(op, cumulative_scale_index))
            .collect::<Result<_>>()?;
        let layout = *self.pool.layout();
        let scalers_log = self.caps.scalers_log;
        let full = 0..layout.padded_pattern_count;

        let slice_workers = if self.caps.auto_partition {
            self.auto_slice_workers
        } else {
            0
        };
        if let (Some(pool), true) = (&self.workers, slice_workers >= 2) {
            let n = slice_workers;
            let chunk = layout.padded_pattern_count / n;
            log::trace!("pattern-sliced peel: {} ops x {} workers", plans.len(), n);
            let mut handles = Vec::with_capacity(n);
            for w in 0..n {
                let start = w * chunk;
                let end = if w + 1 == n {
                    layout.padded_pattern_count
                } else {
                    start + chunk
                };
                let worker_plans = plans.clone();
                handles.push(pool.submit(w % pool.worker_count(), move || {
                    for plan in &worker_plans {
                        // SAFETY: workers own disjoint [start, end) pattern
                        // ranges; destinations never alias sources; all
                        // buffers outlive the join below.
                        unsafe { execute_plan(plan, &layout, scalers_log, start..end) };
                    }
                }));
            }
            for handle in handles {
                handle.wait();
            }
        } else {
            for plan in &plans {
                // SAFETY: single-threaded execution of non-aliasing ops.
                unsafe { execute_plan(plan, &layout, scalers_log, full.clone()) };
            }
        }
        Ok(())
    }

    /// Execute a batch of partition-bound operations. Partitions are
    /// assigned round-robin to workers; ops within a partition keep
    /// submission order, ops across partitions have no ordering
    /// relation.
    pub fn update_partials_by_partition(
        &mut self,
        operations: &[PartitionOperation],
    ) -> Result<()> {
        if self.partitions.is_none() {
            return Err(EngineError::InvalidConfiguration(
                "no pattern partitions defined",
            ));
        }
        let mut planned: Vec<(OpPlan<R>, Range<usize>, usize)> =
            Vec::with_capacity(operations.len());
        for op in operations {
            let range = self
                .partitions
                .as_ref()
                .unwrap()
                .range(op.partition)?;
            let plan = self.build_plan(&op.operation, op.cumulative_scale)?;
            planned.push((plan, range, op.partition));
        }
        let layout = *self.pool.layout();
        let scalers_log = self.caps.scalers_log;

        if let Some(pool) = &self.workers {
            // first-appearance order keeps assignment deterministic
            let mut partition_order: Vec<usize> = Vec::new();
            for (_, _, q) in &planned {
                if !partition_order.contains(q) {
                    partition_order.push(*q);
                }
            }
            let workers = pool.worker_count();
            let mut per_worker: Vec<Vec<(OpPlan<R>, Range<usize>)>> = vec![Vec::new(); workers];
            for (slot, q) in partition_order.iter().enumerate() {
                let w = slot % workers;
                for (plan, range, part) in &planned {
                    if part == q {
                        per_worker[w].push((*plan, range.clone()));
                    }
                }
            }
            let mut handles = Vec::new();
            for (w, list) in per_worker.into_iter().enumerate() {
                if list.is_empty() {
                    continue;
                }
                handles.push(pool.submit(w, move || {
                    for (plan, range) in &list {
                        // SAFETY: partitions own disjoint pattern spans and
                        // ops within one partition run serially here, in
                        // submission order; buffers outlive the join.
                        unsafe { execute_plan(plan, &layout, scalers_log, range.clone()) };
                    }
                }));
            }
            for handle in handles {
                handle.wait();
            }
        } else {
            for (plan, range, _) in &planned {
                // SAFETY: single-threaded execution of non-aliasing ops.
                unsafe { execute_plan(plan, &layout, scalers_log, range.clone()) };
            }
        }
        Ok(())
    }

    /// Block until the named destinations are complete. Batches execute
    /// synchronously, so this only validates the indices.
    pub fn wait_for_partials(&self, destination_indices: &[usize]) -> Result<()> {
        for &index in destination_indices {
            self.pool.partials(index)?;
        }
        Ok(())
    }

    /// Block until every outstanding calculation is complete.
    pub fn block(&self) -> Result<()> {
        Ok(())
    }
}

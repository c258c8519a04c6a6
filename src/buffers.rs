//! Buffer pool: every numeric array the engine owns.
//!
//! All storage is allocated here, 32-byte aligned, either at instance
//! creation or at the first setter touching a tip slot. Nothing on the
//! peel/reduce path allocates. Kernels never see this type; they receive
//! plain slices plus a [`BufferLayout`] carrying the strides.

use crate::error::{EngineError, Result};
use crate::real::Real;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Alignment for all numeric storage. Generous enough for any of the
/// SIMD kernel specialisations this layout is meant to admit.
pub const BUFFER_ALIGNMENT: usize = 32;

/// Owned, aligned, fixed-size storage.
#[derive(Debug)]
pub struct AlignedBuffer<T> {
    ptr: NonNull<T>,
    len: usize,
}

// The buffer exclusively owns its allocation; sharing follows the
// element type.
unsafe impl<T: Send> Send for AlignedBuffer<T> {}
unsafe impl<T: Sync> Sync for AlignedBuffer<T> {}

impl<T: Copy + Default> AlignedBuffer<T> {
    /// Allocate `len` zeroed elements.
    pub fn zeroed(len: usize) -> Result<Self> {
        if len == 0 {
            return Ok(AlignedBuffer {
                ptr: NonNull::dangling(),
                len: 0,
            });
        }
        let bytes = len * std::mem::size_of::<T>();
        let layout = Layout::from_size_align(bytes, BUFFER_ALIGNMENT)
            .map_err(|_| EngineError::OutOfMemory { bytes })?;
        // SAFETY: layout has non-zero size (len > 0, T is not a ZST here).
        let raw = unsafe { alloc_zeroed(layout) as *mut T };
        let ptr = NonNull::new(raw).ok_or(EngineError::OutOfMemory { bytes })?;
        Ok(AlignedBuffer { ptr, len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: ptr covers len initialised elements for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: as above, and &mut self guarantees uniqueness.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Raw base pointer. Used by the scheduler to hand disjoint pattern
    /// ranges of one buffer to different workers; see the safety notes at
    /// the construction sites.
    #[inline]
    pub fn base_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    pub fn fill(&mut self, value: T) {
        for v in self.as_mut_slice() {
            *v = value;
        }
    }
}

impl<T> Drop for AlignedBuffer<T> {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        let bytes = self.len * std::mem::size_of::<T>();
        let layout = Layout::from_size_align(bytes, BUFFER_ALIGNMENT).unwrap();
        // SAFETY: allocated in `zeroed` with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr() as *mut u8, layout) };
    }
}

/// Strides of the partials and transition-matrix layouts.
///
/// Partials are (category, pattern, state) with the state axis padded to
/// `padded_state_count` and the pattern axis padded to
/// `padded_pattern_count`. Transition matrices are (category, row, column)
/// with one extra column per row: looking up a column with the ambiguity
/// state index `state_count` lands on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub state_count: usize,
    pub padded_state_count: usize,
    pub pattern_count: usize,
    pub padded_pattern_count: usize,
    pub category_count: usize,
    /// Row stride of a transition matrix: `state_count + 1`.
    pub matrix_stride: usize,
}

impl BufferLayout {
    pub fn new<R: Real>(state_count: usize, pattern_count: usize, category_count: usize) -> Self {
        BufferLayout {
            state_count,
            padded_state_count: state_count, // no state padding on the scalar engine
            pattern_count,
            padded_pattern_count: crate::real::padded_pattern_count::<R>(pattern_count),
            category_count,
            matrix_stride: state_count + 1,
        }
    }

    /// Elements in one partials buffer.
    #[inline]
    pub fn partials_len(&self) -> usize {
        self.category_count * self.padded_pattern_count * self.padded_state_count
    }

    /// Elements in one transition-matrix buffer (all categories).
    #[inline]
    pub fn matrix_len(&self) -> usize {
        self.category_count * self.category_matrix_len()
    }

    /// Elements in one category's matrix.
    #[inline]
    pub fn category_matrix_len(&self) -> usize {
        self.state_count * self.matrix_stride
    }

    /// Offset of (category, pattern, state 0) in a partials buffer.
    #[inline]
    pub fn partials_offset(&self, category: usize, pattern: usize) -> usize {
        (category * self.padded_pattern_count + pattern) * self.padded_state_count
    }
}

/// Which representation a peeling child uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    States,
    Partials,
}

/// All numeric storage for one engine instance.
#[derive(Debug)]
pub struct BufferPool<R: Real> {
    layout: BufferLayout,
    tip_count: usize,
    partials: Vec<Option<AlignedBuffer<R>>>,
    tip_states: Vec<Option<AlignedBuffer<i32>>>,
    matrices: Vec<AlignedBuffer<R>>,
    scale: Vec<AlignedBuffer<R>>,
    auto_scale: Vec<AlignedBuffer<i16>>,
    auto_scale_active: Vec<std::sync::atomic::AtomicBool>,
    category_weights: Vec<Option<Vec<R>>>,
    state_frequencies: Vec<Option<Vec<R>>>,
    category_rates: Vec<Option<Vec<f64>>>,
    pattern_weights: Vec<f64>,
}

impl<R: Real> BufferPool<R> {
    pub fn allocate(
        layout: BufferLayout,
        buffer_count: usize,
        tip_count: usize,
        matrix_count: usize,
        scale_buffer_count: usize,
        auto_scaling: bool,
        eigen_count: usize,
    ) -> Result<Self> {
        let mut partials = Vec::with_capacity(buffer_count);
        for i in 0..buffer_count {
            if i < tip_count {
                partials.push(None); // set_tip_partials allocates on demand
            } else {
                partials.push(Some(AlignedBuffer::zeroed(layout.partials_len())?));
            }
        }
        let tip_states = (0..tip_count).map(|_| None).collect();
        let mut matrices = Vec::with_capacity(matrix_count);
        for _ in 0..matrix_count {
            matrices.push(AlignedBuffer::zeroed(layout.matrix_len())?);
        }
        let mut scale = Vec::with_capacity(scale_buffer_count);
        for _ in 0..scale_buffer_count {
            scale.push(AlignedBuffer::zeroed(layout.padded_pattern_count)?);
        }
        let auto_count = if auto_scaling { buffer_count } else { 0 };
        let mut auto_scale = Vec::with_capacity(auto_count);
        let mut auto_scale_active = Vec::with_capacity(auto_count);
        for _ in 0..auto_count {
            auto_scale.push(AlignedBuffer::zeroed(layout.padded_pattern_count)?);
            auto_scale_active.push(std::sync::atomic::AtomicBool::new(false));
        }
        log::debug!(
            "buffer pool: {} partials x {} elems, {} matrices x {} elems, {} scale buffers",
            buffer_count,
            layout.partials_len(),
            matrix_count,
            layout.matrix_len(),
            scale_buffer_count,
        );
        Ok(BufferPool {
            layout,
            tip_count,
            partials,
            tip_states,
            matrices,
            scale,
            auto_scale,
            auto_scale_active,
            category_weights: (0..eigen_count).map(|_| None).collect(),
            state_frequencies: (0..eigen_count).map(|_| None).collect(),
            category_rates: (0..eigen_count).map(|_| None).collect(),
            pattern_weights: vec![0.0; layout.padded_pattern_count],
        })
    }

    #[inline]
    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    fn check_index(what: &'static str, index: usize, count: usize) -> Result<()> {
        if index >= count {
            return Err(EngineError::OutOfRange { what, index, count });
        }
        Ok(())
    }

    // ----- tips -----

    pub fn set_tip_states(&mut self, tip: usize, states: &[i32]) -> Result<()> {
        Self::check_index("tip", tip, self.tip_count)?;
        let lay = self.layout;
        if states.len() != lay.pattern_count {
            return Err(EngineError::InvalidDimension {
                what: "tip states",
                expected: lay.pattern_count,
                got: states.len(),
            });
        }
        let mut buf = AlignedBuffer::zeroed(lay.padded_pattern_count)?;
        {
            let dst = buf.as_mut_slice();
            let s_max = lay.state_count as i32;
            for (p, &s) in states.iter().enumerate() {
                // anything outside 0..S is treated as ambiguous
                dst[p] = if (0..s_max).contains(&s) { s } else { s_max };
            }
            let last = dst[lay.pattern_count - 1];
            for p in lay.pattern_count..lay.padded_pattern_count {
                dst[p] = last;
            }
        }
        self.tip_states[tip] = Some(buf);
        self.partials[tip] = None; // a tip carries states or partials, not both
        Ok(())
    }

    /// Expand pattern-major tip partials (`pattern_count * state_count`)
    /// into the internal layout, replicated across categories. Padding
    /// patterns replicate the last real pattern.
    pub fn set_tip_partials(&mut self, tip: usize, partials: &[f64]) -> Result<()> {
        Self::check_index("tip", tip, self.tip_count)?;
        let lay = self.layout;
        let expected = lay.pattern_count * lay.state_count;
        if partials.len() != expected {
            return Err(EngineError::InvalidDimension {
                what: "tip partials",
                expected,
                got: partials.len(),
            });
        }
        let mut buf = AlignedBuffer::zeroed(lay.partials_len())?;
        {
            let dst = buf.as_mut_slice();
            for c in 0..lay.category_count {
                for p in 0..lay.padded_pattern_count {
                    let src_p = p.min(lay.pattern_count - 1);
                    let src = &partials[src_p * lay.state_count..(src_p + 1) * lay.state_count];
                    let off = lay.partials_offset(c, p);
                    for (s, &v) in src.iter().enumerate() {
                        dst[off + s] = R::from_f64(v);
                    }
                }
            }
        }
        self.partials[tip] = Some(buf);
        self.tip_states[tip] = None;
        Ok(())
    }

    // ----- partials -----

    /// Store a full buffer, category-major (`category * pattern * state`
    /// real patterns); padding patterns replicate the last real pattern.
    pub fn set_partials(&mut self, index: usize, partials: &[f64]) -> Result<()> {
        Self::check_index("partials buffer", index, self.partials.len())?;
        let lay = self.layout;
        let expected = lay.category_count * lay.pattern_count * lay.state_count;
        if partials.len() != expected {
            return Err(EngineError::InvalidDimension {
                what: "partials",
                expected,
                got: partials.len(),
            });
        }
        if self.partials[index].is_none() {
            self.partials[index] = Some(AlignedBuffer::zeroed(lay.partials_len())?);
            if index < self.tip_count {
                self.tip_states[index] = None;
            }
        }
        let dst = self.partials[index].as_mut().unwrap().as_mut_slice();
        for c in 0..lay.category_count {
            for p in 0..lay.padded_pattern_count {
                let src_p = p.min(lay.pattern_count - 1);
                let src_off = (c * lay.pattern_count + src_p) * lay.state_count;
                let off = lay.partials_offset(c, p);
                for s in 0..lay.state_count {
                    dst[off + s] = R::from_f64(partials[src_off + s]);
                }
            }
        }
        Ok(())
    }

    /// Copy a buffer out, dropping padding. `unscale` optionally applies a
    /// scale buffer on the way: partials were stored divided by the factor,
    /// so the read multiplies it back in.
    pub fn get_partials(
        &self,
        index: usize,
        unscale: Option<usize>,
        scalers_log: bool,
        out: &mut [f64],
    ) -> Result<()> {
        Self::check_index("partials buffer", index, self.partials.len())?;
        let lay = self.layout;
        let expected = lay.category_count * lay.pattern_count * lay.state_count;
        if out.len() != expected {
            return Err(EngineError::InvalidDimension {
                what: "partials output",
                expected,
                got: out.len(),
            });
        }
        let src = self.partials(index)?;
        let factors = match unscale {
            Some(k) => Some(self.scale_factors(k)?),
            None => None,
        };
        for c in 0..lay.category_count {
            for p in 0..lay.pattern_count {
                let off = lay.partials_offset(c, p);
                let out_off = (c * lay.pattern_count + p) * lay.state_count;
                let factor = factors.map(|f| {
                    if scalers_log {
                        f[p].exp()
                    } else {
                        f[p]
                    }
                });
                for s in 0..lay.state_count {
                    let v = src[off + s];
                    out[out_off + s] = match factor {
                        Some(f) => (v * f).to_f64(),
                        None => v.to_f64(),
                    };
                }
            }
        }
        Ok(())
    }

    pub fn partials(&self, index: usize) -> Result<&[R]> {
        Self::check_index("partials buffer", index, self.partials.len())?;
        self.partials[index]
            .as_ref()
            .map(|b| b.as_slice())
            .ok_or(EngineError::UninitialisedBuffer { index })
    }

    pub fn partials_mut(&mut self, index: usize) -> Result<&mut [R]> {
        Self::check_index("partials buffer", index, self.partials.len())?;
        self.partials[index]
            .as_mut()
            .map(|b| b.as_mut_slice())
            .ok_or(EngineError::UninitialisedBuffer { index })
    }

    /// Base pointer of a partials buffer, for handing disjoint pattern
    /// ranges to workers.
    pub fn partials_base(&self, index: usize) -> Result<*mut R> {
        Self::check_index("partials buffer", index, self.partials.len())?;
        self.partials[index]
            .as_ref()
            .map(|b| b.base_ptr())
            .ok_or(EngineError::UninitialisedBuffer { index })
    }

    pub fn buffer_count(&self) -> usize {
        self.partials.len()
    }

    pub fn tip_count(&self) -> usize {
        self.tip_count
    }

    /// How a peeling child at `index` is represented.
    pub fn child_kind(&self, index: usize) -> Result<ChildKind> {
        Self::check_index("partials buffer", index, self.partials.len())?;
        if index < self.tip_count && self.tip_states[index].is_some() {
            return Ok(ChildKind::States);
        }
        if self.partials[index].is_some() {
            return Ok(ChildKind::Partials);
        }
        Err(EngineError::UninitialisedBuffer { index })
    }

    pub fn tip_states(&self, index: usize) -> Result<&[i32]> {
        Self::check_index("tip", index, self.tip_count)?;
        self.tip_states[index]
            .as_ref()
            .map(|b| b.as_slice())
            .ok_or(EngineError::UninitialisedBuffer { index })
    }

    // ----- transition matrices -----

    /// Copy a caller matrix in. Input is `category * state * state`
    /// row-major; `padded_value` fills the ambiguity column.
    pub fn set_transition_matrix(
        &mut self,
        index: usize,
        matrix: &[f64],
        padded_value: f64,
    ) -> Result<()> {
        Self::check_index("transition matrix", index, self.matrices.len())?;
        let lay = self.layout;
        let expected = lay.category_count * lay.state_count * lay.state_count;
        if matrix.len() != expected {
            return Err(EngineError::InvalidDimension {
                what: "transition matrix",
                expected,
                got: matrix.len(),
            });
        }
        let dst = self.matrices[index].as_mut_slice();
        let s = lay.state_count;
        for c in 0..lay.category_count {
            for i in 0..s {
                let src_off = (c * s + i) * s;
                let dst_off = c * lay.category_matrix_len() + i * lay.matrix_stride;
                for j in 0..s {
                    dst[dst_off + j] = R::from_f64(matrix[src_off + j]);
                }
                dst[dst_off + s] = R::from_f64(padded_value);
            }
        }
        Ok(())
    }

    pub fn get_transition_matrix(&self, index: usize, out: &mut [f64]) -> Result<()> {
        Self::check_index("transition matrix", index, self.matrices.len())?;
        let lay = self.layout;
        let expected = lay.category_count * lay.state_count * lay.state_count;
        if out.len() != expected {
            return Err(EngineError::InvalidDimension {
                what: "transition matrix output",
                expected,
                got: out.len(),
            });
        }
        let src = self.matrices[index].as_slice();
        let s = lay.state_count;
        for c in 0..lay.category_count {
            for i in 0..s {
                let src_off = c * lay.category_matrix_len() + i * lay.matrix_stride;
                let dst_off = (c * s + i) * s;
                for j in 0..s {
                    out[dst_off + j] = src[src_off + j].to_f64();
                }
            }
        }
        Ok(())
    }

    pub fn matrix(&self, index: usize) -> Result<&[R]> {
        Self::check_index("transition matrix", index, self.matrices.len())?;
        Ok(self.matrices[index].as_slice())
    }

    pub fn matrix_mut(&mut self, index: usize) -> Result<&mut [R]> {
        Self::check_index("transition matrix", index, self.matrices.len())?;
        Ok(self.matrices[index].as_mut_slice())
    }

    pub fn matrix_base(&self, index: usize) -> Result<*mut R> {
        Self::check_index("transition matrix", index, self.matrices.len())?;
        Ok(self.matrices[index].base_ptr())
    }

    pub fn matrix_count(&self) -> usize {
        self.matrices.len()
    }

    // ----- scale buffers -----

    pub fn scale_factors(&self, index: usize) -> Result<&[R]> {
        Self::check_index("scale buffer", index, self.scale.len())?;
        Ok(self.scale[index].as_slice())
    }

    pub fn scale_factors_mut(&mut self, index: usize) -> Result<&mut [R]> {
        Self::check_index("scale buffer", index, self.scale.len())?;
        Ok(self.scale[index].as_mut_slice())
    }

    pub fn scale_base(&self, index: usize) -> Result<*mut R> {
        Self::check_index("scale buffer", index, self.scale.len())?;
        Ok(self.scale[index].base_ptr())
    }

    pub fn scale_buffer_count(&self) -> usize {
        self.scale.len()
    }

    pub fn auto_scale_exponents(&self, index: usize) -> Result<&[i16]> {
        Self::check_index("auto-scale buffer", index, self.auto_scale.len())?;
        Ok(self.auto_scale[index].as_slice())
    }

    pub fn auto_scale_base(&self, index: usize) -> Result<*mut i16> {
        Self::check_index("auto-scale buffer", index, self.auto_scale.len())?;
        Ok(self.auto_scale[index].base_ptr())
    }

    pub fn auto_scale_active(&self, index: usize) -> bool {
        self.auto_scale_active[index].load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn auto_scale_active_flag(&self, index: usize) -> &std::sync::atomic::AtomicBool {
        &self.auto_scale_active[index]
    }

    pub fn auto_scaling_enabled(&self) -> bool {
        !self.auto_scale.is_empty()
    }

    // ----- model vectors -----

    pub fn set_category_weights(&mut self, index: usize, weights: &[f64]) -> Result<()> {
        Self::check_index("category weights", index, self.category_weights.len())?;
        if weights.len() != self.layout.category_count {
            return Err(EngineError::InvalidDimension {
                what: "category weights",
                expected: self.layout.category_count,
                got: weights.len(),
            });
        }
        self.category_weights[index] = Some(weights.iter().map(|&w| R::from_f64(w)).collect());
        Ok(())
    }

    pub fn category_weights(&self, index: usize) -> Result<&[R]> {
        Self::check_index("category weights", index, self.category_weights.len())?;
        self.category_weights[index]
            .as_deref()
            .ok_or(EngineError::UninitialisedBuffer { index })
    }

    pub fn set_state_frequencies(&mut self, index: usize, frequencies: &[f64]) -> Result<()> {
        Self::check_index("state frequencies", index, self.state_frequencies.len())?;
        if frequencies.len() != self.layout.state_count {
            return Err(EngineError::InvalidDimension {
                what: "state frequencies",
                expected: self.layout.state_count,
                got: frequencies.len(),
            });
        }
        self.state_frequencies[index] =
            Some(frequencies.iter().map(|&f| R::from_f64(f)).collect());
        Ok(())
    }

    pub fn state_frequencies(&self, index: usize) -> Result<&[R]> {
        Self::check_index("state frequencies", index, self.state_frequencies.len())?;
        self.state_frequencies[index]
            .as_deref()
            .ok_or(EngineError::UninitialisedBuffer { index })
    }

    /// Category rates stay in double precision until they are multiplied
    /// by an edge length.
    pub fn set_category_rates(&mut self, index: usize, rates: &[f64]) -> Result<()> {
        Self::check_index("category rates", index, self.category_rates.len())?;
        if rates.len() != self.layout.category_count {
            return Err(EngineError::InvalidDimension {
                what: "category rates",
                expected: self.layout.category_count,
                got: rates.len(),
            });
        }
        self.category_rates[index] = Some(rates.to_vec());
        Ok(())
    }

    pub fn category_rates(&self, index: usize) -> Result<&[f64]> {
        Self::check_index("category rates", index, self.category_rates.len())?;
        self.category_rates[index]
            .as_deref()
            .ok_or(EngineError::UninitialisedBuffer { index })
    }

    pub fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<()> {
        if weights.len() != self.layout.pattern_count {
            return Err(EngineError::InvalidDimension {
                what: "pattern weights",
                expected: self.layout.pattern_count,
                got: weights.len(),
            });
        }
        self.pattern_weights[..weights.len()].copy_from_slice(weights);
        // padding patterns contribute nothing
        for w in &mut self.pattern_weights[weights.len()..] {
            *w = 0.0;
        }
        Ok(())
    }

    pub fn pattern_weights(&self) -> &[f64] {
        &self.pattern_weights
    }

    // ----- pattern reordering support -----

    /// Apply a pattern permutation (`perm[new] = old`) to every
    /// per-pattern array stored so far: tip states, tip partials, pattern
    /// weights. Internal partials are not permuted; their first write
    /// already follows the new order.
    pub fn permute_patterns(&mut self, perm: &[usize]) -> Result<()> {
        let lay = self.layout;
        debug_assert_eq!(perm.len(), lay.padded_pattern_count);

        for tip in 0..self.tip_count {
            if let Some(states) = self.tip_states[tip].as_mut() {
                let old: Vec<i32> = states.as_slice().to_vec();
                let dst = states.as_mut_slice();
                for (new_p, &old_p) in perm.iter().enumerate() {
                    dst[new_p] = old[old_p];
                }
            }
            if let Some(partials) = self.partials[tip].as_mut() {
                let old: Vec<R> = partials.as_slice().to_vec();
                let dst = partials.as_mut_slice();
                for c in 0..lay.category_count {
                    for (new_p, &old_p) in perm.iter().enumerate() {
                        let dst_off = lay.partials_offset(c, new_p);
                        let src_off = lay.partials_offset(c, old_p);
                        dst[dst_off..dst_off + lay.state_count]
                            .copy_from_slice(&old[src_off..src_off + lay.state_count]);
                    }
                }
            }
        }
        let old_weights = self.pattern_weights.clone();
        for (new_p, &old_p) in perm.iter().enumerate() {
            self.pattern_weights[new_p] = old_weights[old_p];
        }
        for buf in &mut self.scale {
            let old: Vec<R> = buf.as_slice().to_vec();
            let dst = buf.as_mut_slice();
            for (new_p, &old_p) in perm.iter().enumerate() {
                dst[new_p] = old[old_p];
            }
        }
        for buf in &mut self.auto_scale {
            let old: Vec<i16> = buf.as_slice().to_vec();
            let dst = buf.as_mut_slice();
            for (new_p, &old_p) in perm.iter().enumerate() {
                dst[new_p] = old[old_p];
            }
        }
        Ok(())
    }
}

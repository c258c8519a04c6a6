//! The peeling kernels: the three inner loops of the engine.
//!
//! Each kernel combines two child representations (compact tip states or
//! partial-likelihood vectors) with their edge transition matrices into a
//! parent partials buffer, for one `[start, end)` pattern range. The
//! scheduler resolves which variant to run once per operation; the bodies
//! are branch-free over patterns.
//!
//! Kernels take the destination as a raw pointer: under threaded
//! execution several workers write disjoint pattern ranges of the same
//! buffer concurrently, which rules out handing each of them a `&mut`
//! slice. Sources are ordinary shared slices.
//!
//! # Safety
//!
//! Every kernel in this module has the same contract:
//! - `dest` points to a live buffer of `layout.partials_len()` elements,
//!   distinct from every source buffer of the call;
//! - no other thread reads or writes the `patterns` range of `dest` (or
//!   of the scale buffers passed alongside) for the duration of the call;
//! - `patterns` lies within `0..layout.padded_pattern_count`.

pub mod partials_partials;
pub mod rescale;
pub mod states_partials;
pub mod states_states;

pub use partials_partials::{partials_partials, partials_partials_fixed_scaling};
pub use rescale::{auto_rescale_partials, rescale_partials};
pub use states_partials::{states_partials, states_partials_fixed_scaling};
pub use states_states::{states_states, states_states_fixed_scaling};

use crate::real::Real;

/// Per-pattern scale divisor for the fixed-scaling kernels.
#[inline]
pub(crate) fn scale_divisor<R: Real>(factor: R, scalers_log: bool) -> R {
    if scalers_log {
        factor.exp()
    } else {
        factor
    }
}

//! CPU likelihood engine for phylogenetic inference.
//!
//! Peels partial-likelihood vectors up a client-linearised tree,
//! rescales them against underflow, and reduces root or edge buffers to
//! site and sum log-likelihoods (with optional derivatives in the edge
//! length). Generic over `f32`/`f64`; threaded execution fans out over a
//! fixed worker pool and joins before any call returns.

pub mod buffers;
pub mod eigen;
pub mod engine;
pub mod error;
pub mod flags;
pub mod kernels;
pub mod partition;
pub mod pool;
pub mod real;
mod reducers;
mod scaling;
pub mod scheduler;

pub use engine::{EngineDims, InstanceDetails, LikelihoodEngine};
pub use error::{EngineError, Result};
pub use real::Real;
pub use scheduler::{Operation, PartitionOperation};

//! Instance flags and the parsed capability descriptor.
//!
//! Clients hand `create` two u64 bitfields (preferences and hard
//! requirements). They are parsed exactly once into [`Capabilities`];
//! nothing on the hot path re-checks bits.

use crate::error::{EngineError, Result};
use crate::real::Real;

pub const PRECISION_SINGLE: u64 = 1 << 0;
pub const PRECISION_DOUBLE: u64 = 1 << 1;

/// Client drives rescaling through per-op scale indices.
pub const SCALING_MANUAL: u64 = 1 << 2;
/// Kernels extract power-of-two exponents on their own.
pub const SCALING_AUTO: u64 = 1 << 3;
/// Every destination is rescaled on every peel.
pub const SCALING_ALWAYS: u64 = 1 << 4;
/// Manual indices with log-space scale buffers.
pub const SCALING_DYNAMIC: u64 = 1 << 5;

/// Scale buffers hold raw (linear) factors.
pub const SCALERS_RAW: u64 = 1 << 6;
/// Scale buffers hold log factors.
pub const SCALERS_LOG: u64 = 1 << 7;

pub const EIGEN_REAL: u64 = 1 << 8;
pub const EIGEN_COMPLEX: u64 = 1 << 9;

pub const THREADING_ENABLED: u64 = 1 << 10;
pub const THREADING_NONE: u64 = 1 << 11;

/// Split unpartitioned peeling batches across the worker pool.
pub const PARTITIONING_AUTO: u64 = 1 << 12;
/// Only partition work when the client supplies explicit partitions.
pub const PARTITIONING_EXPLICIT: u64 = 1 << 13;

/// Scaling policy, mutually exclusive per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingMode {
    None,
    Manual,
    Dynamic,
    Always,
    Auto,
}

/// Flag bitfields parsed into plain fields.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub scaling: ScalingMode,
    /// Scale buffers hold log factors rather than linear ones.
    pub scalers_log: bool,
    /// Eigenvalues may come in conjugate pairs.
    pub complex_eigen: bool,
    /// Worker-pool threading may be used at all.
    pub threading: bool,
    /// Unpartitioned batches may be pattern-sliced across workers.
    pub auto_partition: bool,
}

impl Capabilities {
    /// Parse preference and requirement words for an instance of
    /// precision `R`. Requirements that cannot be met are an error;
    /// preferences that conflict with each other are too.
    pub fn parse<R: Real>(preference_flags: u64, requirement_flags: u64) -> Result<Self> {
        let flags = preference_flags | requirement_flags;

        if R::IS_DOUBLE && requirement_flags & PRECISION_SINGLE != 0 {
            return Err(EngineError::InvalidConfiguration(
                "single precision required of a double-precision instance",
            ));
        }
        if !R::IS_DOUBLE && requirement_flags & PRECISION_DOUBLE != 0 {
            return Err(EngineError::InvalidConfiguration(
                "double precision required of a single-precision instance",
            ));
        }

        let scaling_bits = [
            (SCALING_MANUAL, ScalingMode::Manual),
            (SCALING_AUTO, ScalingMode::Auto),
            (SCALING_ALWAYS, ScalingMode::Always),
            (SCALING_DYNAMIC, ScalingMode::Dynamic),
        ];
        let mut scaling = ScalingMode::None;
        let mut seen = 0;
        for (bit, mode) in scaling_bits {
            if flags & bit != 0 {
                scaling = mode;
                seen += 1;
            }
        }
        if seen > 1 {
            return Err(EngineError::InvalidConfiguration(
                "more than one scaling policy requested",
            ));
        }

        if flags & SCALERS_RAW != 0 && flags & SCALERS_LOG != 0 {
            return Err(EngineError::InvalidConfiguration(
                "both raw and log scale factors requested",
            ));
        }
        // Dynamic scaling implies log-space buffers.
        let scalers_log = flags & SCALERS_LOG != 0 || scaling == ScalingMode::Dynamic;
        if scaling == ScalingMode::Dynamic && flags & SCALERS_RAW != 0 {
            return Err(EngineError::InvalidConfiguration(
                "dynamic scaling uses log scale factors",
            ));
        }
        if scaling == ScalingMode::Auto && flags & (SCALERS_RAW | SCALERS_LOG) != 0 {
            return Err(EngineError::InvalidConfiguration(
                "auto scaling tracks exponents, not scale factors",
            ));
        }

        if flags & THREADING_ENABLED != 0 && flags & THREADING_NONE != 0 {
            return Err(EngineError::InvalidConfiguration(
                "threading both required and forbidden",
            ));
        }

        Ok(Capabilities {
            scaling,
            scalers_log,
            complex_eigen: flags & EIGEN_COMPLEX != 0,
            threading: flags & THREADING_NONE == 0 && flags & THREADING_ENABLED != 0,
            auto_partition: flags & PARTITIONING_EXPLICIT == 0,
        })
    }

    /// The flag word describing what the instance actually does,
    /// reported back through `instance_details`.
    pub fn effective_flags<R: Real>(&self) -> u64 {
        let mut flags = if R::IS_DOUBLE {
            PRECISION_DOUBLE
        } else {
            PRECISION_SINGLE
        };
        flags |= match self.scaling {
            ScalingMode::None => 0,
            ScalingMode::Manual => SCALING_MANUAL,
            ScalingMode::Dynamic => SCALING_DYNAMIC,
            ScalingMode::Always => SCALING_ALWAYS,
            ScalingMode::Auto => SCALING_AUTO,
        };
        if self.scaling != ScalingMode::Auto {
            flags |= if self.scalers_log { SCALERS_LOG } else { SCALERS_RAW };
        }
        flags |= if self.complex_eigen { EIGEN_COMPLEX } else { EIGEN_REAL };
        flags |= if self.threading { THREADING_ENABLED } else { THREADING_NONE };
        flags |= if self.auto_partition {
            PARTITIONING_AUTO
        } else {
            PARTITIONING_EXPLICIT
        };
        flags
    }
}

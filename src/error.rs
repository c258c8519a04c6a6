//! Status codes for every fallible engine entry point.
//!
//! All public calls return `Result<T, EngineError>`; the engine never
//! panics on bad input and leaves its state unchanged when an error is
//! reported. Numerical underflow is only ever surfaced by the reducers,
//! which are the single point where a non-finite site likelihood becomes
//! observable.

/// Error type for all fallible operations in the engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// An index argument fell outside the range fixed at instance creation.
    #[error("{what} index {index} out of range (count {count})")]
    OutOfRange {
        /// Which index space was violated (e.g. "partials buffer").
        what: &'static str,
        /// The offending index.
        index: usize,
        /// The number of valid slots.
        count: usize,
    },

    /// A buffer was read before anything was stored in it.
    #[error("buffer {index} has not been initialised")]
    UninitialisedBuffer {
        /// The partials/tip slot that was read.
        index: usize,
    },

    /// An input slice had the wrong length for the instance dimensions.
    #[error("{what}: expected length {expected}, got {got}")]
    InvalidDimension {
        /// Which input was mis-sized.
        what: &'static str,
        /// Expected element count.
        expected: usize,
        /// Provided element count.
        got: usize,
    },

    /// A site likelihood came out non-finite during a reduction.
    ///
    /// The recommended client response is to rerun with scaling enabled;
    /// the engine does not retry on its own.
    #[error("site likelihood is non-finite at pattern {pattern}")]
    FloatingPointUnderflow {
        /// First pattern at which the likelihood was non-finite.
        pattern: usize,
    },

    /// The requested flag combination or call sequence is contradictory.
    #[error("conflicting configuration: {0}")]
    InvalidConfiguration(&'static str),

    /// Aligned allocation failed at instance creation.
    #[error("allocation of {bytes} bytes failed")]
    OutOfMemory {
        /// Size of the failed request.
        bytes: usize,
    },

    /// Catch-all for internal invariant violations.
    #[error("general error: {0}")]
    General(&'static str),
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_out_of_range() {
        let e = EngineError::OutOfRange {
            what: "transition matrix",
            index: 9,
            count: 4,
        };
        assert_eq!(
            e.to_string(),
            "transition matrix index 9 out of range (count 4)"
        );
    }

    #[test]
    fn display_underflow() {
        let e = EngineError::FloatingPointUnderflow { pattern: 17 };
        assert_eq!(e.to_string(), "site likelihood is non-finite at pattern 17");
    }
}

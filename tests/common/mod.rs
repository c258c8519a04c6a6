// Shared fixtures for the integration suites.
#![allow(dead_code)]

use ferrous_phylo::{EngineDims, LikelihoodEngine, Operation, Real};

/// Jukes-Cantor eigen decomposition for 4 states.
pub const JC_VECTORS: [f64; 16] = [
    1.0, 2.0, 0.0, 0.5, //
    1.0, -2.0, 0.5, 0.0, //
    1.0, 2.0, 0.0, -0.5, //
    1.0, -2.0, -0.5, 0.0,
];
pub const JC_INVERSE: [f64; 16] = [
    0.25, 0.25, 0.25, 0.25, //
    0.125, -0.125, 0.125, -0.125, //
    0.0, 1.0, 0.0, -1.0, //
    1.0, 0.0, -1.0, 0.0,
];
pub const JC_VALUES: [f64; 4] = [
    0.0,
    -1.3333333333333333,
    -1.3333333333333333,
    -1.3333333333333333,
];

/// Closed form for the 4-state Jukes-Cantor transition probability.
pub fn jc_entry(t: f64, same: bool) -> f64 {
    let e = (-4.0 / 3.0 * t).exp();
    if same {
        0.25 + 0.75 * e
    } else {
        0.25 - 0.25 * e
    }
}

/// Dimensions for a nucleotide instance with compact tips.
pub fn nucleotide_dims(
    tip_count: usize,
    buffer_count: usize,
    pattern_count: usize,
    matrix_count: usize,
    scale_buffer_count: usize,
) -> EngineDims {
    EngineDims {
        tip_count,
        partials_buffer_count: buffer_count,
        compact_buffer_count: tip_count,
        state_count: 4,
        pattern_count,
        eigen_count: 1,
        matrix_count,
        category_count: 1,
        scale_buffer_count,
    }
}

/// Standard single-category Jukes-Cantor setup: eigen slot 0, uniform
/// frequencies, unit weights and rates.
pub fn setup_jc<R: Real>(engine: &mut LikelihoodEngine<R>) {
    engine
        .set_eigen_decomposition(0, &JC_VECTORS, &JC_INVERSE, &JC_VALUES)
        .unwrap();
    engine.set_state_frequencies(0, &[0.25; 4]).unwrap();
    engine.set_category_weights(0, &[1.0]).unwrap();
    engine.set_category_rates(&[1.0]).unwrap();
}

/// A plain peeling op (no scaling).
pub fn op(
    destination: usize,
    child1: usize,
    child1_matrix: usize,
    child2: usize,
    child2_matrix: usize,
) -> Operation {
    Operation {
        destination,
        write_scale: None,
        read_scale: None,
        child1,
        child1_matrix,
        child2,
        child2_matrix,
    }
}

/// Small deterministic generator for reproducible tip data.
pub struct Lcg(pub u64);

impl Lcg {
    pub fn next_state(&mut self, states: i32) -> i32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) % states as u64) as i32
    }
}

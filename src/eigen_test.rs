// Unit tests for eigen decomposition storage and matrix exponentiation.

use super::*;
use crate::buffers::{BufferLayout, BufferPool};

/// Jukes-Cantor decomposition for 4 states.
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

fn jc_store() -> EigenStore {
    let mut store = EigenStore::new(4, 1, false);
    store.set(0, &JC_VECTORS, &JC_INVERSE, &JC_VALUES).unwrap();
    store
}

fn pool(categories: usize, matrices: usize) -> BufferPool<f64> {
    let layout = BufferLayout::new::<f64>(4, 2, categories);
    BufferPool::allocate(layout, 3, 2, matrices, 0, false, 1).unwrap()
}

fn read_matrix(pool: &BufferPool<f64>, index: usize, categories: usize) -> Vec<f64> {
    let mut out = vec![0.0; categories * 16];
    pool.get_transition_matrix(index, &mut out).unwrap();
    out
}

/// Closed form for JC: diagonal and off-diagonal entries.
fn jc_entry(t: f64, same: bool) -> f64 {
    let e = (-4.0 / 3.0 * t).exp();
    if same {
        0.25 + 0.75 * e
    } else {
        0.25 - 0.25 * e
    }
}

#[test]
fn probability_matrix_matches_closed_form() {
    let store = jc_store();
    let mut pool = pool(1, 2);
    update_transition_matrices(&store, &mut pool, 0, &[1.0], &[0], None, None, &[0.37], false)
        .unwrap();
    let m = read_matrix(&pool, 0, 1);
    for i in 0..4 {
        for j in 0..4 {
            let expected = jc_entry(0.37, i == j);
            assert!(
                (m[i * 4 + j] - expected).abs() < 1e-12,
                "P[{i}][{j}] = {} want {expected}",
                m[i * 4 + j]
            );
        }
    }
}

#[test]
fn zero_length_edge_is_identity() {
    let store = jc_store();
    let mut pool = pool(1, 1);
    update_transition_matrices(&store, &mut pool, 0, &[1.0], &[0], None, None, &[0.0], false)
        .unwrap();
    let m = read_matrix(&pool, 0, 1);
    for i in 0..4 {
        for j in 0..4 {
            let expected = if i == j { 1.0 } else { 0.0 };
            assert!((m[i * 4 + j] - expected).abs() < 1e-13);
        }
    }
}

#[test]
fn category_rates_rescale_the_distance() {
    let store = jc_store();
    let mut pool = pool(2, 1);
    update_transition_matrices(
        &store,
        &mut pool,
        0,
        &[0.5, 2.0],
        &[0],
        None,
        None,
        &[0.2],
        false,
    )
    .unwrap();
    let m = read_matrix(&pool, 0, 2);
    assert!((m[0] - jc_entry(0.1, true)).abs() < 1e-12);
    assert!((m[16] - jc_entry(0.4, true)).abs() < 1e-12);
}

#[test]
fn first_derivative_matches_finite_difference() {
    let store = jc_store();
    let mut pool = pool(1, 4);
    let t = 0.3;
    let h = 1e-6;
    update_transition_matrices(
        &store,
        &mut pool,
        0,
        &[1.0],
        &[0, 2, 3],
        None,
        None,
        &[t, t - h, t + h],
        false,
    )
    .unwrap();
    update_transition_matrices(&store, &mut pool, 0, &[1.0], &[0], Some(&[1]), None, &[t], false)
        .unwrap();
    let lo = read_matrix(&pool, 2, 1);
    let hi = read_matrix(&pool, 3, 1);
    let d1 = read_matrix(&pool, 1, 1);
    for k in 0..16 {
        let fd = (hi[k] - lo[k]) / (2.0 * h);
        assert!((d1[k] - fd).abs() < 1e-7, "entry {k}: {} vs {fd}", d1[k]);
    }
}

#[test]
fn semigroup_property_under_convolution() {
    let store = jc_store();
    let mut pool = pool(1, 3);
    update_transition_matrices(
        &store,
        &mut pool,
        0,
        &[1.0],
        &[0, 1],
        None,
        None,
        &[0.1, 0.25],
        false,
    )
    .unwrap();
    convolve_transition_matrices(&mut pool, &[0], &[1], &[2]).unwrap();
    let product = read_matrix(&pool, 2, 1);
    update_transition_matrices(&store, &mut pool, 0, &[1.0], &[0], None, None, &[0.35], false)
        .unwrap();
    let direct = read_matrix(&pool, 0, 1);
    for k in 0..16 {
        assert!((product[k] - direct[k]).abs() < 1e-12);
    }
}

#[test]
fn parallel_batch_matches_serial() {
    let store = jc_store();
    let mut pool_a = pool(1, 4);
    let mut pool_b = pool(1, 4);
    let lens = [0.05, 0.1, 0.2, 0.4];
    update_transition_matrices(
        &store,
        &mut pool_a,
        0,
        &[1.0],
        &[0, 1, 2, 3],
        None,
        None,
        &lens,
        false,
    )
    .unwrap();
    update_transition_matrices(
        &store,
        &mut pool_b,
        0,
        &[1.0],
        &[0, 1, 2, 3],
        None,
        None,
        &lens,
        true,
    )
    .unwrap();
    for i in 0..4 {
        assert_eq!(read_matrix(&pool_a, i, 1), read_matrix(&pool_b, i, 1));
    }
}

mod complex_pairs {
    use super::*;

    const SQ3_2: f64 = 0.8660254037844386; // sqrt(3)/2
    const INV_SQ3: f64 = 0.5773502691896258; // 1/sqrt(3)

    /// Cyclic 3-state rate matrix (A -> B -> C -> A at rate 1); its
    /// spectrum is {0, -1.5 +/- i sqrt(3)/2}.
    fn cyclic_store() -> EigenStore {
        let vectors = [
            1.0, 1.0, 0.0, //
            1.0, -0.5, SQ3_2, //
            1.0, -0.5, -SQ3_2,
        ];
        let inverse = [
            1.0 / 3.0,
            1.0 / 3.0,
            1.0 / 3.0,
            2.0 / 3.0,
            -1.0 / 3.0,
            -1.0 / 3.0,
            0.0,
            INV_SQ3,
            -INV_SQ3,
        ];
        let values = [0.0, -1.5, -1.5, 0.0, SQ3_2, -SQ3_2];
        let mut store = EigenStore::new(3, 1, true);
        store.set(0, &vectors, &inverse, &values).unwrap();
        store
    }

    fn pool3(matrices: usize) -> BufferPool<f64> {
        let layout = BufferLayout::new::<f64>(3, 2, 1);
        BufferPool::allocate(layout, 3, 2, matrices, 0, false, 1).unwrap()
    }

    fn read3(pool: &BufferPool<f64>, index: usize) -> Vec<f64> {
        let mut out = vec![0.0; 9];
        pool.get_transition_matrix(index, &mut out).unwrap();
        out
    }

    #[test]
    fn rotation_blocks_give_a_stochastic_matrix() {
        let store = cyclic_store();
        let mut pool = pool3(1);
        update_transition_matrices(&store, &mut pool, 0, &[1.0], &[0], None, None, &[0.7], false)
            .unwrap();
        let m = read3(&pool, 0);
        for i in 0..3 {
            let row: f64 = m[i * 3..(i + 1) * 3].iter().sum();
            assert!((row - 1.0).abs() < 1e-12, "row {i} sums to {row}");
            for j in 0..3 {
                assert!(m[i * 3 + j] >= 0.0);
            }
        }
        // the cycle direction must show: P[0][1] > P[0][2] at short times
        assert!(m[1] > m[2]);
    }

    #[test]
    fn complex_semigroup() {
        let store = cyclic_store();
        let mut pool = pool3(3);
        update_transition_matrices(
            &store,
            &mut pool,
            0,
            &[1.0],
            &[0, 1],
            None,
            None,
            &[0.3, 0.5],
            false,
        )
        .unwrap();
        convolve_transition_matrices(&mut pool, &[0], &[1], &[2]).unwrap();
        let product = read3(&pool, 2);
        update_transition_matrices(&store, &mut pool, 0, &[1.0], &[0], None, None, &[0.8], false)
            .unwrap();
        let direct = read3(&pool, 0);
        for k in 0..9 {
            assert!((product[k] - direct[k]).abs() < 1e-12);
        }
    }

    #[test]
    fn complex_first_derivative_matches_finite_difference() {
        let store = cyclic_store();
        let mut pool = pool3(4);
        let t = 0.4;
        let h = 1e-6;
        update_transition_matrices(
            &store,
            &mut pool,
            0,
            &[1.0],
            &[2, 3],
            None,
            None,
            &[t - h, t + h],
            false,
        )
        .unwrap();
        let lo = read3(&pool, 2);
        let hi = read3(&pool, 3);
        update_transition_matrices(&store, &mut pool, 0, &[1.0], &[0], Some(&[1]), None, &[t], false)
            .unwrap();
        let d1 = read3(&pool, 1);
        for k in 0..9 {
            let fd = (hi[k] - lo[k]) / (2.0 * h);
            assert!((d1[k] - fd).abs() < 1e-7, "entry {k}: {} vs {fd}", d1[k]);
        }
    }
}

#[test]
fn pair_without_partner_row_is_rejected() {
    let mut store = EigenStore::new(2, 1, true);
    let v = [1.0, 0.0, 0.0, 1.0];
    // imaginary part on the last row has no partner
    let err = store.set(0, &v, &v, &[0.0, -1.0, 0.0, 0.5]).unwrap_err();
    assert!(matches!(err, EngineError::InvalidConfiguration(_)));
}

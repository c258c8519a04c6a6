// Root reduction scenarios on small trees with closed-form answers.

mod common;

use common::*;
use ferrous_phylo::LikelihoodEngine;

/// Two tips joined through one internal node, both edges 0.1.
fn two_tip_engine(tip_a: i32, tip_b: i32) -> LikelihoodEngine<f64> {
    let mut engine = LikelihoodEngine::<f64>::new(nucleotide_dims(2, 3, 1, 2, 0), 0, 0).unwrap();
    setup_jc(&mut engine);
    engine.set_tip_states(0, &[tip_a]).unwrap();
    engine.set_tip_states(1, &[tip_b]).unwrap();
    engine
        .update_transition_matrices(0, &[0, 1], None, None, &[0.1, 0.1])
        .unwrap();
    engine.update_partials(&[op(2, 0, 0, 1, 1)], None).unwrap();
    engine
}

/// Likelihood of the two-tip tree from the closed-form JC matrix.
fn two_tip_expected(tip_a: usize, tip_b: usize) -> f64 {
    let mut total = 0.0;
    for s in 0..4 {
        total += 0.25 * jc_entry(0.1, s == tip_a) * jc_entry(0.1, s == tip_b);
    }
    total.ln()
}

#[test]
fn jukes_cantor_two_tip_tree() {
    let mut engine = two_tip_engine(0, 2); // A and G
    let ll = engine
        .calculate_root_log_likelihoods(&[2], &[0], &[0], &[None])
        .unwrap();
    let expected = two_tip_expected(0, 2);
    assert!(
        (ll - expected).abs() < 1e-9,
        "log-likelihood {ll} differs from closed form {expected}"
    );
    assert_eq!(engine.log_likelihood().unwrap(), ll);

    let mut site = vec![0.0; 1];
    engine.site_log_likelihoods(&mut site).unwrap();
    assert!((site[0] - expected).abs() < 1e-9);
}

#[test]
fn fully_ambiguous_tips_give_zero_log_likelihood() {
    // state index 4 is "missing"; the padding column turns both tips
    // into vectors of ones, so the site likelihood is exactly one
    let mut engine = two_tip_engine(4, 4);
    let ll = engine
        .calculate_root_log_likelihoods(&[2], &[0], &[0], &[None])
        .unwrap();
    assert!(ll.abs() < 1e-12, "expected log(1), got {ll}");
}

#[test]
fn sum_is_pattern_weighted_site_sum() {
    let mut engine = LikelihoodEngine::<f64>::new(nucleotide_dims(2, 3, 4, 2, 0), 0, 0).unwrap();
    setup_jc(&mut engine);
    engine.set_tip_states(0, &[0, 1, 2, 3]).unwrap();
    engine.set_tip_states(1, &[0, 3, 2, 0]).unwrap();
    let weights = [1.0, 2.0, 3.0, 0.5];
    engine.set_pattern_weights(&weights).unwrap();
    engine
        .update_transition_matrices(0, &[0, 1], None, None, &[0.1, 0.1])
        .unwrap();
    engine.update_partials(&[op(2, 0, 0, 1, 1)], None).unwrap();
    let sum = engine
        .calculate_root_log_likelihoods(&[2], &[0], &[0], &[None])
        .unwrap();

    let mut site = vec![0.0; 4];
    engine.site_log_likelihoods(&mut site).unwrap();
    let manual: f64 = site.iter().zip(&weights).map(|(ll, w)| ll * w).sum();
    assert!((sum - manual).abs() < 1e-12);

    for (p, (&a, &b)) in [0usize, 1, 2, 3].iter().zip([0usize, 3, 2, 0].iter()).enumerate() {
        let expected = two_tip_expected(a, b);
        assert!((site[p] - expected).abs() < 1e-9);
    }
}

#[test]
fn zero_weight_pattern_is_inert() {
    let run = |last_state: i32| -> f64 {
        let mut engine =
            LikelihoodEngine::<f64>::new(nucleotide_dims(2, 3, 3, 2, 0), 0, 0).unwrap();
        setup_jc(&mut engine);
        engine.set_tip_states(0, &[0, 1, last_state]).unwrap();
        engine.set_tip_states(1, &[0, 1, 3]).unwrap();
        engine.set_pattern_weights(&[1.0, 2.0, 0.0]).unwrap();
        engine
            .update_transition_matrices(0, &[0, 1], None, None, &[0.1, 0.1])
            .unwrap();
        engine.update_partials(&[op(2, 0, 0, 1, 1)], None).unwrap();
        engine
            .calculate_root_log_likelihoods(&[2], &[0], &[0], &[None])
            .unwrap()
    };
    // the zero-weight pattern's data must not move the sum at all
    assert_eq!(run(0).to_bits(), run(2).to_bits());
}

#[test]
fn repeated_batches_are_byte_identical() {
    let mut engine = LikelihoodEngine::<f64>::new(nucleotide_dims(2, 3, 4, 2, 0), 0, 0).unwrap();
    setup_jc(&mut engine);
    engine.set_tip_states(0, &[0, 1, 2, 3]).unwrap();
    engine.set_tip_states(1, &[3, 1, 0, 2]).unwrap();
    engine
        .update_transition_matrices(0, &[0, 1], None, None, &[0.3, 0.07])
        .unwrap();
    let ops = [op(2, 0, 0, 1, 1)];

    engine.update_partials(&ops, None).unwrap();
    let mut first = vec![0.0; 4 * 4];
    engine.get_partials(2, None, &mut first).unwrap();

    engine.update_partials(&ops, None).unwrap();
    let mut second = vec![0.0; 4 * 4];
    engine.get_partials(2, None, &mut second).unwrap();

    let first_bits: Vec<u64> = first.iter().map(|v| v.to_bits()).collect();
    let second_bits: Vec<u64> = second.iter().map(|v| v.to_bits()).collect();
    assert_eq!(first_bits, second_bits);
}

#[test]
fn tip_partials_match_tip_states() {
    let ll_states = {
        let mut engine = two_tip_engine(0, 2);
        engine
            .calculate_root_log_likelihoods(&[2], &[0], &[0], &[None])
            .unwrap()
    };

    // same tree with tip 1 supplied as one-hot partials; the op then
    // takes the states-partials path via child swapping
    let mut engine = LikelihoodEngine::<f64>::new(nucleotide_dims(2, 3, 1, 2, 0), 0, 0).unwrap();
    setup_jc(&mut engine);
    engine.set_tip_states(0, &[0]).unwrap();
    engine.set_tip_partials(1, &[0.0, 0.0, 1.0, 0.0]).unwrap();
    engine
        .update_transition_matrices(0, &[0, 1], None, None, &[0.1, 0.1])
        .unwrap();
    engine.update_partials(&[op(2, 1, 1, 0, 0)], None).unwrap();
    let ll_partials = engine
        .calculate_root_log_likelihoods(&[2], &[0], &[0], &[None])
        .unwrap();
    assert!((ll_states - ll_partials).abs() < 1e-12);
}

#[test]
fn multi_buffer_root_marginalises() {
    let mut engine = LikelihoodEngine::<f64>::new(nucleotide_dims(2, 4, 1, 2, 0), 0, 0).unwrap();
    setup_jc(&mut engine);
    engine.set_tip_states(0, &[0]).unwrap();
    engine.set_tip_states(1, &[2]).unwrap();
    engine
        .update_transition_matrices(0, &[0, 1], None, None, &[0.1, 0.1])
        .unwrap();
    engine
        .update_partials(&[op(2, 0, 0, 1, 1), op(3, 0, 0, 1, 1)], None)
        .unwrap();

    let single = engine
        .calculate_root_log_likelihoods(&[2], &[0], &[0], &[None])
        .unwrap();
    // two identical components double the site likelihood
    let double = engine
        .calculate_root_log_likelihoods(&[2, 3], &[0, 0], &[0, 0], &[None, None])
        .unwrap();
    assert!((double - single - 2.0f64.ln()).abs() < 1e-12);
}

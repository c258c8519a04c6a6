// Partitioned execution: per-partition sums, pattern reordering, and
// thread-count invariance.

mod common;

use common::*;
use ferrous_phylo::flags;
use ferrous_phylo::{LikelihoodEngine, PartitionOperation};

const PATTERNS: usize = 1000;
const EDGES: [f64; 6] = [0.05, 0.1, 0.15, 0.2, 0.08, 0.12];

fn tip_states() -> Vec<Vec<i32>> {
    let mut rng = Lcg(2024);
    (0..4)
        .map(|_| (0..PATTERNS).map(|_| rng.next_state(4)).collect())
        .collect()
}

/// 300/300/400 split, contiguous.
fn contiguous_ids() -> Vec<i32> {
    let mut ids = vec![0i32; PATTERNS];
    for (p, id) in ids.iter_mut().enumerate() {
        *id = if p < 300 {
            0
        } else if p < 600 {
            1
        } else {
            2
        };
    }
    ids
}

fn build_engine(states: &[Vec<i32>], ids: &[i32]) -> LikelihoodEngine<f64> {
    let mut engine = LikelihoodEngine::<f64>::new(
        nucleotide_dims(4, 7, PATTERNS, 8, 0),
        flags::THREADING_ENABLED,
        0,
    )
    .unwrap();
    setup_jc(&mut engine);
    for (tip, tip_states) in states.iter().enumerate() {
        engine.set_tip_states(tip, tip_states).unwrap();
    }
    engine
        .update_transition_matrices(0, &[0, 1, 2, 3, 4, 5], None, None, &EDGES)
        .unwrap();
    engine.set_pattern_partitions(3, ids).unwrap();
    engine
}

fn partition_ops() -> Vec<PartitionOperation> {
    let mut ops = Vec::new();
    for q in 0..3 {
        for o in [op(4, 0, 0, 1, 1), op(5, 2, 2, 3, 3), op(6, 4, 4, 5, 5)] {
            ops.push(PartitionOperation {
                operation: o,
                partition: q,
                cumulative_scale: None,
            });
        }
    }
    ops
}

fn reduce_by_partition(engine: &mut LikelihoodEngine<f64>) -> ([f64; 3], f64) {
    let mut sums = [0.0; 3];
    let total = engine
        .calculate_root_log_likelihoods_by_partition(
            &[6, 6, 6],
            &[0, 0, 0],
            &[0, 0, 0],
            &[None, None, None],
            &[0, 1, 2],
            &mut sums,
        )
        .unwrap();
    (sums, total)
}

#[test]
fn partition_sums_match_whole_data_sum() {
    let states = tip_states();
    let mut engine = build_engine(&states, &contiguous_ids());
    engine.update_partials_by_partition(&partition_ops()).unwrap();

    let (sums, total) = reduce_by_partition(&mut engine);
    let whole = engine
        .calculate_root_log_likelihoods(&[6], &[0], &[0], &[None])
        .unwrap();

    let stitched: f64 = sums.iter().sum();
    assert!((stitched - whole).abs() < 1e-9 * whole.abs());
    assert!((total - whole).abs() < 1e-9 * whole.abs());
}

#[test]
fn interleaved_ids_reorder_to_the_same_answer() {
    let states = tip_states();
    let ids = contiguous_ids();

    let mut reference = build_engine(&states, &ids);
    reference.update_partials_by_partition(&partition_ops()).unwrap();
    let (ref_sums, ref_total) = reduce_by_partition(&mut reference);
    let mut ref_site = vec![0.0; PATTERNS];
    reference.site_log_likelihoods(&mut ref_site).unwrap();

    // present the same patterns in a shuffled client order
    let sigma: Vec<usize> = (0..PATTERNS).map(|q| (q * 7 + 3) % PATTERNS).collect();
    let shuffled_states: Vec<Vec<i32>> = states
        .iter()
        .map(|tip| sigma.iter().map(|&p| tip[p]).collect())
        .collect();
    let shuffled_ids: Vec<i32> = sigma.iter().map(|&p| ids[p]).collect();

    let mut engine = build_engine(&shuffled_states, &shuffled_ids);
    engine.update_partials_by_partition(&partition_ops()).unwrap();
    let (sums, total) = reduce_by_partition(&mut engine);

    for q in 0..3 {
        assert!(
            (sums[q] - ref_sums[q]).abs() < 1e-9 * ref_sums[q].abs(),
            "partition {q}: {} vs {}",
            sums[q],
            ref_sums[q]
        );
    }
    assert!((total - ref_total).abs() < 1e-9 * ref_total.abs());

    // site vectors come back in each client's own pattern order
    let mut site = vec![0.0; PATTERNS];
    engine.site_log_likelihoods(&mut site).unwrap();
    for q in 0..PATTERNS {
        assert!((site[q] - ref_site[sigma[q]]).abs() < 1e-12);
    }
}

#[test]
fn thread_count_invariance() {
    let states = tip_states();
    let mut results = Vec::new();
    for threads in [1usize, 2, 4, 8] {
        let mut engine = build_engine(&states, &contiguous_ids());
        engine.set_thread_count(threads).unwrap();
        engine.update_partials_by_partition(&partition_ops()).unwrap();
        let (sums, total) = reduce_by_partition(&mut engine);
        results.push((threads, sums, total));
    }
    let (_, base_sums, base_total) = results[0];
    for (threads, sums, total) in &results[1..] {
        assert!(
            ((total - base_total) / base_total).abs() < 1e-12,
            "threadCount={threads}: {total} vs {base_total}"
        );
        for q in 0..3 {
            assert!(((sums[q] - base_sums[q]) / base_sums[q]).abs() < 1e-12);
        }
    }
}

#[test]
fn pattern_sliced_peeling_matches_serial() {
    let states = tip_states();
    let ops = [op(4, 0, 0, 1, 1), op(5, 2, 2, 3, 3), op(6, 4, 4, 5, 5)];

    let mut serial = build_engine(&states, &contiguous_ids());
    serial.update_partials(&ops, None).unwrap();
    let serial_ll = serial
        .calculate_root_log_likelihoods(&[6], &[0], &[0], &[None])
        .unwrap();

    let mut threaded = build_engine(&states, &contiguous_ids());
    threaded.set_thread_count(4).unwrap();
    threaded.update_partials(&ops, None).unwrap();
    let threaded_ll = threaded
        .calculate_root_log_likelihoods(&[6], &[0], &[0], &[None])
        .unwrap();

    // every pattern is computed by exactly one worker with the same
    // kernel, so the reduction sees identical inputs
    assert_eq!(serial_ll.to_bits(), threaded_ll.to_bits());
}

#[test]
fn partitioned_edge_reduction_matches_whole() {
    let states = tip_states();
    let mut engine = build_engine(&states, &contiguous_ids());
    engine.update_partials_by_partition(&partition_ops()).unwrap();
    // derivative matrices for the edge joining buffer 4 to tip 2
    engine
        .update_transition_matrices(0, &[2], Some(&[6]), Some(&[7]), &[0.15])
        .unwrap();

    let whole = engine
        .calculate_edge_log_likelihoods(
            &[4],
            &[2],
            &[2],
            Some(&[6]),
            Some(&[7]),
            &[0],
            &[0],
            &[None],
        )
        .unwrap();
    let (whole_d1, whole_d2) = engine.derivatives().unwrap();

    for threads in [1usize, 4] {
        engine.set_thread_count(threads).unwrap();
        let mut sums = [0.0; 3];
        let mut d1s = [0.0; 3];
        let mut d2s = [0.0; 3];
        let total = engine
            .calculate_edge_log_likelihoods_by_partition(
                &[4, 4, 4],
                &[2, 2, 2],
                &[2, 2, 2],
                Some(&[6, 6, 6]),
                Some(&[7, 7, 7]),
                &[0, 0, 0],
                &[0, 0, 0],
                &[None, None, None],
                &[0, 1, 2],
                &mut sums,
                Some(&mut d1s),
                Some(&mut d2s),
            )
            .unwrap();
        assert!(
            (total - whole).abs() < 1e-9 * whole.abs(),
            "threads={threads}: {total} vs {whole}"
        );
        let (d1, d2) = engine.derivatives().unwrap();
        assert!((d1 - whole_d1).abs() < 1e-9 * whole_d1.abs().max(1.0));
        assert!((d2 - whole_d2).abs() < 1e-9 * whole_d2.abs().max(1.0));
        assert!((sums.iter().sum::<f64>() - whole).abs() < 1e-9 * whole.abs());
    }
}

#[test]
fn barriers_return_immediately_when_idle() {
    let states = tip_states();
    let mut engine = build_engine(&states, &contiguous_ids());
    engine.set_thread_count(4).unwrap();
    engine.update_partials_by_partition(&partition_ops()).unwrap();
    engine.wait_for_partials(&[4, 5, 6]).unwrap();
    engine.block().unwrap();
    assert!(engine.wait_for_partials(&[99]).is_err());
}

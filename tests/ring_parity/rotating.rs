//! Rotating p2p ring strategy against the single-call reference.

use super::helpers::*;
use ring_attn::{AttentionParams, CommStrategy, RingAttentionConfig};

fn config() -> RingAttentionConfig {
    RingAttentionConfig {
        strategy: CommStrategy::RotatingRing,
        ..Default::default()
    }
}

#[test]
fn test_rotating_causal_two_ranks() {
    let problem = Problem::new(&[0, 6, 16], 4, 2, 8, AttentionParams::causal());
    let results = run_ring(&problem, 2, config());
    assert_matches_reference(&problem, &results, &reference(&problem), "rotating causal");
}

#[test]
fn test_rotating_causal_four_ranks_boundary_on_rank_edge() {
    // L = 4: sequence 1 ends exactly on the rank 1 / rank 2 edge
    let problem = Problem::new(&[0, 3, 8, 11, 16], 4, 4, 4, AttentionParams::causal());
    let results = run_ring(&problem, 4, config());
    assert_matches_reference(&problem, &results, &reference(&problem), "rotating causal 4 ranks");
}

#[test]
fn test_rotating_non_causal_sequence_spans_three_ranks() {
    let problem = Problem::new(&[0, 12], 2, 2, 4, AttentionParams::default());
    let results = run_ring(&problem, 3, config());
    assert_matches_reference(&problem, &results, &reference(&problem), "rotating non-causal span");
}

#[test]
fn test_rotating_non_causal_mixed_lengths_gqa() {
    let problem = Problem::new(&[0, 2, 9, 12], 4, 2, 4, AttentionParams::default());
    let results = run_ring(&problem, 3, config());
    assert_matches_reference(&problem, &results, &reference(&problem), "rotating non-causal gqa");
}

#[test]
fn test_strategies_agree() {
    for params in [AttentionParams::causal(), AttentionParams::default()] {
        let problem = Problem::new(&[0, 5, 7, 16], 2, 2, 4, params);
        let ring = run_ring(&problem, 4, config());
        let gathered = run_ring(&problem, 4, RingAttentionConfig::default());
        for (rank, (a, b)) in ring.iter().zip(&gathered).enumerate() {
            let op = format!("strategies rank {rank} causal={}", problem.params.causal);
            assert_parity_f32_relaxed(&a.out, &b.out, &op);
            assert_parity_f32_relaxed(&a.lse, &b.lse, &op);
            assert_parity_f32_relaxed(&a.dq, &b.dq, &op);
            assert_parity_f32_relaxed(&a.dk, &b.dk, &op);
            assert_parity_f32_relaxed(&a.dv, &b.dv, &op);
        }
    }
}

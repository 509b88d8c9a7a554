//! Head-window all-gather strategy against the single-call reference.

use super::helpers::*;
use ring_attn::{AttentionParams, CommStrategy, RingAttentionConfig};

fn config(heads_k_stride: Option<usize>) -> RingAttentionConfig {
    RingAttentionConfig {
        strategy: CommStrategy::HeadWindowAllGather,
        heads_k_stride,
        ..Default::default()
    }
}

#[test]
fn test_head_window_causal_two_ranks() {
    // Second sequence straddles the rank boundary
    let problem = Problem::new(&[0, 6, 16], 4, 2, 8, AttentionParams::causal());
    let results = run_ring(&problem, 2, config(None));
    assert_matches_reference(&problem, &results, &reference(&problem), "head_window causal");
}

#[test]
fn test_head_window_single_rank_is_plain_attention() {
    let problem = Problem::new(&[0, 3, 5, 8], 2, 2, 4, AttentionParams::causal());
    let results = run_ring(&problem, 1, config(None));
    assert_matches_reference(&problem, &results, &reference(&problem), "head_window world=1");
}

#[test]
fn test_head_window_non_causal_sequence_spans_three_ranks() {
    let problem = Problem::new(&[0, 12], 2, 2, 4, AttentionParams::default());
    let results = run_ring(&problem, 3, config(None));
    assert_matches_reference(&problem, &results, &reference(&problem), "head_window non-causal span");
}

#[test]
fn test_head_window_gqa_stride_below_kv_heads() {
    // Four windows of one KV head, each serving two query heads
    let problem = Problem::new(&[0, 3, 9, 10, 16], 8, 4, 4, AttentionParams::causal());
    let results = run_ring(&problem, 4, config(Some(1)));
    assert_matches_reference(&problem, &results, &reference(&problem), "head_window gqa stride=1");
}

#[test]
fn test_head_window_stride_does_not_change_result() {
    let problem = Problem::new(&[0, 5, 12], 4, 4, 4, AttentionParams::default());
    let full = run_ring(&problem, 2, config(None));
    let windowed = run_ring(&problem, 2, config(Some(2)));
    for (rank, (a, b)) in full.iter().zip(&windowed).enumerate() {
        let op = format!("stride parity rank {rank}");
        assert_parity_f32_relaxed(&b.out, &a.out, &op);
        assert_parity_f32_relaxed(&b.lse, &a.lse, &op);
        assert_parity_f32_relaxed(&b.dk, &a.dk, &op);
        assert_parity_f32_relaxed(&b.dv, &a.dv, &op);
    }
}

#[test]
fn test_head_window_causal_sliding_window() {
    let params = AttentionParams {
        window_size: (3, 0),
        ..AttentionParams::causal()
    };
    let problem = Problem::new(&[0, 2, 12], 2, 1, 4, params);
    let results = run_ring(&problem, 2, config(None));
    assert_matches_reference(&problem, &results, &reference(&problem), "head_window sliding");
}

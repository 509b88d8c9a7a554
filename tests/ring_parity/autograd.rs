//! Var-level ring attention on a multi-rank group.

use std::sync::Arc;

use super::helpers::*;
use numr::autograd::{Var, backward, var_mul, var_sum};
use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::tensor::Tensor;
use ring_attn::{
    AttentionParams, CommStrategy, CpuVarlenKernel, LocalProcessGroup, ProcessGroup,
    RingAttention, RingAttentionConfig, RingAttentionCtx, compute_rank_shard, var_ring_attention,
    var_ring_attention_qkvpacked,
};

/// Run `var_ring_attention` with `loss = sum(out * dout)` so the gradients
/// reaching q, k and v match the reference backward for `dout`.
fn run_autograd(problem: &Problem, world_size: usize, config: RingAttentionConfig) -> Vec<RankResult> {
    init_tracing();
    let (_client, device) = setup_cpu();
    let groups = LocalProcessGroup::new_group(world_size, &device).unwrap();
    let len = problem.total() / world_size;
    let q_width = problem.num_heads * problem.head_dim;
    let kv_width = problem.num_kv_heads * problem.head_dim;

    std::thread::scope(|s| {
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                let device = device.clone();
                let config = config.clone();
                s.spawn(move || {
                    let client = CpuClient::new(device.clone());
                    let rank = group.rank();
                    let ctx = RingAttentionCtx {
                        engine: Arc::new(
                            RingAttention::new(config, Arc::new(CpuVarlenKernel), Arc::new(group))
                                .unwrap(),
                        ),
                        shard: compute_rank_shard(
                            &problem.cu_seqlens,
                            problem.params.causal,
                            rank,
                            world_size,
                        )
                        .unwrap(),
                        params: problem.params.clone(),
                    };

                    let local = |data: &[f32], width: usize, heads: usize| {
                        Tensor::<CpuRuntime>::from_slice(
                            &rank_rows(data, width, rank, len),
                            &[len, heads, problem.head_dim],
                            &device,
                        )
                    };
                    let q = Var::new(local(&problem.q, q_width, problem.num_heads), true);
                    let k = Var::new(local(&problem.k, kv_width, problem.num_kv_heads), true);
                    let v = Var::new(local(&problem.v, kv_width, problem.num_kv_heads), true);
                    let dout = Var::new(local(&problem.dout, q_width, problem.num_heads), false);

                    let res = var_ring_attention(&q, &k, &v, &ctx).unwrap();
                    let weighted = var_mul(&res.out, &dout, &client).unwrap();
                    let loss = var_sum(&weighted, &[], false, &client).unwrap();
                    let grads = backward(&loss, &client).unwrap();

                    RankResult {
                        out: res.out.tensor().to_vec::<f32>(),
                        lse: res.lse.to_vec::<f32>(),
                        dq: grads.get(q.id()).unwrap().to_vec::<f32>(),
                        dk: grads.get(k.id()).unwrap().to_vec::<f32>(),
                        dv: grads.get(v.id()).unwrap().to_vec::<f32>(),
                    }
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn test_autograd_head_window_matches_reference() {
    let problem = Problem::new(&[0, 6, 16], 4, 2, 4, AttentionParams::causal());
    let results = run_autograd(&problem, 2, RingAttentionConfig::default());
    assert_matches_reference(&problem, &results, &reference(&problem), "autograd head_window");
}

#[test]
fn test_autograd_rotating_matches_reference() {
    let problem = Problem::new(&[0, 4, 12], 2, 2, 4, AttentionParams::default());
    let config = RingAttentionConfig {
        strategy: CommStrategy::RotatingRing,
        ..Default::default()
    };
    let results = run_autograd(&problem, 3, config);
    assert_matches_reference(&problem, &results, &reference(&problem), "autograd rotating");
}

#[test]
fn test_qkvpacked_gradient_layout() {
    let (client, device) = setup_cpu();
    let group = LocalProcessGroup::new_group(1, &device).unwrap().remove(0);
    let ctx = RingAttentionCtx {
        engine: Arc::new(
            RingAttention::new(
                RingAttentionConfig::default(),
                Arc::new(CpuVarlenKernel),
                Arc::new(group),
            )
            .unwrap(),
        ),
        shard: compute_rank_shard(&[0, 4], true, 0, 1).unwrap(),
        params: AttentionParams::causal(),
    };

    let qkv = Var::new(
        Tensor::<CpuRuntime>::from_slice(&det_data(4 * 3 * 2 * 4, 0.29), &[4, 3, 2, 4], &device),
        true,
    );
    let res = var_ring_attention_qkvpacked(&qkv, &ctx).unwrap();
    assert_eq!(res.out.tensor().shape(), &[4, 2, 4]);
    assert_eq!(res.lse.shape(), &[2, 4]);

    let loss = var_sum(&res.out, &[], false, &client).unwrap();
    let grads = backward(&loss, &client).unwrap();
    let d_qkv = grads.get(qkv.id()).unwrap();
    assert_eq!(d_qkv.shape(), &[4, 3, 2, 4]);
    assert!(d_qkv.to_vec::<f32>().iter().all(|g| g.is_finite()));
}

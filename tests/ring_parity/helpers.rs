//! Shared helpers for ring attention parity tests.
//!
//! Every test builds one packed global problem, runs it through a
//! `world_size`-rank [`LocalProcessGroup`] on threads, and compares each rank's
//! slice of the result with a single call of the reference kernel over the
//! whole packed batch.

use std::sync::{Arc, Once};

use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
use numr::tensor::Tensor;
use ring_attn::{
    AttentionParams, CpuVarlenKernel, LocalProcessGroup, ProcessGroup, RingAttention,
    RingAttentionConfig, VarlenAttentionKernel, VarlenBatch, compute_rank_shard,
};

static TRACING: Once = Once::new();

/// Route `RUST_LOG` filtered engine logs to the test writer.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn setup_cpu() -> (CpuClient, CpuDevice) {
    let device = CpuDevice::new();
    let client = CpuClient::new(device.clone());
    (client, device)
}

/// Deterministic pseudo-random data using a sin-based pattern.
pub fn det_data(n: usize, freq: f32) -> Vec<f32> {
    (0..n).map(|i| (i as f32 * freq).sin() * 0.5).collect()
}

pub fn assert_parity_f32_tol(a: &[f32], b: &[f32], op: &str, rtol: f32, atol: f32) {
    assert_eq!(
        a.len(),
        b.len(),
        "parity_f32[{}]: length mismatch: {} vs {}",
        op,
        a.len(),
        b.len()
    );
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = (x - y).abs();
        let tol = atol + rtol * y.abs();
        if diff > tol {
            panic!(
                "parity_f32[{}] at index {}: {} vs {} (diff={}, tol={})",
                op, i, x, y, diff, tol
            );
        }
    }
}

/// Relaxed parity check: blockwise merging reorders the float reductions.
pub fn assert_parity_f32_relaxed(a: &[f32], b: &[f32], op: &str) {
    assert_parity_f32_tol(a, b, op, 1e-4, 1e-5);
}

/// A packed global attention problem.
pub struct Problem {
    pub cu_seqlens: Vec<i32>,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub params: AttentionParams,
    pub q: Vec<f32>,
    pub k: Vec<f32>,
    pub v: Vec<f32>,
    pub dout: Vec<f32>,
}

impl Problem {
    pub fn new(
        cu_seqlens: &[i32],
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        params: AttentionParams,
    ) -> Self {
        let total = *cu_seqlens.last().unwrap() as usize;
        let q_len = total * num_heads * head_dim;
        let kv_len = total * num_kv_heads * head_dim;
        Self {
            cu_seqlens: cu_seqlens.to_vec(),
            num_heads,
            num_kv_heads,
            head_dim,
            params,
            q: det_data(q_len, 0.37),
            k: det_data(kv_len, 0.71),
            v: det_data(kv_len, 1.13),
            dout: det_data(q_len, 0.53),
        }
    }

    pub fn total(&self) -> usize {
        *self.cu_seqlens.last().unwrap() as usize
    }

    fn q_shape(&self, rows: usize) -> [usize; 3] {
        [rows, self.num_heads, self.head_dim]
    }

    fn kv_shape(&self, rows: usize) -> [usize; 3] {
        [rows, self.num_kv_heads, self.head_dim]
    }
}

/// One rank's results, as host vectors.
pub struct RankResult {
    pub out: Vec<f32>,
    /// `[H, L]`
    pub lse: Vec<f32>,
    pub dq: Vec<f32>,
    pub dk: Vec<f32>,
    pub dv: Vec<f32>,
}

/// Rows `[rank * L, (rank + 1) * L)` of a `[T, width]` row-major buffer.
pub fn rank_rows(data: &[f32], width: usize, rank: usize, rows_per_rank: usize) -> Vec<f32> {
    data[rank * rows_per_rank * width..(rank + 1) * rows_per_rank * width].to_vec()
}

/// Run forward and backward on every rank of a `world_size` group.
pub fn run_ring(problem: &Problem, world_size: usize, config: RingAttentionConfig) -> Vec<RankResult> {
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
                    let shard =
                        compute_rank_shard(&problem.cu_seqlens, problem.params.causal, rank, world_size)
                            .unwrap();
                    let engine = RingAttention::new(
                        config,
                        Arc::new(CpuVarlenKernel),
                        Arc::new(group),
                    )
                    .unwrap();

                    let local = |data: &[f32], width: usize, shape: [usize; 3]| {
                        Tensor::<CpuRuntime>::from_slice(
                            &rank_rows(data, width, rank, len),
                            &shape,
                            &device,
                        )
                    };
                    let q = local(&problem.q, q_width, problem.q_shape(len));
                    let k = local(&problem.k, kv_width, problem.kv_shape(len));
                    let v = local(&problem.v, kv_width, problem.kv_shape(len));
                    let dout = local(&problem.dout, q_width, problem.q_shape(len));

                    let (out, lse) = engine
                        .forward(&client, &q, &k, &v, &shard, &problem.params)
                        .unwrap();
                    let (dq, dk, dv) = engine
                        .backward(&client, &dout, &q, &k, &v, &out, &lse, &shard, &problem.params)
                        .unwrap();
                    RankResult {
                        out: out.to_vec::<f32>(),
                        lse: lse.to_vec::<f32>(),
                        dq: dq.to_vec::<f32>(),
                        dk: dk.to_vec::<f32>(),
                        dv: dv.to_vec::<f32>(),
                    }
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// Single reference kernel call over the whole packed batch.
pub fn reference(problem: &Problem) -> RankResult {
    let (_client, device) = setup_cpu();
    let total = problem.total();
    let q = Tensor::<CpuRuntime>::from_slice(&problem.q, &problem.q_shape(total), &device);
    let k = Tensor::<CpuRuntime>::from_slice(&problem.k, &problem.kv_shape(total), &device);
    let v = Tensor::<CpuRuntime>::from_slice(&problem.v, &problem.kv_shape(total), &device);
    let dout = Tensor::<CpuRuntime>::from_slice(&problem.dout, &problem.q_shape(total), &device);

    let kernel = CpuVarlenKernel;
    let params = problem
        .params
        .resolve(problem.head_dim, &kernel.abi())
        .unwrap();
    let batch = VarlenBatch::<CpuRuntime>::new(&problem.cu_seqlens, &problem.cu_seqlens, &device);
    let (out, lse) = kernel.forward(&q, &k, &v, &batch, &params).unwrap();
    let (dq, dk, dv) = kernel
        .backward(&dout, &q, &k, &v, &out, &lse, &batch, &params)
        .unwrap();
    RankResult {
        out: out.to_vec::<f32>(),
        lse: lse.to_vec::<f32>(),
        dq: dq.to_vec::<f32>(),
        dk: dk.to_vec::<f32>(),
        dv: dv.to_vec::<f32>(),
    }
}

/// Check every rank's outputs and gradients against its slice of `expected`.
pub fn assert_matches_reference(problem: &Problem, results: &[RankResult], expected: &RankResult, op: &str) {
    let world_size = results.len();
    let total = problem.total();
    let len = total / world_size;
    let q_width = problem.num_heads * problem.head_dim;
    let kv_width = problem.num_kv_heads * problem.head_dim;

    for (rank, got) in results.iter().enumerate() {
        let tag = |what: &str| format!("{op} rank {rank} {what}");
        assert_parity_f32_relaxed(&got.out, &rank_rows(&expected.out, q_width, rank, len), &tag("out"));

        let lse: Vec<f32> = (0..problem.num_heads)
            .flat_map(|h| expected.lse[h * total + rank * len..h * total + (rank + 1) * len].to_vec())
            .collect();
        assert_parity_f32_relaxed(&got.lse, &lse, &tag("lse"));

        assert_parity_f32_relaxed(&got.dq, &rank_rows(&expected.dq, q_width, rank, len), &tag("dq"));
        assert_parity_f32_relaxed(&got.dk, &rank_rows(&expected.dk, kv_width, rank, len), &tag("dk"));
        assert_parity_f32_relaxed(&got.dv, &rank_rows(&expected.dv, kv_width, rank, len), &tag("dv"));
    }
}

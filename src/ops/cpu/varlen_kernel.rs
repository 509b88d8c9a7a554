//! CPU reference kernel for variable-length attention
//!
//! Walks each packed sequence and runs standard softmax attention per
//! `(sequence, head, query)` row, with GQA head mapping, bottom-right aligned
//! causal masking and sliding windows. Exact but O(n²); it exists so the ring
//! engine can run and be checked on a single host.

use crate::error::{Error, Result};
use crate::ops::traits::{KernelAbi, KernelParams, VarlenAttentionKernel, VarlenBatch};
use numr::dtype::DType;
use numr::runtime::cpu::CpuRuntime;
use numr::tensor::Tensor;

/// Reference [`VarlenAttentionKernel`] for [`CpuRuntime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuVarlenKernel;

/// Shape facts shared by forward and backward.
struct Dims {
    total_q: usize,
    total_k: usize,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Dims {
    fn of(q: &Tensor<CpuRuntime>, k: &Tensor<CpuRuntime>, v: &Tensor<CpuRuntime>) -> Result<Self> {
        for (arg, t) in [("q", q), ("k", k), ("v", v)] {
            if t.shape().len() != 3 {
                return Err(Error::InvalidArgument {
                    arg,
                    reason: format!("expected 3D [tokens, heads, head_dim], got {:?}", t.shape()),
                });
            }
            if t.dtype() != DType::F32 {
                return Err(Error::DTypeMismatch {
                    expected: DType::F32,
                    got: t.dtype(),
                });
            }
        }
        if k.shape() != v.shape() {
            return Err(Error::InvalidArgument {
                arg: "v",
                reason: format!("k {:?} and v {:?} must match", k.shape(), v.shape()),
            });
        }
        let (num_heads, num_kv_heads) = (q.shape()[1], k.shape()[1]);
        if num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
            return Err(Error::InvalidArgument {
                arg: "k",
                reason: format!(
                    "num_heads ({num_heads}) must be a multiple of num_kv_heads ({num_kv_heads})"
                ),
            });
        }
        if q.shape()[2] != k.shape()[2] {
            return Err(Error::InvalidArgument {
                arg: "k",
                reason: format!("head_dim mismatch: q {} vs k {}", q.shape()[2], k.shape()[2]),
            });
        }
        Ok(Self {
            total_q: q.shape()[0],
            total_k: k.shape()[0],
            num_heads,
            num_kv_heads,
            head_dim: q.shape()[2],
        })
    }

    fn check_batch(&self, batch: &VarlenBatch<CpuRuntime>) -> Result<()> {
        let (cu_q, cu_k) = (&batch.host_cu_seqlens_q, &batch.host_cu_seqlens_k);
        if cu_q.len() != cu_k.len() || cu_q.is_empty() {
            return Err(Error::InvalidArgument {
                arg: "cu_seqlens",
                reason: format!(
                    "cu_seqlens_q ({}) and cu_seqlens_k ({}) must have the same non-zero length",
                    cu_q.len(),
                    cu_k.len()
                ),
            });
        }
        let q_end = *cu_q.last().unwrap_or(&0) as usize;
        let k_end = *cu_k.last().unwrap_or(&0) as usize;
        if q_end > self.total_q || k_end > self.total_k {
            return Err(Error::InvalidArgument {
                arg: "cu_seqlens",
                reason: format!(
                    "layout covers q={q_end}, k={k_end} tokens but tensors hold q={}, k={}",
                    self.total_q, self.total_k
                ),
            });
        }
        Ok(())
    }

    fn q_off(&self, token: usize, head: usize) -> usize {
        (token * self.num_heads + head) * self.head_dim
    }

    fn kv_off(&self, token: usize, kv_head: usize) -> usize {
        (token * self.num_kv_heads + kv_head) * self.head_dim
    }
}

/// Whether query `qi` of a `sq`-query sequence sees key `ki` of its `sk` keys.
fn visible(qi: usize, ki: usize, sq: usize, sk: usize, params: &KernelParams) -> bool {
    let diag = qi as isize + sk as isize - sq as isize;
    let ki = ki as isize;
    let (left, right) = params.window_size;
    if params.causal && ki > diag {
        return false;
    }
    if left >= 0 && ki < diag - left {
        return false;
    }
    if right >= 0 && ki > diag + right {
        return false;
    }
    true
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

impl VarlenAttentionKernel<CpuRuntime> for CpuVarlenKernel {
    fn abi(&self) -> KernelAbi {
        KernelAbi::CPU_REFERENCE
    }

    fn forward(
        &self,
        q: &Tensor<CpuRuntime>,
        k: &Tensor<CpuRuntime>,
        v: &Tensor<CpuRuntime>,
        batch: &VarlenBatch<CpuRuntime>,
        params: &KernelParams,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        let dims = Dims::of(q, k, v)?;
        dims.check_batch(batch)?;
        let device = q.device();
        let d = dims.head_dim;
        let group = dims.num_heads / dims.num_kv_heads;
        let scale = params.softmax_scale as f32;

        let q_data = q.contiguous().to_vec::<f32>();
        let k_data = k.contiguous().to_vec::<f32>();
        let v_data = v.contiguous().to_vec::<f32>();
        let cu_q = &batch.host_cu_seqlens_q;
        let cu_k = &batch.host_cu_seqlens_k;

        let mut out = vec![0.0f32; dims.total_q * dims.num_heads * d];
        // Rows outside every sequence keep -inf, like rows with no visible key
        let mut lse = vec![f32::NEG_INFINITY; dims.num_heads * dims.total_q];
        let mut scores = Vec::new();

        for b in 0..batch.batch_size() {
            let (sq_start, sk_start) = (cu_q[b] as usize, cu_k[b] as usize);
            let seq_len_q = cu_q[b + 1] as usize - sq_start;
            let seq_len_k = cu_k[b + 1] as usize - sk_start;

            for h in 0..dims.num_heads {
                let kv_h = h / group;
                for qi in 0..seq_len_q {
                    let q_off = dims.q_off(sq_start + qi, h);
                    let q_row = &q_data[q_off..q_off + d];

                    scores.clear();
                    let mut max_score = f32::NEG_INFINITY;
                    for ki in 0..seq_len_k {
                        if !visible(qi, ki, seq_len_q, seq_len_k, params) {
                            continue;
                        }
                        let k_off = dims.kv_off(sk_start + ki, kv_h);
                        let s = dot(q_row, &k_data[k_off..k_off + d]) * scale;
                        max_score = max_score.max(s);
                        scores.push((ki, s));
                    }
                    if scores.is_empty() {
                        continue;
                    }

                    let sum_exp: f32 = scores.iter().map(|&(_, s)| (s - max_score).exp()).sum();
                    let o_row = &mut out[q_off..q_off + d];
                    for &(ki, s) in &scores {
                        let weight = (s - max_score).exp() / sum_exp;
                        let v_off = dims.kv_off(sk_start + ki, kv_h);
                        for (o, &vv) in o_row.iter_mut().zip(&v_data[v_off..v_off + d]) {
                            *o += weight * vv;
                        }
                    }
                    lse[h * dims.total_q + sq_start + qi] = max_score + sum_exp.ln();
                }
            }
        }

        let output =
            Tensor::<CpuRuntime>::from_slice(&out, &[dims.total_q, dims.num_heads, d], device);
        let lse_tensor =
            Tensor::<CpuRuntime>::from_slice(&lse, &[dims.num_heads, dims.total_q], device);
        Ok((output, lse_tensor))
    }

    fn backward(
        &self,
        dout: &Tensor<CpuRuntime>,
        q: &Tensor<CpuRuntime>,
        k: &Tensor<CpuRuntime>,
        v: &Tensor<CpuRuntime>,
        output: &Tensor<CpuRuntime>,
        lse: &Tensor<CpuRuntime>,
        batch: &VarlenBatch<CpuRuntime>,
        params: &KernelParams,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        let dims = Dims::of(q, k, v)?;
        dims.check_batch(batch)?;
        if dout.shape() != q.shape() || output.shape() != q.shape() {
            return Err(Error::InvalidArgument {
                arg: "dout",
                reason: format!(
                    "dout {:?} and output {:?} must match q {:?}",
                    dout.shape(),
                    output.shape(),
                    q.shape()
                ),
            });
        }
        if lse.shape() != [dims.num_heads, dims.total_q] {
            return Err(Error::InvalidArgument {
                arg: "lse",
                reason: format!(
                    "expected [{}, {}], got {:?}",
                    dims.num_heads,
                    dims.total_q,
                    lse.shape()
                ),
            });
        }
        let device = q.device();
        let d = dims.head_dim;
        let group = dims.num_heads / dims.num_kv_heads;
        let scale = params.softmax_scale as f32;

        let q_data = q.contiguous().to_vec::<f32>();
        let k_data = k.contiguous().to_vec::<f32>();
        let v_data = v.contiguous().to_vec::<f32>();
        let o_data = output.contiguous().to_vec::<f32>();
        let do_data = dout.contiguous().to_vec::<f32>();
        let lse_data = lse.contiguous().to_vec::<f32>();
        let cu_q = &batch.host_cu_seqlens_q;
        let cu_k = &batch.host_cu_seqlens_k;

        let mut dq = vec![0.0f32; dims.total_q * dims.num_heads * d];
        let mut dk = vec![0.0f32; dims.total_k * dims.num_kv_heads * d];
        let mut dv = vec![0.0f32; dims.total_k * dims.num_kv_heads * d];

        for b in 0..batch.batch_size() {
            let (sq_start, sk_start) = (cu_q[b] as usize, cu_k[b] as usize);
            let seq_len_q = cu_q[b + 1] as usize - sq_start;
            let seq_len_k = cu_k[b + 1] as usize - sk_start;

            for h in 0..dims.num_heads {
                let kv_h = h / group;
                for qi in 0..seq_len_q {
                    let l = lse_data[h * dims.total_q + sq_start + qi];
                    if l == f32::NEG_INFINITY {
                        continue;
                    }
                    let q_off = dims.q_off(sq_start + qi, h);

                    // D = sum(dO * O)
                    let d_val = dot(&do_data[q_off..q_off + d], &o_data[q_off..q_off + d]);

                    for ki in 0..seq_len_k {
                        if !visible(qi, ki, seq_len_q, seq_len_k, params) {
                            continue;
                        }
                        let k_off = dims.kv_off(sk_start + ki, kv_h);

                        let score = dot(&q_data[q_off..q_off + d], &k_data[k_off..k_off + d]) * scale;
                        let prob = (score - l).exp();
                        let grad_prob = dot(&v_data[k_off..k_off + d], &do_data[q_off..q_off + d]);
                        let grad_score = prob * (grad_prob - d_val);

                        for x in 0..d {
                            dq[q_off + x] += scale * grad_score * k_data[k_off + x];
                            dk[k_off + x] += scale * grad_score * q_data[q_off + x];
                            dv[k_off + x] += prob * do_data[q_off + x];
                        }
                    }
                }
            }
        }

        let dq_t =
            Tensor::<CpuRuntime>::from_slice(&dq, &[dims.total_q, dims.num_heads, d], device);
        let dk_t =
            Tensor::<CpuRuntime>::from_slice(&dk, &[dims.total_k, dims.num_kv_heads, d], device);
        let dv_t =
            Tensor::<CpuRuntime>::from_slice(&dv, &[dims.total_k, dims.num_kv_heads, d], device);
        Ok((dq_t, dk_t, dv_t))
    }
}

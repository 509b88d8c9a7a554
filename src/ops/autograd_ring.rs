//! Autograd integration for ring attention
//!
//! Wraps [`RingAttention`] (Tensor-level) into Var-level operations so a
//! training loop can differentiate through sequence-parallel attention. The
//! forward and backward share one saved-state record held by the grad fn and
//! released with it.
//!
//! Backward runs collectives: every rank of the group must run its backward
//! pass, and in the same order relative to other ring attention calls.

use std::sync::Arc;

use crate::config::AttentionParams;
use crate::error::{Error, Result};
use crate::ring::{RankShard, RingAttention, RingClient};
use numr::autograd::{GradFn, TensorId, Var};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Per-call context of a differentiable ring attention.
pub struct RingAttentionCtx<R: Runtime> {
    pub engine: Arc<RingAttention<R>>,
    pub shard: RankShard,
    pub params: AttentionParams,
}

impl<R: Runtime> Clone for RingAttentionCtx<R> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            shard: self.shard.clone(),
            params: self.params.clone(),
        }
    }
}

/// Output of a differentiable ring attention call.
pub struct RingAttentionOutput<R: Runtime> {
    /// `[L, H, D]`, tracked by autograd.
    pub out: Var<R>,
    /// `[H, L]` F32, not differentiable.
    pub lse: Tensor<R>,
}

/// How the differentiable inputs map onto q, k and v.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Packing {
    /// `q`, `k`, `v` separately.
    Separate,
    /// `q` and `kv: [L, 2, Hkv, D]`.
    Kv,
    /// `qkv: [L, 3, H, D]`.
    Qkv,
}

/// Backward function for ring attention.
///
/// Saved state: q, k, v, output, LSE from the forward pass plus the call
/// context. Computes dq, dk, dv via [`RingAttention::backward`] and packs them
/// to match the forward's inputs.
struct RingAttentionBackward<R: Runtime> {
    input_ids: Vec<TensorId>,
    saved_tensors: Vec<Tensor<R>>, // [q, k, v, output, lse]
    input_grad_fns: Vec<Option<Arc<dyn GradFn<R>>>>,
    ctx: RingAttentionCtx<R>,
    packing: Packing,
}

impl<R> RingAttentionBackward<R>
where
    R: Runtime<DType = DType>,
    R::Client: RingClient<R>,
{
    fn grads(&self, grad_output: &Tensor<R>) -> Result<Vec<Option<Tensor<R>>>> {
        let client = R::default_client(grad_output.device());
        let [q, k, v, output, lse] = self.saved_tensors.as_slice() else {
            return Err(Error::InvalidArgument {
                arg: "saved_tensors",
                reason: format!("expected 5 saved tensors, got {}", self.saved_tensors.len()),
            });
        };

        let (dq, dk, dv) = self.ctx.engine.backward(
            &client,
            grad_output,
            q,
            k,
            v,
            output,
            lse,
            &self.ctx.shard,
            &self.ctx.params,
        )?;

        Ok(match self.packing {
            Packing::Separate => vec![Some(dq), Some(dk), Some(dv)],
            Packing::Kv => vec![Some(dq), Some(pack(&client, &[&dk, &dv])?)],
            Packing::Qkv => vec![Some(pack(&client, &[&dq, &dk, &dv])?)],
        })
    }
}

impl<R> GradFn<R> for RingAttentionBackward<R>
where
    R: Runtime<DType = DType>,
    R::Client: RingClient<R>,
{
    fn backward(&self, grad_output: &Tensor<R>) -> numr::error::Result<Vec<Option<Tensor<R>>>> {
        self.grads(grad_output)
            .map_err(|e| numr::error::Error::Internal(format!("ring attention backward failed: {e}")))
    }

    fn backward_var(&self, grad_output: &Var<R>) -> numr::error::Result<Vec<Option<Var<R>>>> {
        // First-order only: gradients come back as detached Vars
        let grads = self.backward(grad_output.tensor())?;
        Ok(grads
            .into_iter()
            .map(|g| g.map(|t| Var::new(t, false)))
            .collect())
    }

    fn inputs(&self) -> &[TensorId] {
        &self.input_ids
    }

    fn input_grad_fns(&self) -> Vec<Option<Arc<dyn GradFn<R>>>> {
        self.input_grad_fns.clone()
    }

    fn saved_tensors(&self) -> &[Tensor<R>] {
        &self.saved_tensors
    }

    fn name(&self) -> &'static str {
        "RingAttentionBackward"
    }
}

/// `[L, H, D]` tensors stacked into `[L, n, H, D]`.
fn pack<R, C>(client: &C, parts: &[&Tensor<R>]) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: RingClient<R>,
{
    let expanded = parts
        .iter()
        .map(|t| {
            let s = t.shape();
            t.contiguous()
                .reshape(&[s[0], 1, s[1], s[2]])
                .map_err(Error::Numr)
        })
        .collect::<Result<Vec<_>>>()?;
    let refs: Vec<&Tensor<R>> = expanded.iter().collect();
    client.cat(&refs, 1).map_err(Error::Numr)
}

/// Component `index` of a packed `[L, n, H, D]` tensor as `[L, H, D]`.
fn unpack<R: Runtime<DType = DType>>(
    packed: &Tensor<R>,
    arg: &'static str,
    expected: usize,
    index: usize,
) -> Result<Tensor<R>> {
    let s = packed.shape();
    if s.len() != 4 || s[1] != expected {
        return Err(Error::InvalidArgument {
            arg,
            reason: format!("expected [tokens, {expected}, heads, head_dim], got {s:?}"),
        });
    }
    packed
        .narrow(1, index, 1)
        .map_err(Error::Numr)?
        .contiguous()
        .reshape(&[s[0], s[2], s[3]])
        .map_err(Error::Numr)
}

fn run<R>(
    inputs: &[&Var<R>],
    (q, k, v): (Tensor<R>, Tensor<R>, Tensor<R>),
    ctx: &RingAttentionCtx<R>,
    packing: Packing,
) -> Result<RingAttentionOutput<R>>
where
    R: Runtime<DType = DType>,
    R::Client: RingClient<R>,
{
    let client = R::default_client(q.device());
    let (output, lse) = ctx
        .engine
        .forward(&client, &q, &k, &v, &ctx.shard, &ctx.params)?;

    let out = if inputs.iter().any(|x| x.requires_grad()) {
        let grad_fn = RingAttentionBackward {
            input_ids: inputs.iter().map(|x| x.id()).collect(),
            saved_tensors: vec![q, k, v, output.clone(), lse.clone()],
            input_grad_fns: inputs.iter().map(|x| x.grad_fn().cloned()).collect(),
            ctx: ctx.clone(),
            packing,
        };
        Var::from_op(output, Arc::new(grad_fn))
    } else {
        Var::new(output, false)
    };
    Ok(RingAttentionOutput { out, lse })
}

/// Ring attention with autograd tracking.
///
/// `q: [L, H, D]`, `k, v: [L, Hkv, D]` are this rank's shards. When any input
/// requires grad the backward pass is registered.
pub fn var_ring_attention<R>(
    q: &Var<R>,
    k: &Var<R>,
    v: &Var<R>,
    ctx: &RingAttentionCtx<R>,
) -> Result<RingAttentionOutput<R>>
where
    R: Runtime<DType = DType>,
    R::Client: RingClient<R>,
{
    run(
        &[q, k, v],
        (q.tensor().clone(), k.tensor().clone(), v.tensor().clone()),
        ctx,
        Packing::Separate,
    )
}

/// Ring attention over a packed `qkv: [L, 3, H, D]`; the gradient is packed
/// the same way.
pub fn var_ring_attention_qkvpacked<R>(
    qkv: &Var<R>,
    ctx: &RingAttentionCtx<R>,
) -> Result<RingAttentionOutput<R>>
where
    R: Runtime<DType = DType>,
    R::Client: RingClient<R>,
{
    let t = qkv.tensor();
    let split = (
        unpack(t, "qkv", 3, 0)?,
        unpack(t, "qkv", 3, 1)?,
        unpack(t, "qkv", 3, 2)?,
    );
    run(&[qkv], split, ctx, Packing::Qkv)
}

/// Ring attention over `q: [L, H, D]` and a packed `kv: [L, 2, Hkv, D]`.
pub fn var_ring_attention_kvpacked<R>(
    q: &Var<R>,
    kv: &Var<R>,
    ctx: &RingAttentionCtx<R>,
) -> Result<RingAttentionOutput<R>>
where
    R: Runtime<DType = DType>,
    R::Client: RingClient<R>,
{
    let t = kv.tensor();
    let split = (
        q.tensor().clone(),
        unpack(t, "kv", 2, 0)?,
        unpack(t, "kv", 2, 1)?,
    );
    run(&[q, kv], split, ctx, Packing::Kv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RingAttentionConfig;
    use crate::distributed::LocalProcessGroup;
    use crate::ops::cpu::CpuVarlenKernel;
    use crate::ring::compute_rank_shard;
    use crate::test_utils::cpu_setup;
    use numr::autograd::{backward, var_sum};
    use numr::runtime::cpu::{CpuDevice, CpuRuntime};

    const L: usize = 6;
    const H: usize = 2;
    const D: usize = 4;

    fn ctx(device: &CpuDevice) -> RingAttentionCtx<CpuRuntime> {
        let group = LocalProcessGroup::new_group(1, device).unwrap().remove(0);
        let engine = RingAttention::new(
            RingAttentionConfig::default(),
            Arc::new(CpuVarlenKernel),
            Arc::new(group),
        )
        .unwrap();
        RingAttentionCtx {
            engine: Arc::new(engine),
            shard: compute_rank_shard(&[0, 2, 6], true, 0, 1).unwrap(),
            params: AttentionParams::causal(),
        }
    }

    fn det(shape: &[usize], f: f32, device: &CpuDevice) -> Tensor<CpuRuntime> {
        let n: usize = shape.iter().product();
        let data: Vec<f32> = (0..n).map(|i| (i as f32 * f).sin() * 0.5).collect();
        Tensor::<CpuRuntime>::from_slice(&data, shape, device)
    }

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((x - y).abs() < 1e-5, "index {i}: {x} vs {y}");
        }
    }

    #[test]
    fn test_no_grad_when_inputs_detached() {
        let (_client, device) = cpu_setup();
        let ctx = ctx(&device);
        let q = Var::new(det(&[L, H, D], 0.3, &device), false);
        let res = var_ring_attention(&q, &q, &q, &ctx).unwrap();
        assert!(!res.out.requires_grad());
        assert_eq!(res.lse.shape(), &[H, L]);
    }

    #[test]
    fn test_backward_matches_engine() {
        let (client, device) = cpu_setup();
        let ctx = ctx(&device);
        let q = Var::new(det(&[L, H, D], 0.3, &device), true);
        let k = Var::new(det(&[L, H, D], 0.7, &device), true);
        let v = Var::new(det(&[L, H, D], 1.1, &device), true);

        let res = var_ring_attention(&q, &k, &v, &ctx).unwrap();
        let loss = var_sum(&res.out, &[], false, &client).unwrap();
        let grads = backward(&loss, &client).unwrap();

        let ones = Tensor::<CpuRuntime>::from_slice(&[1.0f32; L * H * D], &[L, H, D], &device);
        let (dq, dk, dv) = ctx
            .engine
            .backward(
                &client,
                &ones,
                q.tensor(),
                k.tensor(),
                v.tensor(),
                res.out.tensor(),
                &res.lse,
                &ctx.shard,
                &ctx.params,
            )
            .unwrap();

        assert_close(&grads.get(q.id()).unwrap().to_vec::<f32>(), &dq.to_vec::<f32>());
        assert_close(&grads.get(k.id()).unwrap().to_vec::<f32>(), &dk.to_vec::<f32>());
        assert_close(&grads.get(v.id()).unwrap().to_vec::<f32>(), &dv.to_vec::<f32>());
    }

    #[test]
    fn test_qkvpacked_matches_separate() {
        let (client, device) = cpu_setup();
        let ctx = ctx(&device);
        let qkv_t = det(&[L, 3, H, D], 0.45, &device);
        let qkv = Var::new(qkv_t.clone(), true);

        let packed = var_ring_attention_qkvpacked(&qkv, &ctx).unwrap();
        let loss = var_sum(&packed.out, &[], false, &client).unwrap();
        let grads = backward(&loss, &client).unwrap();
        let d_qkv = grads.get(qkv.id()).unwrap().to_vec::<f32>();
        assert_eq!(d_qkv.len(), L * 3 * H * D);

        let q = Var::new(unpack(&qkv_t, "qkv", 3, 0).unwrap(), true);
        let k = Var::new(unpack(&qkv_t, "qkv", 3, 1).unwrap(), true);
        let v = Var::new(unpack(&qkv_t, "qkv", 3, 2).unwrap(), true);
        let separate = var_ring_attention(&q, &k, &v, &ctx).unwrap();
        assert_close(
            &packed.out.tensor().to_vec::<f32>(),
            &separate.out.tensor().to_vec::<f32>(),
        );

        let loss = var_sum(&separate.out, &[], false, &client).unwrap();
        let grads = backward(&loss, &client).unwrap();
        let dk = grads.get(k.id()).unwrap().to_vec::<f32>();
        // Token 0, component 1 (k) of the packed gradient
        assert_close(&d_qkv[H * D..2 * H * D], &dk[..H * D]);
    }

    #[test]
    fn test_kvpacked_shape_validation() {
        let (_client, device) = cpu_setup();
        let ctx = ctx(&device);
        let q = Var::new(det(&[L, H, D], 0.3, &device), true);
        let bad_kv = Var::new(det(&[L, 3, H, D], 0.3, &device), true);
        assert!(matches!(
            var_ring_attention_kvpacked(&q, &bad_kv, &ctx),
            Err(Error::InvalidArgument { arg: "kv", .. })
        ));

        let kv = Var::new(det(&[L, 2, H, D], 0.3, &device), true);
        let res = var_ring_attention_kvpacked(&q, &kv, &ctx).unwrap();
        assert_eq!(res.out.tensor().shape(), &[L, H, D]);
    }
}

//! Head-window all-gather strategy
//!
//! KV heads are processed `heads_k_stride` at a time. For each window every
//! rank's K/V shard is all-gathered into a `[world_size * L, stride, D]`
//! buffer, the rank reads its `local_k_slice` out of it and runs the kernel for
//! the query heads that window serves. The gather for window `i + 1` is issued
//! before window `i` is computed.
//!
//! Backward mirrors the loop. Each window's `dk`/`dv` over `local_k_slice` is
//! placed into a fresh zeroed world-sized buffer and reduce-scattered, so the
//! contributions of every rank land on the rank owning those tokens.

use tracing::trace;

use super::engine::StepContext;
use super::rows::{pad_rows, take_rows};
use super::traits::RingClient;
use crate::distributed::{AllGatherComm, CommScheduler};
use crate::error::{Error, Result};
use crate::ops::traits::VarlenBatch;
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// The gathered window compute reads from.
///
/// The staging half of the double buffer is the gather in flight on the
/// scheduler; [`KvWindow::swap_in`] takes ownership of it once waited on.
struct KvWindow<R: Runtime> {
    k: Tensor<R>,
    v: Tensor<R>,
}

impl<R: Runtime<DType = DType>> KvWindow<R> {
    fn swap_in(mut gathered: Vec<Tensor<R>>) -> Result<Self> {
        if gathered.len() != 2 {
            return Err(Error::CommProtocol {
                reason: format!("expected a gathered K/V pair, got {} tensors", gathered.len()),
            });
        }
        let v = gathered.pop();
        let k = gathered.pop();
        match (k, v) {
            (Some(k), Some(v)) => Ok(Self { k, v }),
            _ => Err(Error::CommProtocol {
                reason: "gathered K/V pair missing".to_string(),
            }),
        }
    }

    /// K/V rows the local queries read.
    fn local(&self, ctx: &StepContext<'_, R>) -> Result<(Tensor<R>, Tensor<R>)> {
        let slice = ctx.shard.local_k_slice.clone();
        Ok((take_rows(&self.k, slice.clone())?, take_rows(&self.v, slice)?))
    }
}

fn heads<R: Runtime<DType = DType>>(t: &Tensor<R>, heads: std::ops::Range<usize>) -> Result<Tensor<R>> {
    Ok(t.narrow(1, heads.start, heads.len())
        .map_err(Error::Numr)?
        .contiguous())
}

fn issue_window<R: Runtime<DType = DType>>(
    comm: &mut AllGatherComm<'_, R>,
    ctx: &StepContext<'_, R>,
    k: &Tensor<R>,
    v: &Tensor<R>,
    window: usize,
) -> Result<()> {
    let kv = ctx.kv_heads(window);
    let k_win = heads(k, kv.clone())?;
    let v_win = heads(v, kv)?;
    comm.issue(&[&k_win, &v_win])
}

fn cat_heads<R, C>(client: &C, mut parts: Vec<Tensor<R>>, dim: isize) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: RingClient<R>,
{
    if parts.len() == 1 {
        if let Some(only) = parts.pop() {
            return Ok(only);
        }
    }
    let refs: Vec<&Tensor<R>> = parts.iter().collect();
    client.cat(&refs, dim).map_err(Error::Numr)
}

pub(crate) fn forward<R, C>(
    client: &C,
    ctx: &StepContext<'_, R>,
    q: &Tensor<R>,
    k: &Tensor<R>,
    v: &Tensor<R>,
) -> Result<(Tensor<R>, Tensor<R>)>
where
    R: Runtime<DType = DType>,
    C: RingClient<R>,
{
    let shard = ctx.shard;
    let batch = VarlenBatch::<R>::new(&shard.cu_seqlens_q, &shard.cu_seqlens_k, q.device());
    let num_windows = ctx.num_windows();

    let mut comm = AllGatherComm::new(ctx.group);
    issue_window(&mut comm, ctx, k, v, 0)?;

    let mut outs = Vec::with_capacity(num_windows);
    let mut lses = Vec::with_capacity(num_windows);
    for i in 0..num_windows {
        let active = KvWindow::swap_in(comm.wait()?)?;
        if i + 1 < num_windows {
            issue_window(&mut comm, ctx, k, v, i + 1)?;
        }

        let (k_local, v_local) = active.local(ctx)?;
        let q_heads = ctx.q_heads(i);
        trace!(window = i, q_heads = ?q_heads, keys = k_local.shape()[0], "head window forward");
        let q_win = heads(q, q_heads)?;
        let (out, lse) = ctx
            .kernel
            .forward(&q_win, &k_local, &v_local, &batch, &ctx.params)?;
        outs.push(out);
        lses.push(lse);
    }

    let out = cat_heads(client, outs, 1)?;
    let lse = cat_heads(client, lses, 0)?;
    Ok((out, lse))
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn backward<R, C>(
    client: &C,
    ctx: &StepContext<'_, R>,
    dout: &Tensor<R>,
    q: &Tensor<R>,
    k: &Tensor<R>,
    v: &Tensor<R>,
    out: &Tensor<R>,
    lse: &Tensor<R>,
) -> Result<(Tensor<R>, Tensor<R>, Tensor<R>)>
where
    R: Runtime<DType = DType>,
    C: RingClient<R>,
{
    let shard = ctx.shard;
    let batch = VarlenBatch::<R>::new(&shard.cu_seqlens_q, &shard.cu_seqlens_k, q.device());
    let num_windows = ctx.num_windows();
    let world_rows = shard.world_size * shard.length_per_rank;

    let mut comm = AllGatherComm::new(ctx.group);
    issue_window(&mut comm, ctx, k, v, 0)?;

    let mut dqs = Vec::with_capacity(num_windows);
    let mut dks = Vec::with_capacity(num_windows);
    let mut dvs = Vec::with_capacity(num_windows);
    for i in 0..num_windows {
        let active = KvWindow::swap_in(comm.wait()?)?;
        if i + 1 < num_windows {
            issue_window(&mut comm, ctx, k, v, i + 1)?;
        }

        let (k_local, v_local) = active.local(ctx)?;
        let q_heads = ctx.q_heads(i);
        trace!(window = i, q_heads = ?q_heads, "head window backward");
        let dout_win = heads(dout, q_heads.clone())?;
        let q_win = heads(q, q_heads.clone())?;
        let out_win = heads(out, q_heads.clone())?;
        let lse_win = lse
            .narrow(0, q_heads.start, q_heads.len())
            .map_err(Error::Numr)?
            .contiguous();

        let (dq, dk_local, dv_local) = ctx.kernel.backward(
            &dout_win, &q_win, &k_local, &v_local, &out_win, &lse_win, &batch, &ctx.params,
        )?;

        // Fresh zeroed buffers every window: no stale rows reach the reduction
        let start = shard.local_k_slice.start;
        let dk_world = pad_rows(client, &dk_local, start, world_rows)?;
        let dv_world = pad_rows(client, &dv_local, start, world_rows)?;
        let dk_work = ctx.group.reduce_scatter_sum(&dk_world)?;
        let dv_work = ctx.group.reduce_scatter_sum(&dv_world)?;

        dqs.push(dq);
        dks.push(dk_work.wait()?);
        dvs.push(dv_work.wait()?);
    }

    let dq = cat_heads(client, dqs, 1)?;
    let dk = cat_heads(client, dks, 1)?;
    let dv = cat_heads(client, dvs, 1)?;
    Ok((dq, dk, dv))
}

//! Rotating point-to-point ring strategy
//!
//! Every hop each rank passes the K/V shard it holds to `rank + 1` and takes
//! the next one from `rank - 1`, so after `world_size - 1` hops it has seen
//! every shard once. Hop 0 is the rank's own diagonal block. Only the first
//! local sequence can reach back into an earlier shard and only the last one
//! forward into a later shard; those cross blocks are computed without a
//! causal mask and merged into their row ranges with the online softmax.
//!
//! Backward runs the same hops. `dq` accumulates locally while the `dk`/`dv`
//! accumulator of each shard travels with it on a second ring; one extra hop
//! at the end returns it to the owning rank.

use std::ops::Range;

use tracing::trace;

use super::engine::StepContext;
use super::merge::OnlineSoftmaxMerger;
use super::partition::RankShard;
use super::rows::{add_rows, take_rows};
use super::traits::RingClient;
use crate::distributed::{CommScheduler, RING_TAG_SPAN, RingComm};
use crate::error::{Error, Result};
use crate::ops::traits::VarlenBatch;
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

const KV_TAG: u32 = 0;
const GRAD_TAG: u32 = KV_TAG + RING_TAG_SPAN;

/// Local query rows and source-shard key rows of one cross-shard block.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CrossBlock {
    q_rows: Range<usize>,
    k_rows: Range<usize>,
}

/// Which of this rank's queries attend to shard `src`, and to which of its rows.
fn cross_block(shard: &RankShard, src: usize) -> Option<CrossBlock> {
    let len = shard.length_per_rank;
    let rank_start = shard.q_start();
    let (src_start, src_end) = (src * len, (src + 1) * len);
    let num_seqs = shard.num_seqs();

    let block = if src < shard.rank {
        let seq_start = shard.first_seq_start();
        if seq_start >= src_end || seq_start >= rank_start {
            return None;
        }
        CrossBlock {
            q_rows: 0..shard.cu_seqlens_q[1] as usize,
            k_rows: seq_start.max(src_start) - src_start..len,
        }
    } else if src > shard.rank && !shard.causal {
        let seq_end = shard.last_seq_end();
        if seq_end <= src_start {
            return None;
        }
        CrossBlock {
            q_rows: shard.cu_seqlens_q[num_seqs - 1] as usize..len,
            k_rows: 0..seq_end.min(src_end) - src_start,
        }
    } else {
        return None;
    };

    (!block.q_rows.is_empty() && !block.k_rows.is_empty()).then_some(block)
}

fn take_pair<R: Runtime>(mut received: Vec<Tensor<R>>) -> Result<(Tensor<R>, Tensor<R>)> {
    let second = received.pop();
    let first = received.pop();
    match (first, second, received.is_empty()) {
        (Some(a), Some(b), true) => Ok((a, b)),
        _ => Err(Error::CommProtocol {
            reason: "expected a pair from the ring".to_string(),
        }),
    }
}

fn to_dtype<R, C>(client: &C, t: Tensor<R>, dtype: DType) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: RingClient<R>,
{
    if t.dtype() == dtype {
        Ok(t)
    } else {
        client.cast(&t, dtype).map_err(Error::Numr)
    }
}

/// Batch for the diagonal block: local queries against local keys.
fn diagonal_batch<R: Runtime<DType = DType>>(
    shard: &RankShard,
    device: &R::Device,
) -> VarlenBatch<R> {
    VarlenBatch::new(&shard.cu_seqlens_q, &shard.cu_seqlens_q, device)
}

fn cross_batch<R: Runtime<DType = DType>>(
    block: &CrossBlock,
    device: &R::Device,
) -> VarlenBatch<R> {
    VarlenBatch::new(
        &[0, block.q_rows.len() as i32],
        &[0, block.k_rows.len() as i32],
        device,
    )
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
    let world_size = shard.world_size;
    let device = q.device();
    let cross_params = ctx.params.with_causal(false);

    let mut ring = RingComm::new(ctx.group, KV_TAG);
    if world_size > 1 {
        ring.send_recv_kv(k, v)?;
    }

    let (out, lse) = ctx
        .kernel
        .forward(q, k, v, &diagonal_batch(shard, device), &ctx.params)?;
    let mut merger = OnlineSoftmaxMerger::new();
    merger.update(client, &out, &lse)?;

    for hop in 1..world_size {
        let (k_src, v_src) = take_pair(ring.wait()?)?;
        if hop + 1 < world_size {
            ring.send_recv_kv(&k_src, &v_src)?;
        }

        let src = (shard.rank + world_size - hop) % world_size;
        let Some(block) = cross_block(shard, src) else {
            trace!(hop, src, "ring hop skipped");
            continue;
        };
        trace!(hop, src, q_rows = ?block.q_rows, k_rows = ?block.k_rows, "ring hop forward");

        let q_b = take_rows(q, block.q_rows.clone())?;
        let k_b = take_rows(&k_src, block.k_rows.clone())?;
        let v_b = take_rows(&v_src, block.k_rows.clone())?;
        let (out_b, lse_b) =
            ctx.kernel
                .forward(&q_b, &k_b, &v_b, &cross_batch(&block, device), &cross_params)?;
        merger.update_rows(client, block.q_rows, &out_b, &lse_b)?;
    }

    let (out, lse) = merger.finish()?;
    Ok((to_dtype(client, out, q.dtype())?, lse))
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
    let world_size = shard.world_size;
    let device = q.device();
    let cross_params = ctx.params.with_causal(false);

    let mut kv_ring = RingComm::new(ctx.group, KV_TAG);
    let mut grad_ring = RingComm::new(ctx.group, GRAD_TAG);
    if world_size > 1 {
        kv_ring.send_recv_kv(k, v)?;
    }

    let (mut dq, mut dk_acc, mut dv_acc) = ctx.kernel.backward(
        dout,
        q,
        k,
        v,
        out,
        lse,
        &diagonal_batch(shard, device),
        &ctx.params,
    )?;

    for hop in 1..world_size {
        let (k_src, v_src) = take_pair(kv_ring.wait()?)?;
        // Hand on the accumulator of the shard held so far
        grad_ring.send_recv_kv(&dk_acc, &dv_acc)?;
        if hop + 1 < world_size {
            kv_ring.send_recv_kv(&k_src, &v_src)?;
        }

        let src = (shard.rank + world_size - hop) % world_size;
        let block_grads = match cross_block(shard, src) {
            None => {
                trace!(hop, src, "ring hop skipped");
                None
            }
            Some(block) => {
                trace!(hop, src, q_rows = ?block.q_rows, k_rows = ?block.k_rows, "ring hop backward");
                let rows = block.q_rows.clone();
                let lse_b = lse
                    .narrow(1, rows.start, rows.len())
                    .map_err(Error::Numr)?
                    .contiguous();
                let (dq_b, dk_b, dv_b) = ctx.kernel.backward(
                    &take_rows(dout, rows.clone())?,
                    &take_rows(q, rows.clone())?,
                    &take_rows(&k_src, block.k_rows.clone())?,
                    &take_rows(&v_src, block.k_rows.clone())?,
                    &take_rows(out, rows.clone())?,
                    &lse_b,
                    &cross_batch(&block, device),
                    &cross_params,
                )?;
                dq = add_rows(client, &dq, rows.start, &dq_b)?;
                Some((block.k_rows.start, dk_b, dv_b))
            }
        };

        // Accumulator of shard `src`, as left by the ranks before this one
        (dk_acc, dv_acc) = take_pair(grad_ring.wait()?)?;
        if let Some((start, dk_b, dv_b)) = block_grads {
            dk_acc = add_rows(client, &dk_acc, start, &dk_b)?;
            dv_acc = add_rows(client, &dv_acc, start, &dv_b)?;
        }
    }

    if world_size > 1 {
        grad_ring.send_recv_kv(&dk_acc, &dv_acc)?;
        (dk_acc, dv_acc) = take_pair(grad_ring.wait()?)?;
    }

    Ok((dq, dk_acc, dv_acc))
}

//! Safe wrappers around the raw-pointer `Communicator` trait.
//!
//! Each helper checks contiguity, extracts device pointers and makes the unsafe
//! call. None of them sync: the caller decides when the enqueued work must be
//! complete and calls [`sync_comm`] then. Every tensor handed to a helper must
//! stay alive until that sync.

use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::{Communicator, ReduceOp, Runtime};
use numr::tensor::Tensor;

fn require_contiguous<R: Runtime<DType = DType>>(tensor: &Tensor<R>, op: &str) -> Result<()> {
    if !tensor.is_contiguous() {
        return Err(Error::DistributedError {
            reason: format!("{op} requires contiguous tensor"),
        });
    }
    Ok(())
}

/// Enqueue an all-gather of `input` into a new `[world_size * n, ...]` buffer.
///
/// Ranks' shards land in rank order along dim 0.
pub fn all_gather_tensor<R: Runtime<DType = DType>>(
    comm: &dyn Communicator,
    input: &Tensor<R>,
) -> Result<Tensor<R>> {
    require_contiguous(input, "all_gather")?;
    if input.shape().is_empty() {
        return Err(Error::DistributedError {
            reason: "all_gather requires at least one dimension".to_string(),
        });
    }

    let mut out_shape = input.shape().to_vec();
    out_shape[0] *= comm.world_size();
    let output = Tensor::<R>::zeros(&out_shape, input.dtype(), input.device());

    // Safety: both tensors are contiguous; output holds world_size * numel elements
    unsafe {
        comm.all_gather(
            input.ptr(),
            output.ptr(),
            input.numel(),
            input.dtype(),
        )
        .map_err(|e| Error::DistributedError {
            reason: format!("all_gather failed: {e}"),
        })?;
    }

    Ok(output)
}

/// Enqueue a sum reduce-scatter of `input` (`[world_size * n, ...]`) into a new
/// `[n, ...]` buffer holding this rank's chunk.
pub fn reduce_scatter_sum_tensor<R: Runtime<DType = DType>>(
    comm: &dyn Communicator,
    input: &Tensor<R>,
) -> Result<Tensor<R>> {
    require_contiguous(input, "reduce_scatter")?;
    let world_size = comm.world_size();
    let rows = input.shape().first().copied().unwrap_or(0);
    if world_size == 0 || rows % world_size != 0 {
        return Err(Error::DistributedError {
            reason: format!(
                "reduce_scatter input dim 0 ({rows}) not divisible by world_size ({world_size})"
            ),
        });
    }

    let mut out_shape = input.shape().to_vec();
    out_shape[0] = rows / world_size;
    let output = Tensor::<R>::zeros(&out_shape, input.dtype(), input.device());

    // Safety: both tensors are contiguous; input holds world_size * output.numel() elements
    unsafe {
        comm.reduce_scatter(
            input.ptr(),
            output.ptr(),
            output.numel(),
            input.dtype(),
            ReduceOp::Sum,
        )
        .map_err(|e| Error::DistributedError {
            reason: format!("reduce_scatter failed: {e}"),
        })?;
    }

    Ok(output)
}

/// Enqueue a send of `tensor` to `dest`.
pub fn send_tensor<R: Runtime<DType = DType>>(
    comm: &dyn Communicator,
    tensor: &Tensor<R>,
    dest: usize,
    tag: u32,
) -> Result<()> {
    require_contiguous(tensor, "send")?;

    // Safety: tensor is contiguous, ptr is valid device pointer
    unsafe {
        comm.send(tensor.ptr(), tensor.numel(), tensor.dtype(), dest, tag)
            .map_err(|e| Error::DistributedError {
                reason: format!("send to rank {dest} failed: {e}"),
            })?;
    }

    Ok(())
}

/// Enqueue a receive from `src` into a new `shape`/`dtype` buffer.
pub fn recv_tensor<R: Runtime<DType = DType>>(
    comm: &dyn Communicator,
    shape: &[usize],
    dtype: DType,
    src: usize,
    tag: u32,
    device: &R::Device,
) -> Result<Tensor<R>> {
    let buffer = Tensor::<R>::zeros(shape, dtype, device);

    // Safety: buffer is freshly allocated and contiguous
    unsafe {
        comm.recv(buffer.ptr(), buffer.numel(), dtype, src, tag)
            .map_err(|e| Error::DistributedError {
                reason: format!("recv from rank {src} failed: {e}"),
            })?;
    }

    Ok(buffer)
}

/// Block until every operation enqueued on `comm` has completed.
pub fn sync_comm(comm: &dyn Communicator, after: &str) -> Result<()> {
    comm.sync().map_err(|e| Error::DistributedError {
        reason: format!("sync after {after} failed: {e}"),
    })
}

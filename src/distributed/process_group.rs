//! Tensor-level collective transport.
//!
//! [`ProcessGroup`] is what the ring engine talks to. Every operation is
//! enqueued and returns a [`CommWork`] completion handle; the received tensor
//! is only readable once the handle has been waited on. Sends complete no
//! later than the next wait on the same group.

use std::sync::Arc;

use super::comm_utils::{
    all_gather_tensor, recv_tensor, reduce_scatter_sum_tensor, send_tensor, sync_comm,
};
use crate::error::Result;
use numr::dtype::DType;
use numr::runtime::{Communicator, Runtime};
use numr::tensor::Tensor;

/// Completion handle of one enqueued transport operation.
pub struct CommWork<R: Runtime> {
    op: &'static str,
    complete: Box<dyn FnOnce() -> Result<Tensor<R>>>,
}

impl<R: Runtime> CommWork<R> {
    /// Work whose result is produced by `complete` once waited on.
    pub fn pending(op: &'static str, complete: impl FnOnce() -> Result<Tensor<R>> + 'static) -> Self {
        Self {
            op,
            complete: Box::new(complete),
        }
    }

    /// Work that already finished.
    pub fn ready(op: &'static str, tensor: Tensor<R>) -> Self {
        Self::pending(op, move || Ok(tensor))
    }

    /// Name of the operation this handle tracks.
    pub fn op(&self) -> &'static str {
        self.op
    }

    /// Block until the operation completes and return its result.
    pub fn wait(self) -> Result<Tensor<R>> {
        (self.complete)()
    }
}

impl<R: Runtime> std::fmt::Debug for CommWork<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommWork").field("op", &self.op).finish()
    }
}

/// A group of ranks that can exchange tensors.
///
/// All ranks must issue collectives in the same order. Point-to-point
/// messages are matched by `(src, dest, tag)` in send order.
pub trait ProcessGroup<R: Runtime>: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Gather `input` from every rank, concatenated in rank order along dim 0.
    fn all_gather(&self, input: &Tensor<R>) -> Result<CommWork<R>>;

    /// Sum `input` (`[world_size * n, ...]`) across ranks and keep this rank's
    /// `[n, ...]` chunk.
    fn reduce_scatter_sum(&self, input: &Tensor<R>) -> Result<CommWork<R>>;

    /// Send `tensor` to `dest`.
    ///
    /// `tensor` must be contiguous and stay alive until a later wait on this
    /// group has returned.
    fn send(&self, tensor: &Tensor<R>, dest: usize, tag: u32) -> Result<()>;

    /// Receive a `shape`/`dtype` tensor from `src`.
    fn recv(&self, shape: &[usize], dtype: DType, src: usize, tag: u32) -> Result<CommWork<R>>;
}

/// [`ProcessGroup`] over a numr [`Communicator`] (NCCL or any other backend).
pub struct CommunicatorProcessGroup<R: Runtime> {
    comm: Arc<dyn Communicator>,
    device: R::Device,
}

impl<R: Runtime> CommunicatorProcessGroup<R> {
    pub fn new(comm: Arc<dyn Communicator>, device: R::Device) -> Self {
        Self { comm, device }
    }

    pub fn communicator(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }
}

impl<R: Runtime<DType = DType>> CommunicatorProcessGroup<R> {
    /// Wrap an enqueued output so that waiting syncs the communicator first.
    ///
    /// `keep_alive` pins the operation's input buffer until completion.
    fn defer(&self, op: &'static str, output: Tensor<R>, keep_alive: Tensor<R>) -> CommWork<R> {
        let comm = Arc::clone(&self.comm);
        CommWork::pending(op, move || {
            sync_comm(comm.as_ref(), op)?;
            drop(keep_alive);
            Ok(output)
        })
    }
}

impl<R> ProcessGroup<R> for CommunicatorProcessGroup<R>
where
    R: Runtime<DType = DType>,
    R::Device: Send + Sync,
{
    fn rank(&self) -> usize {
        self.comm.rank()
    }

    fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    fn all_gather(&self, input: &Tensor<R>) -> Result<CommWork<R>> {
        let input = input.contiguous();
        let output = all_gather_tensor(self.comm.as_ref(), &input)?;
        Ok(self.defer("all_gather", output, input))
    }

    fn reduce_scatter_sum(&self, input: &Tensor<R>) -> Result<CommWork<R>> {
        let input = input.contiguous();
        let output = reduce_scatter_sum_tensor(self.comm.as_ref(), &input)?;
        Ok(self.defer("reduce_scatter", output, input))
    }

    fn send(&self, tensor: &Tensor<R>, dest: usize, tag: u32) -> Result<()> {
        send_tensor(self.comm.as_ref(), tensor, dest, tag)
    }

    fn recv(&self, shape: &[usize], dtype: DType, src: usize, tag: u32) -> Result<CommWork<R>> {
        let buffer = recv_tensor::<R>(self.comm.as_ref(), shape, dtype, src, tag, &self.device)?;
        let comm = Arc::clone(&self.comm);
        Ok(CommWork::pending("recv", move || {
            sync_comm(comm.as_ref(), "recv")?;
            Ok(buffer)
        }))
    }
}

//! Overlapped communication schedulers for ring attention.
//!
//! A scheduler queues transport work in [`issue`](CommScheduler::issue) and
//! hands back the received tensors, in issue order, from
//! [`wait`](CommScheduler::wait). Compute runs between the two.
//!
//! - [`AllGatherComm`]: every issued tensor is gathered from all ranks along
//!   dim 0 (one head-group window of K and of V per step).
//! - [`RingComm`]: every issued tensor is sent to `rank + 1` while the same
//!   shaped tensor is received from `rank - 1`.

use super::process_group::{CommWork, ProcessGroup};
use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Issue/wait contract shared by both transport strategies.
pub trait CommScheduler<R: Runtime> {
    /// Enqueue one wave of transfers without blocking.
    fn issue(&mut self, tensors: &[&Tensor<R>]) -> Result<()>;

    /// Block until every queued transfer has completed and return the received
    /// tensors in issue order. Resets the queue.
    fn wait(&mut self) -> Result<Vec<Tensor<R>>>;
}

/// Windowed all-gather scheduler.
///
/// Issuing again before a wait grows the queue; the next wait drains both
/// waves.
pub struct AllGatherComm<'g, R: Runtime> {
    group: &'g dyn ProcessGroup<R>,
    pending: Vec<CommWork<R>>,
}

impl<'g, R: Runtime> AllGatherComm<'g, R> {
    pub fn new(group: &'g dyn ProcessGroup<R>) -> Self {
        Self {
            group,
            pending: Vec::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl<R: Runtime> CommScheduler<R> for AllGatherComm<'_, R> {
    fn issue(&mut self, tensors: &[&Tensor<R>]) -> Result<()> {
        for t in tensors {
            let work = self.group.all_gather(&t.contiguous())?;
            self.pending.push(work);
        }
        Ok(())
    }

    fn wait(&mut self) -> Result<Vec<Tensor<R>>> {
        if self.pending.is_empty() {
            return Err(Error::CommProtocol {
                reason: "all-gather wait called with nothing issued".to_string(),
            });
        }
        self.pending.drain(..).map(CommWork::wait).collect()
    }
}

/// Rotating point-to-point ring scheduler.
///
/// [`send_recv`](Self::send_recv) queues a paired transfer, [`commit`](Self::commit)
/// launches every queued pair as one batch, [`wait`](CommScheduler::wait)
/// completes the batch. Each scheduler owns a tag range starting at `tag_base`,
/// so two rings on the same group (K/V and gradients) never match each other's
/// messages.
pub struct RingComm<'g, R: Runtime> {
    group: &'g dyn ProcessGroup<R>,
    tag_base: u32,
    send_rank: usize,
    recv_rank: usize,
    queued: Vec<Tensor<R>>,
    in_flight: Option<InFlight<R>>,
}

struct InFlight<R: Runtime> {
    // Sent buffers stay alive until the batch completes
    _sent: Vec<Tensor<R>>,
    recvs: Vec<CommWork<R>>,
}

/// Tags reserved per [`RingComm`]; a batch may carry at most this many tensors.
pub const RING_TAG_SPAN: u32 = 16;

impl<'g, R: Runtime<DType = DType>> RingComm<'g, R> {
    pub fn new(group: &'g dyn ProcessGroup<R>, tag_base: u32) -> Self {
        let world_size = group.world_size();
        let rank = group.rank();
        Self {
            group,
            tag_base,
            send_rank: (rank + 1) % world_size,
            recv_rank: (rank + world_size - 1) % world_size,
            queued: Vec::new(),
            in_flight: None,
        }
    }

    /// Rank this ring sends to.
    pub fn send_rank(&self) -> usize {
        self.send_rank
    }

    /// Rank this ring receives from.
    pub fn recv_rank(&self) -> usize {
        self.recv_rank
    }

    /// Queue sending `tensor` and receiving a same-shaped tensor.
    ///
    /// Fails while a committed batch has not been waited on; nothing is queued
    /// then.
    pub fn send_recv(&mut self, tensor: &Tensor<R>) -> Result<()> {
        if self.in_flight.is_some() {
            return Err(Error::CommProtocol {
                reason: "send_recv called while a batch is in flight".to_string(),
            });
        }
        if self.queued.len() as u32 >= RING_TAG_SPAN {
            return Err(Error::CommProtocol {
                reason: format!("more than {RING_TAG_SPAN} transfers queued in one batch"),
            });
        }
        self.queued.push(tensor.contiguous());
        Ok(())
    }

    /// Launch every queued transfer as one batch.
    pub fn commit(&mut self) -> Result<()> {
        if self.in_flight.is_some() {
            return Err(Error::CommProtocol {
                reason: "commit called twice without wait".to_string(),
            });
        }
        if self.queued.is_empty() {
            return Err(Error::CommProtocol {
                reason: "commit called with nothing queued".to_string(),
            });
        }

        let sent = std::mem::take(&mut self.queued);
        for (i, t) in sent.iter().enumerate() {
            self.group.send(t, self.send_rank, self.tag_base + i as u32)?;
        }
        let recvs = sent
            .iter()
            .enumerate()
            .map(|(i, t)| {
                self.group
                    .recv(t.shape(), t.dtype(), self.recv_rank, self.tag_base + i as u32)
            })
            .collect::<Result<Vec<_>>>()?;

        self.in_flight = Some(InFlight { _sent: sent, recvs });
        Ok(())
    }

    /// Queue `k` and `v` and commit them as one batch.
    pub fn send_recv_kv(&mut self, k: &Tensor<R>, v: &Tensor<R>) -> Result<()> {
        self.send_recv(k)?;
        self.send_recv(v)?;
        self.commit()
    }
}

impl<R: Runtime<DType = DType>> CommScheduler<R> for RingComm<'_, R> {
    fn issue(&mut self, tensors: &[&Tensor<R>]) -> Result<()> {
        for t in tensors {
            self.send_recv(t)?;
        }
        self.commit()
    }

    fn wait(&mut self) -> Result<Vec<Tensor<R>>> {
        let batch = self.in_flight.take().ok_or_else(|| Error::CommProtocol {
            reason: "ring wait called before commit".to_string(),
        })?;
        batch.recvs.into_iter().map(CommWork::wait).collect()
    }
}

//! In-process [`ProcessGroup`] for ranks running as threads on one host.
//!
//! Collectives rendezvous on a shared barrier and complete before they return.
//! Point-to-point sends are buffered in per-`(src, dest, tag)` mailboxes and
//! never block; receives block in [`CommWork::wait`] until the matching message
//! has arrived. F32 tensors only.
//!
//! A rank that rejects its own input to a collective still takes part in the
//! rendezvous, so its peers return an error instead of waiting forever. A rank
//! that never enters the collective at all stalls the others.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Barrier, Condvar, Mutex, MutexGuard};

use super::process_group::{CommWork, ProcessGroup};
use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::cpu::{CpuDevice, CpuRuntime};
use numr::tensor::Tensor;

type MailKey = (usize, usize, u32);

struct Shared {
    world_size: usize,
    barrier: Barrier,
    slots: Mutex<Vec<Option<Vec<f32>>>>,
    mailboxes: Mutex<HashMap<MailKey, VecDeque<Vec<f32>>>>,
    delivered: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| Error::DistributedError {
        reason: "a peer rank panicked while holding the group lock".to_string(),
    })
}

/// One rank's handle on an in-process group.
pub struct LocalProcessGroup {
    rank: usize,
    shared: Arc<Shared>,
    device: CpuDevice,
}

impl LocalProcessGroup {
    /// Create handles for every rank of a `world_size` group, in rank order.
    ///
    /// Each handle is meant to be moved to its own thread.
    pub fn new_group(world_size: usize, device: &CpuDevice) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(Error::InvalidArgument {
                arg: "world_size",
                reason: "must be at least 1".to_string(),
            });
        }
        let shared = Arc::new(Shared {
            world_size,
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![None; world_size]),
            mailboxes: Mutex::new(HashMap::new()),
            delivered: Condvar::new(),
        });
        Ok((0..world_size)
            .map(|rank| Self {
                rank,
                shared: Arc::clone(&shared),
                device: device.clone(),
            })
            .collect())
    }

    fn host_data(tensor: &Tensor<CpuRuntime>) -> Result<Vec<f32>> {
        if tensor.dtype() != DType::F32 {
            return Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: tensor.dtype(),
            });
        }
        Ok(tensor.contiguous().to_vec::<f32>())
    }

    fn check_peer(&self, peer: usize) -> Result<()> {
        if peer >= self.shared.world_size {
            return Err(Error::DistributedError {
                reason: format!(
                    "peer rank {peer} out of range for world_size {}",
                    self.shared.world_size
                ),
            });
        }
        Ok(())
    }

    /// Publish `data` and return every rank's contribution once all have arrived.
    ///
    /// Both barriers are always passed; errors surface only afterwards.
    fn exchange(&self, data: Result<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        let (data, own_error) = match data {
            Ok(d) => (Some(d), None),
            Err(e) => (None, Some(e)),
        };
        let published = lock(&self.shared.slots).map(|mut slots| slots[self.rank] = data);
        self.shared.barrier.wait();
        let all = lock(&self.shared.slots).map(|slots| slots.clone());
        // Nobody may overwrite a slot before every rank has read it
        self.shared.barrier.wait();

        if let Some(e) = own_error {
            return Err(e);
        }
        published?;
        all?.into_iter()
            .enumerate()
            .map(|(rank, slot)| {
                slot.ok_or_else(|| Error::DistributedError {
                    reason: format!("rank {rank} rejected its input to the collective"),
                })
            })
            .collect()
    }
}

impl ProcessGroup<CpuRuntime> for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_gather(&self, input: &Tensor<CpuRuntime>) -> Result<CommWork<CpuRuntime>> {
        let data = if input.shape().is_empty() {
            Err(Error::DistributedError {
                reason: "all_gather requires at least one dimension".to_string(),
            })
        } else {
            Self::host_data(input)
        };
        let all = self.exchange(data)?;
        if all.iter().any(|part| part.len() != input.numel()) {
            return Err(Error::DistributedError {
                reason: "all_gather called with mismatched shard sizes".to_string(),
            });
        }

        let mut shape = input.shape().to_vec();
        shape[0] *= self.shared.world_size;
        let flat: Vec<f32> = all.concat();
        Ok(CommWork::ready(
            "all_gather",
            Tensor::<CpuRuntime>::from_slice(&flat, &shape, &self.device),
        ))
    }

    fn reduce_scatter_sum(&self, input: &Tensor<CpuRuntime>) -> Result<CommWork<CpuRuntime>> {
        let world_size = self.shared.world_size;
        let rows = input.shape().first().copied().unwrap_or(0);
        let data = if rows % world_size != 0 {
            Err(Error::DistributedError {
                reason: format!(
                    "reduce_scatter input dim 0 ({rows}) not divisible by world_size ({world_size})"
                ),
            })
        } else {
            Self::host_data(input)
        };
        let all = self.exchange(data)?;
        if all.iter().any(|part| part.len() != input.numel()) {
            return Err(Error::DistributedError {
                reason: "reduce_scatter called with mismatched input sizes".to_string(),
            });
        }

        let chunk = input.numel() / world_size;
        let range = self.rank * chunk..(self.rank + 1) * chunk;
        let mut reduced = vec![0.0f32; chunk];
        for part in &all {
            for (acc, &x) in reduced.iter_mut().zip(&part[range.clone()]) {
                *acc += x;
            }
        }

        let mut shape = input.shape().to_vec();
        shape[0] = rows / world_size;
        Ok(CommWork::ready(
            "reduce_scatter",
            Tensor::<CpuRuntime>::from_slice(&reduced, &shape, &self.device),
        ))
    }

    fn send(&self, tensor: &Tensor<CpuRuntime>, dest: usize, tag: u32) -> Result<()> {
        self.check_peer(dest)?;
        let data = Self::host_data(tensor)?;
        lock(&self.shared.mailboxes)?
            .entry((self.rank, dest, tag))
            .or_default()
            .push_back(data);
        self.shared.delivered.notify_all();
        Ok(())
    }

    fn recv(
        &self,
        shape: &[usize],
        dtype: DType,
        src: usize,
        tag: u32,
    ) -> Result<CommWork<CpuRuntime>> {
        self.check_peer(src)?;
        if dtype != DType::F32 {
            return Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: dtype,
            });
        }

        let key = (src, self.rank, tag);
        let shared = Arc::clone(&self.shared);
        let device = self.device.clone();
        let shape = shape.to_vec();
        Ok(CommWork::pending("recv", move || {
            let mut boxes = lock(&shared.mailboxes)?;
            let data = loop {
                if let Some(msg) = boxes.get_mut(&key).and_then(VecDeque::pop_front) {
                    break msg;
                }
                boxes = shared
                    .delivered
                    .wait(boxes)
                    .map_err(|_| Error::DistributedError {
                        reason: "a peer rank panicked while holding the group lock".to_string(),
                    })?;
            };
            drop(boxes);

            let expected: usize = shape.iter().product();
            if data.len() != expected {
                return Err(Error::DistributedError {
                    reason: format!(
                        "recv from rank {src} (tag {tag}) got {} elements, expected {expected}",
                        data.len()
                    ),
                });
            }
            Ok(Tensor::<CpuRuntime>::from_slice(&data, &shape, &device))
        }))
    }
}

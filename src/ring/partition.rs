//! Sequence partitioning across ranks
//!
//! Splits a packed global layout (`cu_seqlens` over `total_length` tokens) into
//! `world_size` equal contiguous query ranges and derives, for one rank, the
//! local `cu_seqlens_q`/`cu_seqlens_k` and the key window the local queries
//! read from the fully gathered world buffer.
//!
//! ```text
//! cu_seqlens = [0, 6, 16], world_size = 2  (length_per_rank = 8)
//!
//! global:  |--- seq0 (6) ---|-------- seq1 (10) --------|
//!          0                6       8                   16
//! rank 0:  q [0, 8)   cu_q = [0, 6, 8]   k slice [0, 8)
//! rank 1:  q [8, 16)  cu_q = [0, 8]      k slice [6, 16)   cu_k = [0, 10]
//! ```

use std::ops::Range;

use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// One rank's view of the packed global layout.
///
/// Derived from the global `cu_seqlens` by [`compute_rank_shard`]; never mutated
/// once built. Boundaries are local: `cu_seqlens_q` indexes this rank's query
/// shard, `cu_seqlens_k` indexes the `local_k_slice` window of the gathered
/// key buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankShard {
    pub rank: usize,
    pub world_size: usize,
    pub length_per_rank: usize,
    /// Whether the key windows were cut at the causal horizon.
    pub causal: bool,
    pub cu_seqlens_q: Vec<i32>,
    pub cu_seqlens_k: Vec<i32>,
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
    /// Global token range read out of the gathered `[world_size * L, ...]` buffer.
    pub local_k_slice: Range<usize>,
}

impl RankShard {
    /// Number of sequences overlapping this rank's query range.
    pub fn num_seqs(&self) -> usize {
        self.cu_seqlens_q.len() - 1
    }

    /// Length of the key window the local queries read.
    pub fn local_k_len(&self) -> usize {
        self.local_k_slice.end - self.local_k_slice.start
    }

    /// Global token index of this rank's first query.
    pub fn q_start(&self) -> usize {
        self.rank * self.length_per_rank
    }

    /// Global start of the first sequence overlapping this rank.
    ///
    /// Lies before [`q_start`](Self::q_start) when that sequence straddles the
    /// rank boundary.
    pub fn first_seq_start(&self) -> usize {
        self.local_k_slice.start
    }

    /// Global end of the last sequence overlapping this rank, as far as the
    /// local queries may look. Capped at the rank end under causal masking.
    pub fn last_seq_end(&self) -> usize {
        self.local_k_slice.end
    }

    /// Materialize `(cu_seqlens_q, cu_seqlens_k)` as I32 device tensors.
    pub fn to_tensors<R: Runtime<DType = DType>>(
        &self,
        device: &R::Device,
    ) -> (Tensor<R>, Tensor<R>) {
        let q = Tensor::<R>::from_slice(&self.cu_seqlens_q, &[self.cu_seqlens_q.len()], device);
        let k = Tensor::<R>::from_slice(&self.cu_seqlens_k, &[self.cu_seqlens_k.len()], device);
        (q, k)
    }
}

/// Compute the shard of `rank` out of `world_size` for a packed global layout.
///
/// Under `causal` the key window stops at the rank's own end: queries never see
/// keys past their causal horizon even if the sequence continues. Otherwise the
/// window runs to the true end of the last overlapping sequence, which may be
/// owned by later ranks.
pub fn compute_rank_shard(
    cu_seqlens: &[i32],
    causal: bool,
    rank: usize,
    world_size: usize,
) -> Result<RankShard> {
    validate_layout(cu_seqlens)?;
    if world_size == 0 {
        return Err(Error::InvalidArgument {
            arg: "world_size",
            reason: "must be at least 1".to_string(),
        });
    }
    if rank >= world_size {
        return Err(Error::InvalidArgument {
            arg: "rank",
            reason: format!("rank {rank} out of range for world_size {world_size}"),
        });
    }

    let total_length = *cu_seqlens.last().unwrap_or(&0) as usize;
    if total_length == 0 {
        return Err(Error::InvalidArgument {
            arg: "cu_seqlens",
            reason: "layout holds no tokens".to_string(),
        });
    }
    if total_length % world_size != 0 {
        return Err(Error::InvalidArgument {
            arg: "cu_seqlens",
            reason: format!(
                "total length {total_length} not divisible by world_size {world_size}"
            ),
        });
    }
    let length_per_rank = total_length / world_size;
    let rank_start = rank * length_per_rank;
    let rank_end = rank_start + length_per_rank;

    let mut left = cu_seqlens.partition_point(|&c| (c as usize) < rank_start);
    let right = cu_seqlens.partition_point(|&c| (c as usize) < rank_end);
    if cu_seqlens[left] as usize != rank_start {
        left -= 1;
    }

    let window = &cu_seqlens[left..=right];
    let last = window.len() - 1;

    let mut cu_seqlens_q: Vec<i32> = window
        .iter()
        .map(|&c| c - rank_start as i32)
        .collect();
    cu_seqlens_q[0] = 0;
    cu_seqlens_q[last] = length_per_rank as i32;

    let slice_left = window[0] as usize;
    let slice_right = if causal {
        rank_end
    } else {
        window[last] as usize
    };

    let mut cu_seqlens_k: Vec<i32> = window.iter().map(|&c| c - slice_left as i32).collect();
    cu_seqlens_k[last] = (slice_right - slice_left) as i32;

    let max_seqlen_q = max_diff(&cu_seqlens_q);
    let max_seqlen_k = max_diff(&cu_seqlens_k);

    Ok(RankShard {
        rank,
        world_size,
        length_per_rank,
        causal,
        cu_seqlens_q,
        cu_seqlens_k,
        max_seqlen_q,
        max_seqlen_k,
        local_k_slice: slice_left..slice_right,
    })
}

/// Shards for every rank of a group, in rank order.
pub fn partition_all(cu_seqlens: &[i32], causal: bool, world_size: usize) -> Result<Vec<RankShard>> {
    (0..world_size)
        .map(|rank| compute_rank_shard(cu_seqlens, causal, rank, world_size))
        .collect()
}

fn validate_layout(cu_seqlens: &[i32]) -> Result<()> {
    if cu_seqlens.len() < 2 {
        return Err(Error::InvalidArgument {
            arg: "cu_seqlens",
            reason: format!("need at least 2 boundaries, got {}", cu_seqlens.len()),
        });
    }
    if cu_seqlens[0] != 0 {
        return Err(Error::InvalidArgument {
            arg: "cu_seqlens",
            reason: format!("first boundary must be 0, got {}", cu_seqlens[0]),
        });
    }
    if let Some(i) = cu_seqlens.windows(2).position(|w| w[1] < w[0]) {
        return Err(Error::InvalidArgument {
            arg: "cu_seqlens",
            reason: format!(
                "boundaries must be non-decreasing: cu_seqlens[{}]={} > cu_seqlens[{}]={}",
                i,
                cu_seqlens[i],
                i + 1,
                cu_seqlens[i + 1]
            ),
        });
    }
    Ok(())
}

fn max_diff(cu: &[i32]) -> usize {
    cu.windows(2).map(|w| (w[1] - w[0]) as usize).max().unwrap_or(0)
}

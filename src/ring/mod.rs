//! Sequence-parallel ("ring") attention
//!
//! One packed token sequence is split evenly across the ranks of a group.
//! Each rank holds a query shard and a key/value shard; key/value data moves
//! between ranks while the external varlen kernel computes per window or hop.
//!
//! ```text
//! partition ──► RankShard ──► RingAttention ──┬─► head_window (all-gather / reduce-scatter)
//!                                             └─► rotating    (p2p ring + online softmax)
//! ```

pub mod engine;
mod head_window;
pub mod lse_layout;
pub mod merge;
pub mod partition;
mod rotating;
pub mod rows;
pub mod traits;

pub use engine::RingAttention;
pub use lse_layout::{flatten_varlen_lse, unflatten_varlen_lse};
pub use merge::OnlineSoftmaxMerger;
pub use partition::{RankShard, compute_rank_shard, partition_all};
pub use traits::RingClient;

//! # ring-attn
//!
//! **Sequence-parallel ("ring") attention built on numr.**
//!
//! One packed batch of variable-length sequences is split evenly across the
//! ranks of a process group. Each rank attends its query shard to every rank's
//! keys by moving key/value data around the group while an external varlen
//! attention kernel does the math, then sends key/value gradients back to the
//! ranks owning those tokens.
//!
//! ## Layers
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  ops::autograd_ring   (Var-level forward/backward)       │
//! ├──────────────────────────────────────────────────────────┤
//! │  ring                 (partition, engine, merge, layout) │
//! ├───────────────────────────┬──────────────────────────────┤
//! │  distributed              │  ops::traits / ops::cpu      │
//! │  (process groups, comm)   │  (varlen kernel contract)    │
//! ├───────────────────────────┴──────────────────────────────┤
//! │                         numr                             │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - **Two transports**: head-window all-gather (default) and a rotating p2p
//!   ring with online softmax merging, selected by [`CommStrategy`]
//! - **Kernel seam**: [`VarlenAttentionKernel`] abstracts the fused varlen
//!   kernel; [`CpuVarlenKernel`] is the host reference
//! - **Group seam**: [`ProcessGroup`] wraps numr's `Communicator`;
//!   [`LocalProcessGroup`] runs a whole group in-process on threads

pub mod config;
pub mod distributed;
pub mod error;
pub mod ops;
pub mod ring;

pub use config::{AttentionParams, CommStrategy, RingAttentionConfig};
pub use distributed::{CommunicatorProcessGroup, LocalProcessGroup, ProcessGroup};
pub use error::{Error, Result};
pub use ops::{
    CpuVarlenKernel, KernelAbi, KernelParams, RingAttentionCtx, RingAttentionOutput,
    VarlenAttentionKernel, VarlenBatch, var_ring_attention, var_ring_attention_kvpacked,
    var_ring_attention_qkvpacked,
};
pub use ring::{
    OnlineSoftmaxMerger, RankShard, RingAttention, RingClient, compute_rank_shard,
    flatten_varlen_lse, partition_all, unflatten_varlen_lse,
};

// Re-export numr types that users will commonly need
pub use numr::dtype::DType;
pub use numr::error::{Error as NumrError, Result as NumrResult};
pub use numr::runtime::{Runtime, RuntimeClient};
pub use numr::tensor::Tensor;

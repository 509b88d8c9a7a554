//! Ring attention step engine
//!
//! [`RingAttention`] validates one call, resolves the kernel parameters and
//! hands the work to the configured transport strategy:
//!
//! - [`CommStrategy::HeadWindowAllGather`] → [`head_window`](super::head_window)
//! - [`CommStrategy::RotatingRing`] → [`rotating`](super::rotating)
//!
//! Both produce the same `(out [L, H, D], lse [H, L])` for the rank's query
//! shard and the same `(dq, dk, dv)` for its own shards.

use std::ops::Range;
use std::sync::Arc;

use tracing::debug;

use super::partition::RankShard;
use super::traits::RingClient;
use super::{head_window, rotating};
use crate::config::{AttentionParams, CommStrategy, RingAttentionConfig};
use crate::distributed::ProcessGroup;
use crate::error::{Error, Result};
use crate::ops::traits::{KernelParams, VarlenAttentionKernel};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Everything one strategy call needs, validated.
pub(crate) struct StepContext<'a, R: Runtime> {
    pub kernel: &'a dyn VarlenAttentionKernel<R>,
    pub group: &'a dyn ProcessGroup<R>,
    pub shard: &'a RankShard,
    pub params: KernelParams,
    pub heads_k_stride: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
}

impl<R: Runtime> StepContext<'_, R> {
    pub fn num_windows(&self) -> usize {
        self.num_kv_heads / self.heads_k_stride
    }

    /// KV heads of window `i`.
    pub fn kv_heads(&self, i: usize) -> Range<usize> {
        i * self.heads_k_stride..(i + 1) * self.heads_k_stride
    }

    /// Query heads served by window `i` (grouped-query mapping).
    pub fn q_heads(&self, i: usize) -> Range<usize> {
        let ratio = self.num_heads / self.num_kv_heads;
        let kv = self.kv_heads(i);
        kv.start * ratio..kv.end * ratio
    }
}

/// Sequence-parallel attention over one rank group.
pub struct RingAttention<R: Runtime> {
    config: RingAttentionConfig,
    kernel: Arc<dyn VarlenAttentionKernel<R>>,
    group: Arc<dyn ProcessGroup<R>>,
}

impl<R: Runtime<DType = DType>> RingAttention<R> {
    pub fn new(
        config: RingAttentionConfig,
        kernel: Arc<dyn VarlenAttentionKernel<R>>,
        group: Arc<dyn ProcessGroup<R>>,
    ) -> Result<Self> {
        config.validate()?;
        config.check_kernel_abi(&kernel.abi())?;
        Ok(Self {
            config,
            kernel,
            group,
        })
    }

    pub fn config(&self) -> &RingAttentionConfig {
        &self.config
    }

    pub fn group(&self) -> &dyn ProcessGroup<R> {
        self.group.as_ref()
    }

    pub fn kernel(&self) -> &dyn VarlenAttentionKernel<R> {
        self.kernel.as_ref()
    }

    /// Attention for this rank's query shard against every rank's keys.
    ///
    /// `q: [L, H, D]`, `k, v: [L, Hkv, D]` with `L = shard.length_per_rank`.
    /// Returns `(out [L, H, D], lse [H, L])`.
    pub fn forward<C: RingClient<R>>(
        &self,
        client: &C,
        q: &Tensor<R>,
        k: &Tensor<R>,
        v: &Tensor<R>,
        shard: &RankShard,
        params: &AttentionParams,
    ) -> Result<(Tensor<R>, Tensor<R>)> {
        let ctx = self.prepare(q, k, v, shard, params)?;
        debug!(
            strategy = ?self.config.strategy,
            rank = shard.rank,
            world_size = shard.world_size,
            windows = ctx.num_windows(),
            causal = ctx.params.causal,
            "ring attention forward"
        );
        match self.config.strategy {
            CommStrategy::HeadWindowAllGather => head_window::forward(client, &ctx, q, k, v),
            CommStrategy::RotatingRing => rotating::forward(client, &ctx, q, k, v),
        }
    }

    /// Gradients for this rank's `q`, `k`, `v` shards.
    ///
    /// `out` and `lse` are what [`forward`](Self::forward) returned for the
    /// same inputs.
    #[allow(clippy::too_many_arguments)]
    pub fn backward<C: RingClient<R>>(
        &self,
        client: &C,
        dout: &Tensor<R>,
        q: &Tensor<R>,
        k: &Tensor<R>,
        v: &Tensor<R>,
        out: &Tensor<R>,
        lse: &Tensor<R>,
        shard: &RankShard,
        params: &AttentionParams,
    ) -> Result<(Tensor<R>, Tensor<R>, Tensor<R>)> {
        let ctx = self.prepare(q, k, v, shard, params)?;
        if dout.shape() != q.shape() || out.shape() != q.shape() {
            return Err(Error::InvalidArgument {
                arg: "dout",
                reason: format!(
                    "dout {:?} and out {:?} must match q {:?}",
                    dout.shape(),
                    out.shape(),
                    q.shape()
                ),
            });
        }
        if lse.shape() != [ctx.num_heads, shard.length_per_rank] {
            return Err(Error::InvalidArgument {
                arg: "lse",
                reason: format!(
                    "expected [{}, {}], got {:?}",
                    ctx.num_heads,
                    shard.length_per_rank,
                    lse.shape()
                ),
            });
        }
        debug!(
            strategy = ?self.config.strategy,
            rank = shard.rank,
            world_size = shard.world_size,
            windows = ctx.num_windows(),
            "ring attention backward"
        );
        match self.config.strategy {
            CommStrategy::HeadWindowAllGather => {
                head_window::backward(client, &ctx, dout, q, k, v, out, lse)
            }
            CommStrategy::RotatingRing => rotating::backward(client, &ctx, dout, q, k, v, out, lse),
        }
    }

    fn prepare<'a>(
        &'a self,
        q: &Tensor<R>,
        k: &Tensor<R>,
        v: &Tensor<R>,
        shard: &'a RankShard,
        params: &AttentionParams,
    ) -> Result<StepContext<'a, R>> {
        for (arg, t) in [("q", q), ("k", k), ("v", v)] {
            if t.shape().len() != 3 {
                return Err(Error::InvalidArgument {
                    arg,
                    reason: format!("expected [tokens, heads, head_dim], got {:?}", t.shape()),
                });
            }
            if t.shape()[0] != shard.length_per_rank {
                return Err(Error::InvalidArgument {
                    arg,
                    reason: format!(
                        "{} tokens, but the shard holds {} per rank",
                        t.shape()[0],
                        shard.length_per_rank
                    ),
                });
            }
        }
        if k.shape() != v.shape() {
            return Err(Error::InvalidArgument {
                arg: "v",
                reason: format!("k {:?} and v {:?} must match", k.shape(), v.shape()),
            });
        }
        let (num_heads, head_dim) = (q.shape()[1], q.shape()[2]);
        let num_kv_heads = k.shape()[1];
        if k.shape()[2] != head_dim {
            return Err(Error::InvalidArgument {
                arg: "k",
                reason: format!("head_dim {} does not match q's {head_dim}", k.shape()[2]),
            });
        }
        if num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
            return Err(Error::InvalidArgument {
                arg: "k",
                reason: format!(
                    "num_heads ({num_heads}) must be a multiple of num_kv_heads ({num_kv_heads})"
                ),
            });
        }

        if self.group.rank() != shard.rank || self.group.world_size() != shard.world_size {
            return Err(Error::InvalidArgument {
                arg: "shard",
                reason: format!(
                    "shard is rank {}/{} but the group is rank {}/{}",
                    shard.rank,
                    shard.world_size,
                    self.group.rank(),
                    self.group.world_size()
                ),
            });
        }
        if shard.causal != params.causal {
            return Err(Error::InvalidArgument {
                arg: "shard",
                reason: format!(
                    "shard was partitioned with causal={} but the call is causal={}",
                    shard.causal, params.causal
                ),
            });
        }

        let kernel_params = params.resolve(head_dim, &self.kernel.abi())?;
        if params.has_sliding_window() {
            let supported = match self.config.strategy {
                CommStrategy::HeadWindowAllGather => params.causal,
                CommStrategy::RotatingRing => false,
            };
            if !supported {
                return Err(Error::InvalidArgument {
                    arg: "window_size",
                    reason: format!(
                        "sliding windows need causal head-window gathering, got {:?} with causal={}",
                        self.config.strategy, params.causal
                    ),
                });
            }
        }

        let heads_k_stride = self.config.heads_k_stride_for(num_kv_heads)?;
        Ok(StepContext {
            kernel: self.kernel.as_ref(),
            group: self.group.as_ref(),
            shard,
            params: kernel_params,
            heads_k_stride,
            num_heads,
            num_kv_heads,
        })
    }
}

//! Variable-length (packed) attention kernel seam
//!
//! The ring engine never does attention math itself. It calls a kernel through
//! this trait once per head-group window (or ring hop), always on tensors that
//! are already resident on the local device.

use crate::error::Result;
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Fixed description of what one kernel build accepts.
///
/// Chosen when the integration is built, not discovered at run time. The
/// engine validates requested [`AttentionParams`](crate::config::AttentionParams)
/// against it once per call and never branches on kernel capability afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelAbi {
    pub version: u32,
    pub sliding_window: bool,
    pub dropout: bool,
    pub deterministic_backward: bool,
}

impl KernelAbi {
    /// The CPU reference kernel shipped with this crate.
    pub const CPU_REFERENCE: KernelAbi = KernelAbi {
        version: 1,
        sliding_window: true,
        dropout: false,
        deterministic_backward: true,
    };
}

/// Resolved per-call kernel parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelParams {
    pub softmax_scale: f64,
    pub dropout_p: f64,
    pub causal: bool,
    /// `(left, right)`; -1 is unbounded.
    pub window_size: (isize, isize),
    pub deterministic: bool,
}

impl KernelParams {
    /// Same parameters with a different causal flag.
    pub fn with_causal(&self, causal: bool) -> Self {
        Self { causal, ..*self }
    }
}

/// Packed batch layout for one kernel call.
///
/// `cu_seqlens_q`/`cu_seqlens_k` are `[batch + 1]` I32 device tensors; the host
/// copies are kept alongside so CPU kernels and validation need no readback.
pub struct VarlenBatch<R: Runtime> {
    pub cu_seqlens_q: Tensor<R>,
    pub cu_seqlens_k: Tensor<R>,
    pub host_cu_seqlens_q: Vec<i32>,
    pub host_cu_seqlens_k: Vec<i32>,
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
}

impl<R: Runtime<DType = DType>> VarlenBatch<R> {
    pub fn new(cu_seqlens_q: &[i32], cu_seqlens_k: &[i32], device: &R::Device) -> Self {
        let max_of = |cu: &[i32]| {
            cu.windows(2)
                .map(|w| (w[1] - w[0]).max(0) as usize)
                .max()
                .unwrap_or(0)
        };
        Self {
            cu_seqlens_q: Tensor::<R>::from_slice(cu_seqlens_q, &[cu_seqlens_q.len()], device),
            cu_seqlens_k: Tensor::<R>::from_slice(cu_seqlens_k, &[cu_seqlens_k.len()], device),
            host_cu_seqlens_q: cu_seqlens_q.to_vec(),
            host_cu_seqlens_k: cu_seqlens_k.to_vec(),
            max_seqlen_q: max_of(cu_seqlens_q),
            max_seqlen_k: max_of(cu_seqlens_k),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.host_cu_seqlens_q.len().saturating_sub(1)
    }
}

/// Variable-length attention kernel: forward and backward over packed sequences.
///
/// # Layout contract
///
/// - `q`: `[total_q, num_heads, head_dim]`
/// - `k`, `v`: `[total_k, num_kv_heads, head_dim]`, `num_heads % num_kv_heads == 0`
/// - output: `[total_q, num_heads, head_dim]`
/// - logsumexp: `[num_heads, total_q]` (F32)
///
/// Causal masking is aligned to the bottom-right corner of each sequence's
/// score block: query `i` of a sequence with `sq` queries and `sk` keys sees key
/// `j` iff `j <= i + sk - sq`. A query row with no visible key has output 0 and
/// logsumexp `-inf`.
#[allow(clippy::too_many_arguments)]
pub trait VarlenAttentionKernel<R: Runtime>: Send + Sync {
    /// The ABI this kernel build implements.
    fn abi(&self) -> KernelAbi;

    /// Returns `(output, logsumexp)`.
    fn forward(
        &self,
        q: &Tensor<R>,
        k: &Tensor<R>,
        v: &Tensor<R>,
        batch: &VarlenBatch<R>,
        params: &KernelParams,
    ) -> Result<(Tensor<R>, Tensor<R>)>;

    /// Returns `(dq, dk, dv)`.
    ///
    /// `output` and `lse` may be the final values of a larger attention the
    /// block belongs to; gradients are then this block's exact contribution.
    fn backward(
        &self,
        dout: &Tensor<R>,
        q: &Tensor<R>,
        k: &Tensor<R>,
        v: &Tensor<R>,
        output: &Tensor<R>,
        lse: &Tensor<R>,
        batch: &VarlenBatch<R>,
        params: &KernelParams,
    ) -> Result<(Tensor<R>, Tensor<R>, Tensor<R>)>;
}

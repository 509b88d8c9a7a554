//! Conversion between padded and packed log-sum-exp layouts.
//!
//! ```text
//! padded: [num_seqs, num_heads, max_seqlen]   row b, head h, position t
//! packed: [num_heads, total_tokens]           head h, token cu_seqlens[b] + t
//! ```
//!
//! Every `(sequence, head, position)` is independent; heads are converted in
//! parallel on the host.

use rayon::prelude::*;

use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

fn validate_cu_seqlens(cu_seqlens: &[i32]) -> Result<()> {
    if cu_seqlens.is_empty() || cu_seqlens[0] != 0 {
        return Err(Error::InvalidArgument {
            arg: "cu_seqlens",
            reason: "must start with 0".to_string(),
        });
    }
    if cu_seqlens.windows(2).any(|w| w[1] < w[0]) {
        return Err(Error::InvalidArgument {
            arg: "cu_seqlens",
            reason: "boundaries must be non-decreasing".to_string(),
        });
    }
    Ok(())
}

fn require_f32<R: Runtime<DType = DType>>(t: &Tensor<R>) -> Result<()> {
    if t.dtype() != DType::F32 {
        return Err(Error::DTypeMismatch {
            expected: DType::F32,
            got: t.dtype(),
        });
    }
    Ok(())
}

/// `[num_seqs, num_heads, max_seqlen]` to `[num_heads, total_tokens]`.
///
/// Padding past each sequence's true length is dropped.
pub fn flatten_varlen_lse<R: Runtime<DType = DType>>(
    padded: &Tensor<R>,
    cu_seqlens: &[i32],
) -> Result<Tensor<R>> {
    validate_cu_seqlens(cu_seqlens)?;
    require_f32(padded)?;
    let shape = padded.shape();
    if shape.len() != 3 || shape[0] != cu_seqlens.len() - 1 {
        return Err(Error::InvalidArgument {
            arg: "padded",
            reason: format!(
                "expected [{}, heads, max_seqlen], got {shape:?}",
                cu_seqlens.len() - 1
            ),
        });
    }
    let (num_heads, max_seqlen) = (shape[1], shape[2]);
    check_fits(cu_seqlens, max_seqlen)?;

    let total = *cu_seqlens.last().unwrap_or(&0) as usize;
    let src = padded.contiguous().to_vec::<f32>();
    let mut packed = vec![0.0f32; num_heads * total];

    packed
        .par_chunks_mut(total.max(1))
        .take(num_heads)
        .enumerate()
        .for_each(|(h, row)| {
            for (b, w) in cu_seqlens.windows(2).enumerate() {
                let (start, len) = (w[0] as usize, (w[1] - w[0]) as usize);
                let from = (b * num_heads + h) * max_seqlen;
                row[start..start + len].copy_from_slice(&src[from..from + len]);
            }
        });

    Ok(Tensor::<R>::from_slice(&packed, &[num_heads, total], padded.device()))
}

/// `[num_heads, total_tokens]` to `[num_seqs, num_heads, max_seqlen]`.
///
/// Positions past each sequence's true length are zero.
pub fn unflatten_varlen_lse<R: Runtime<DType = DType>>(
    packed: &Tensor<R>,
    cu_seqlens: &[i32],
    max_seqlen: usize,
) -> Result<Tensor<R>> {
    validate_cu_seqlens(cu_seqlens)?;
    require_f32(packed)?;
    let total = *cu_seqlens.last().unwrap_or(&0) as usize;
    let shape = packed.shape();
    if shape.len() != 2 || shape[1] != total {
        return Err(Error::InvalidArgument {
            arg: "packed",
            reason: format!("expected [heads, {total}], got {shape:?}"),
        });
    }
    check_fits(cu_seqlens, max_seqlen)?;

    let num_heads = shape[0];
    let num_seqs = cu_seqlens.len() - 1;
    let src = packed.contiguous().to_vec::<f32>();
    let mut padded = vec![0.0f32; num_seqs * num_heads * max_seqlen];

    // One chunk per (sequence, head) row
    padded
        .par_chunks_mut(max_seqlen.max(1))
        .take(num_seqs * num_heads)
        .enumerate()
        .for_each(|(row_idx, row)| {
            let (b, h) = (row_idx / num_heads, row_idx % num_heads);
            let (start, end) = (cu_seqlens[b] as usize, cu_seqlens[b + 1] as usize);
            let from = h * total + start;
            row[..end - start].copy_from_slice(&src[from..from + end - start]);
        });

    Ok(Tensor::<R>::from_slice(
        &padded,
        &[num_seqs, num_heads, max_seqlen],
        packed.device(),
    ))
}

fn check_fits(cu_seqlens: &[i32], max_seqlen: usize) -> Result<()> {
    if let Some((b, w)) = cu_seqlens
        .windows(2)
        .enumerate()
        .find(|(_, w)| (w[1] - w[0]) as usize > max_seqlen)
    {
        return Err(Error::InvalidArgument {
            arg: "max_seqlen",
            reason: format!(
                "sequence {b} has length {} > max_seqlen {max_seqlen}",
                w[1] - w[0]
            ),
        });
    }
    Ok(())
}

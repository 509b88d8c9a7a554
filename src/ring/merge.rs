//! Online softmax merge of partial attention results
//!
//! Each block of keys gives a partial `(out, lse)` for the same queries. Two
//! partials combine exactly as
//!
//! ```text
//! out' = out - sigmoid(lse_b - lse) * (out - out_b)
//! lse' = lse + softplus(lse_b - lse)       (= lse - logsigmoid(lse - lse_b))
//! ```
//!
//! so the full score matrix is never materialized and no large exponent is
//! ever formed.
//!
//! The accumulator is F32 with `out: [n, H, D]` and `lse: [n, H, 1]`; blocks
//! arrive in the kernel's `[H, n]` lse layout.

use std::ops::Range;

use super::rows::{replace_rows, take_rows};
use super::traits::RingClient;
use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Running `(out, lse)` accumulator.
///
/// Rows of the accumulator that are still `-inf` must only be merged with
/// blocks whose lse is finite.
pub struct OnlineSoftmaxMerger<R: Runtime> {
    state: Option<(Tensor<R>, Tensor<R>)>,
}

impl<R: Runtime<DType = DType>> Default for OnlineSoftmaxMerger<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Runtime<DType = DType>> OnlineSoftmaxMerger<R> {
    pub fn new() -> Self {
        Self { state: None }
    }

    pub fn is_seeded(&self) -> bool {
        self.state.is_some()
    }

    /// Merge a block covering every accumulator row. The first call seeds.
    pub fn update<C: RingClient<R>>(
        &mut self,
        client: &C,
        block_out: &Tensor<R>,
        block_lse: &Tensor<R>,
    ) -> Result<()> {
        let (block_out, block_lse) = prepare_block(client, block_out, block_lse)?;
        let merged = match &self.state {
            None => (block_out, block_lse),
            Some((out, lse)) => {
                check_same_shape(out, &block_out)?;
                merge(client, out, lse, &block_out, &block_lse)?
            }
        };
        self.state = Some(merged);
        Ok(())
    }

    /// Merge a block covering only accumulator rows `rows`.
    pub fn update_rows<C: RingClient<R>>(
        &mut self,
        client: &C,
        rows: Range<usize>,
        block_out: &Tensor<R>,
        block_lse: &Tensor<R>,
    ) -> Result<()> {
        let (out, lse) = self.state.as_ref().ok_or_else(|| Error::InvalidArgument {
            arg: "rows",
            reason: "merge into a row range needs a seeded accumulator".to_string(),
        })?;

        let (block_out, block_lse) = prepare_block(client, block_out, block_lse)?;
        let out_rows = take_rows(out, rows.clone())?;
        let lse_rows = take_rows(lse, rows.clone())?;
        check_same_shape(&out_rows, &block_out)?;
        let (merged_out, merged_lse) = merge(client, &out_rows, &lse_rows, &block_out, &block_lse)?;

        let out = replace_rows(client, out, rows.start, &merged_out)?;
        let lse = replace_rows(client, lse, rows.start, &merged_lse)?;
        self.state = Some((out, lse));
        Ok(())
    }

    /// Final `(out [n, H, D], lse [H, n])`.
    pub fn finish(self) -> Result<(Tensor<R>, Tensor<R>)> {
        let (out, lse) = self.state.ok_or_else(|| Error::InvalidArgument {
            arg: "merger",
            reason: "finish called before any block was merged".to_string(),
        })?;
        let (n, h) = (lse.shape()[0], lse.shape()[1]);
        let lse = lse
            .reshape(&[n, h])
            .map_err(Error::Numr)?
            .transpose(0, 1)
            .map_err(Error::Numr)?
            .contiguous();
        Ok((out, lse))
    }
}

fn check_same_shape<R: Runtime>(acc: &Tensor<R>, block: &Tensor<R>) -> Result<()> {
    if acc.shape() != block.shape() {
        return Err(Error::InvalidArgument {
            arg: "block_out",
            reason: format!(
                "block shape {:?} does not match accumulator {:?}",
                block.shape(),
                acc.shape()
            ),
        });
    }
    Ok(())
}

/// F32 `out` and `[H, n]` lse turned into `[n, H, 1]`.
fn prepare_block<R, C>(
    client: &C,
    block_out: &Tensor<R>,
    block_lse: &Tensor<R>,
) -> Result<(Tensor<R>, Tensor<R>)>
where
    R: Runtime<DType = DType>,
    C: RingClient<R>,
{
    if block_out.shape().len() != 3 {
        return Err(Error::InvalidArgument {
            arg: "block_out",
            reason: format!("expected [n, heads, head_dim], got {:?}", block_out.shape()),
        });
    }
    let (n, h) = (block_out.shape()[0], block_out.shape()[1]);
    if block_lse.shape() != [h, n] {
        return Err(Error::InvalidArgument {
            arg: "block_lse",
            reason: format!("expected [{h}, {n}], got {:?}", block_lse.shape()),
        });
    }

    let out = to_f32(client, block_out)?;
    let lse = to_f32(client, block_lse)?
        .transpose(0, 1)
        .map_err(Error::Numr)?
        .contiguous()
        .reshape(&[n, h, 1])
        .map_err(Error::Numr)?;
    Ok((out, lse))
}

fn to_f32<R, C>(client: &C, t: &Tensor<R>) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: RingClient<R>,
{
    if t.dtype() == DType::F32 {
        Ok(t.contiguous())
    } else {
        client.cast(t, DType::F32).map_err(Error::Numr)
    }
}

fn merge<R, C>(
    client: &C,
    out: &Tensor<R>,
    lse: &Tensor<R>,
    block_out: &Tensor<R>,
    block_lse: &Tensor<R>,
) -> Result<(Tensor<R>, Tensor<R>)>
where
    R: Runtime<DType = DType>,
    C: RingClient<R>,
{
    let diff = client.sub(block_lse, lse).map_err(Error::Numr)?;
    let weight = client.sigmoid(&diff).map_err(Error::Numr)?;
    let delta = client.sub(out, block_out).map_err(Error::Numr)?;
    let step = client.mul(&weight, &delta).map_err(Error::Numr)?;
    let new_out = client.sub(out, &step).map_err(Error::Numr)?;

    let growth = client.softplus(&diff).map_err(Error::Numr)?;
    let new_lse = client.add(lse, &growth).map_err(Error::Numr)?;
    Ok((new_out, new_lse))
}

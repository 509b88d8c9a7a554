//! Row-range (dim 0) placement helpers.

use std::ops::Range;

use super::traits::RingClient;
use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

fn check_rows(rows: Range<usize>, total: usize) -> Result<()> {
    if rows.start > rows.end || rows.end > total {
        return Err(Error::InvalidArgument {
            arg: "rows",
            reason: format!("range {rows:?} out of bounds for {total} rows"),
        });
    }
    Ok(())
}

fn zero_rows<R: Runtime<DType = DType>>(like: &Tensor<R>, rows: usize) -> Tensor<R> {
    let mut shape = like.shape().to_vec();
    shape[0] = rows;
    Tensor::<R>::zeros(&shape, like.dtype(), like.device())
}

/// Zero tensor with `total` rows holding `block` at rows `start..`.
pub fn pad_rows<R, C>(client: &C, block: &Tensor<R>, start: usize, total: usize) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: RingClient<R>,
{
    let n = block.shape()[0];
    check_rows(start..start + n, total)?;
    let tail = total - start - n;
    if start == 0 && tail == 0 {
        return Ok(block.contiguous());
    }

    let head = (start > 0).then(|| zero_rows(block, start));
    let rest = (tail > 0).then(|| zero_rows(block, tail));
    let parts: Vec<&Tensor<R>> = head.iter().chain([block]).chain(rest.iter()).collect();
    client.cat(&parts, 0).map_err(Error::Numr)
}

/// `acc` with `delta` added to rows `start..start + delta.rows`.
pub fn add_rows<R, C>(client: &C, acc: &Tensor<R>, start: usize, delta: &Tensor<R>) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: RingClient<R>,
{
    let padded = pad_rows(client, delta, start, acc.shape()[0])?;
    client.add(acc, &padded).map_err(Error::Numr)
}

/// `acc` with rows `start..start + block.rows` replaced by `block`.
pub fn replace_rows<R, C>(
    client: &C,
    acc: &Tensor<R>,
    start: usize,
    block: &Tensor<R>,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: RingClient<R>,
{
    let total = acc.shape()[0];
    let n = block.shape()[0];
    check_rows(start..start + n, total)?;
    if start == 0 && n == total {
        return Ok(block.contiguous());
    }

    let head = match start {
        0 => None,
        _ => Some(acc.narrow(0, 0, start).map_err(Error::Numr)?),
    };
    let tail = match total - start - n {
        0 => None,
        len => Some(acc.narrow(0, start + n, len).map_err(Error::Numr)?),
    };
    let parts: Vec<&Tensor<R>> = head.iter().chain([block]).chain(tail.iter()).collect();
    client.cat(&parts, 0).map_err(Error::Numr)
}

/// Rows `rows` of `t` as a contiguous tensor.
pub fn take_rows<R: Runtime<DType = DType>>(t: &Tensor<R>, rows: Range<usize>) -> Result<Tensor<R>> {
    check_rows(rows.clone(), t.shape()[0])?;
    Ok(t.narrow(0, rows.start, rows.len()).map_err(Error::Numr)?.contiguous())
}

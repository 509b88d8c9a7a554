//! Client bound for the ring attention engine.

use numr::ops::{ActivationOps, BinaryOps, ShapeOps, TypeConversionOps};
use numr::runtime::{Runtime, RuntimeClient};

/// Every numr op the ring engine composes, beyond the external kernel.
///
/// Blanket-implemented for any client that provides them.
pub trait RingClient<R: Runtime>:
    RuntimeClient<R> + ShapeOps<R> + BinaryOps<R> + ActivationOps<R> + TypeConversionOps<R>
{
}

impl<R, C> RingClient<R> for C
where
    R: Runtime,
    C: RuntimeClient<R> + ShapeOps<R> + BinaryOps<R> + ActivationOps<R> + TypeConversionOps<R>,
{
}

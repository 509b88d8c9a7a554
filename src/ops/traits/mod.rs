pub mod varlen_kernel;

pub use varlen_kernel::{KernelAbi, KernelParams, VarlenAttentionKernel, VarlenBatch};

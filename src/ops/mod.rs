pub mod autograd_ring;
pub mod cpu;
pub mod traits;

pub use autograd_ring::{
    RingAttentionCtx, RingAttentionOutput, var_ring_attention, var_ring_attention_kvpacked,
    var_ring_attention_qkvpacked,
};
pub use cpu::CpuVarlenKernel;
pub use traits::{KernelAbi, KernelParams, VarlenAttentionKernel, VarlenBatch};

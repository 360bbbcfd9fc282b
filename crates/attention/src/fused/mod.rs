//! Native-kernel seam and the dispatch machinery around it.
//!
//! The accelerator library exposes its fused attention operations by
//! implementing [`NativeAttentionKernel`] and installing the instance into
//! the process-wide registry. Absence of a kernel is not an error at load
//! time, only at call time.

pub mod dispatch;
pub mod registry;
pub mod storage;

use candle_core::{Device, Tensor};

use crate::core::{AttentionParams, Result};

pub use dispatch::{
    flash_attention, select_path, AttentionOutput, BackwardPath, FlashAttention, GradientContext,
};
pub use registry::{install, installed, is_available, uninstall};
pub use storage::ensure_shared;

/// Typed interface to the accelerator's fused attention operations.
///
/// Implementations wrap opaque hardware kernels; tensor operands handed to
/// them are already resident on [`NativeAttentionKernel::device`] and
/// normalized for export (see [`ensure_shared`]).
pub trait NativeAttentionKernel: Send + Sync {
    /// Device whose buffers this kernel consumes.
    fn device(&self) -> Device;

    /// Fused forward pass: returns the attention output and the dropout mask
    /// (`1` kept, `0` dropped), both shaped like the query.
    fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        params: &AttentionParams,
    ) -> Result<(Tensor, Tensor)>;

    /// Fused backward pass with dropout, consuming the retained mask.
    fn backward(
        &self,
        grad_output: &Tensor,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: &Tensor,
        params: &AttentionParams,
    ) -> Result<(Tensor, Tensor, Tensor)>;

    /// Whether the backward operation is registered. Inference-only kernel
    /// builds ship without it.
    fn supports_backward(&self) -> bool {
        true
    }
}

//! Best-effort materialization of tensors into kernel-exportable storage.
//!
//! The native backward kernel maps operand buffers directly and rejects
//! private or view-derived allocations. The tensor engine does not expose
//! the allocator's storage mode, so this module infers it from layout and
//! autodiff metadata and copies whenever a tensor looks suspicious. A wrong
//! guess costs one copy, or a kernel execution error that the backward
//! dispatcher recovers from.

use candle_core::{Device, Tensor};

use crate::core::Result;

/// Return a tensor backed by storage the native backward kernel accepts.
///
/// Tensors that do not live on `accelerator` pass through unchanged.
/// Materializing is value-preserving, so skipping gradient recording here is
/// sound: backward consumers receive gradients in the original logical
/// layout.
pub fn ensure_shared(t: &Tensor, accelerator: &Device) -> Result<Tensor> {
    if !t.device().same_device(accelerator) {
        return Ok(t.clone());
    }
    if !t.is_contiguous() {
        return Ok(t.contiguous()?);
    }
    // A contiguous tensor can still alias exported storage through
    // non-canonical strides on unit dimensions; compare against row-major
    // strides directly and copy when they disagree.
    if t.layout().stride() != row_major_strides(t.dims()) {
        return Ok(t.copy()?);
    }
    // Tensors attached to the autodiff graph (gradients, saved activations)
    // carry no storage-mode guarantee; force a fresh allocation.
    if t.is_variable() {
        return Ok(t.detach().copy()?);
    }
    Ok(t.clone())
}

fn row_major_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    strides
}

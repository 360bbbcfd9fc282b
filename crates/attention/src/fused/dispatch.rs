//! Forward and backward dispatchers around the native attention kernel.
//!
//! Forward always runs on the native kernel; a forward failure is a
//! configuration or kernel error and is surfaced to the caller, because the
//! backward pass must know which path produced the retained mask. Backward
//! prefers the native kernel and recomputes gradients through the reference
//! path when the kernel fails, so training keeps going at reduced speed with
//! mathematically equivalent gradients.

use std::sync::{Arc, OnceLock};

use candle_core::backprop::GradStore;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Tensor, Var};

use crate::core::{AttentionBackend, AttentionError, AttentionParams, DispatchConfig, Result};
use crate::reference::reference_attention;

use super::registry;
use super::storage::ensure_shared;
use super::NativeAttentionKernel;

/// Which implementation the backward dispatcher commits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackwardPath {
    /// Run the native backward kernel.
    Accelerated,
    /// Recompute gradients through the reference attention path.
    Fallback,
}

/// Pure fallback decision: the native path is taken only when the backward
/// operation is registered and has not already failed for this context.
pub fn select_path(backward_available: bool, attempt_failed: bool) -> BackwardPath {
    if backward_available && !attempt_failed {
        BackwardPath::Accelerated
    } else {
        BackwardPath::Fallback
    }
}

impl std::fmt::Debug for AttentionOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttentionOutput")
            .field("output", &self.output)
            .field("mask", &self.mask)
            .finish_non_exhaustive()
    }
}

/// Result of a dispatched forward call.
pub struct AttentionOutput {
    /// Attention output, same shape as the query tensor.
    pub output: Tensor,
    /// Retained dropout mask (`1` kept, `0` dropped), detached from the
    /// gradient graph.
    pub mask: Tensor,
    /// Single-use handle for the corresponding backward pass.
    pub context: GradientContext,
}

/// Dispatches attention calls to the installed native kernel.
pub struct FlashAttention {
    config: DispatchConfig,
    kernel: Option<Arc<dyn NativeAttentionKernel>>,
    first_call: OnceLock<()>,
}

impl FlashAttention {
    /// Dispatcher backed by the process-wide registry, configured from the
    /// environment.
    pub fn new() -> Self {
        Self::with_config(DispatchConfig::from_env())
    }

    pub fn with_config(config: DispatchConfig) -> Self {
        Self {
            config,
            kernel: None,
            first_call: OnceLock::new(),
        }
    }

    /// Dispatcher bound to an explicit kernel instead of the registry.
    pub fn with_kernel(kernel: Arc<dyn NativeAttentionKernel>, config: DispatchConfig) -> Self {
        Self {
            config,
            kernel: Some(kernel),
            first_call: OnceLock::new(),
        }
    }

    // The registry is consulted on every call; registration may happen after
    // the dispatcher is constructed.
    fn resolve_kernel(&self) -> Option<Arc<dyn NativeAttentionKernel>> {
        self.kernel.clone().or_else(registry::installed)
    }

    /// Validate inputs, run the native forward kernel, and capture the
    /// gradient context for the backward pass.
    ///
    /// There is no forward fallback: every failure here is a configuration,
    /// validation, or kernel error and is surfaced to the caller.
    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        params: AttentionParams,
    ) -> Result<AttentionOutput> {
        params.validate()?;
        let kernel = self.resolve_kernel().ok_or_else(|| {
            AttentionError::Configuration("native attention kernel is not installed".to_string())
        })?;
        let device = kernel.device();
        if !runtime_available(&device) {
            return Err(AttentionError::Configuration(format!(
                "accelerator runtime for {device:?} is not available"
            )));
        }
        validate_residency(q, k, v, &device)?;
        validate_shapes(q, k, v)?;

        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::fused init device={device:?} strict={} debug={}",
                self.config.strict,
                self.config.debug
            );
        }

        // Forward tolerates more layouts than backward; contiguity is the
        // only transform applied here and it preserves values.
        let q = q.contiguous()?;
        let k = k.contiguous()?;
        let v = v.contiguous()?;

        let (output, mask) = kernel
            .forward(&q, &k, &v, &params)
            .map_err(AttentionError::into_execution)?;
        if output.dims() != q.dims() {
            return Err(AttentionError::KernelExecution(format!(
                "native forward returned output shape {:?}, expected {:?}",
                output.dims(),
                q.dims()
            )));
        }
        if mask.dims() != output.dims() {
            return Err(AttentionError::KernelExecution(format!(
                "native forward returned mask shape {:?}, expected {:?}",
                mask.dims(),
                output.dims()
            )));
        }
        // The mask is a side output: required for backward, never
        // differentiated.
        let mask = mask.contiguous()?.detach();

        let context = GradientContext {
            saved: Some(SavedForBackward {
                kernel,
                q,
                k,
                v,
                mask: mask.clone(),
                params,
            }),
            config: self.config,
        };
        Ok(AttentionOutput {
            output,
            mask,
            context,
        })
    }
}

impl Default for FlashAttention {
    fn default() -> Self {
        Self::new()
    }
}

impl AttentionBackend for FlashAttention {
    fn compute(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        params: &AttentionParams,
    ) -> Result<(Tensor, Tensor)> {
        let AttentionOutput { output, mask, .. } = self.forward(q, k, v, *params)?;
        Ok((output, mask))
    }
}

/// Run accelerated attention with the process-wide kernel and environment
/// configuration.
pub fn flash_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    scale: f64,
    dropout_p: f32,
    causal: bool,
) -> Result<AttentionOutput> {
    FlashAttention::new().forward(q, k, v, AttentionParams::new(scale, dropout_p, causal))
}

struct SavedForBackward {
    kernel: Arc<dyn NativeAttentionKernel>,
    q: Tensor,
    k: Tensor,
    v: Tensor,
    mask: Tensor,
    params: AttentionParams,
}

/// Saved tensors and parameters for a single backward invocation.
pub struct GradientContext {
    saved: Option<SavedForBackward>,
    config: DispatchConfig,
}

impl GradientContext {
    /// Compute `(grad_q, grad_k, grad_v)` for the forward call that produced
    /// this context, seeded by `grad_output`.
    ///
    /// The saved state is consumed on the first call; invoking backward a
    /// second time is a contract violation.
    pub fn backward(&mut self, grad_output: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let saved = self.saved.take().ok_or(AttentionError::ContractViolation(
            "backward invoked twice on the same gradient context",
        ))?;
        if grad_output.dims() != saved.q.dims() {
            return Err(AttentionError::Validation(format!(
                "grad_output shape {:?} does not match output shape {:?}",
                grad_output.dims(),
                saved.q.dims()
            )));
        }
        let device = saved.kernel.device();
        // Off-accelerator there is nothing to fall back to.
        if !runtime_available(&device) {
            return Err(AttentionError::Configuration(format!(
                "accelerator runtime for {device:?} is not available; cannot run backward"
            )));
        }

        let backward_available = saved.kernel.supports_backward();
        if !backward_available && self.config.strict {
            return Err(AttentionError::Configuration(
                "native backward kernel unavailable and strict mode forbids the reference fallback"
                    .to_string(),
            ));
        }

        let mut path = select_path(backward_available, false);
        if path == BackwardPath::Accelerated {
            match native_backward(&saved, grad_output, &device) {
                Ok(grads) => return Ok(grads),
                Err(err) => {
                    log::warn!(
                        "native attention backward failed; recomputing gradients through the reference path"
                    );
                    if self.config.debug {
                        log::debug!("native backward error: {err}");
                    }
                    path = select_path(backward_available, true);
                }
            }
        } else if self.config.debug {
            log::debug!("native backward kernel unavailable; using the reference fallback");
        }
        debug_assert_eq!(path, BackwardPath::Fallback);

        fallback_gradients(&saved, grad_output)
    }
}

fn native_backward(
    saved: &SavedForBackward,
    grad_output: &Tensor,
    device: &Device,
) -> Result<(Tensor, Tensor, Tensor)> {
    // Gradients and saved activations come out of the autodiff machinery
    // with no storage-mode guarantee; normalize everything the kernel maps.
    let grad_out = ensure_shared(grad_output, device)?;
    let q = ensure_shared(&saved.q, device)?;
    let k = ensure_shared(&saved.k, device)?;
    let v = ensure_shared(&saved.v, device)?;
    let mask = ensure_shared(&saved.mask, device)?;

    let (grad_q, grad_k, grad_v) = saved
        .kernel
        .backward(&grad_out, &q, &k, &v, &mask, &saved.params)?;
    for (name, grad, input) in [
        ("grad_q", &grad_q, &saved.q),
        ("grad_k", &grad_k, &saved.k),
        ("grad_v", &grad_v, &saved.v),
    ] {
        if grad.dims() != input.dims() {
            return Err(AttentionError::KernelExecution(format!(
                "native backward returned {name} with shape {:?}, expected {:?}",
                grad.dims(),
                input.dims()
            )));
        }
    }
    // Copy out of kernel-owned buffers; the kernel may recycle them on the
    // next dispatch.
    Ok((grad_q.copy()?, grad_k.copy()?, grad_v.copy()?))
}

fn fallback_gradients(
    saved: &SavedForBackward,
    grad_output: &Tensor,
) -> Result<(Tensor, Tensor, Tensor)> {
    // Fresh leaves with gradient tracking; the saved tensors themselves stay
    // untouched so the caller's graph is not disturbed.
    let q = Var::from_tensor(&saved.q.detach())?;
    let k = Var::from_tensor(&saved.k.detach())?;
    let v = Var::from_tensor(&saved.v.detach())?;

    let output = reference_attention(&q, &k, &v, saved.params.scale, saved.params.causal)?;

    // The reference path skips dropout; folding the retained mask into the
    // seed restricts gradient flow to positions the original dropout kept,
    // with inverted-dropout scaling.
    let keep_scale = 1.0 / (1.0 - f64::from(saved.params.dropout_p));
    let seed = grad_output
        .detach()
        .mul(&saved.mask.to_dtype(grad_output.dtype())?)?
        .affine(keep_scale, 0.0)?;

    // d(sum(output * seed))/dx is exactly the vector-Jacobian product the
    // caller expects from the fused backward.
    let grads = output.mul(&seed)?.sum_all()?.backward()?;
    let grad_q = take_grad(&grads, &q, "query")?;
    let grad_k = take_grad(&grads, &k, "key")?;
    let grad_v = take_grad(&grads, &v, "value")?;
    Ok((grad_q, grad_k, grad_v))
}

fn take_grad(grads: &GradStore, var: &Var, name: &str) -> Result<Tensor> {
    grads.get(var.as_tensor()).cloned().ok_or_else(|| {
        AttentionError::Tensor(candle_core::Error::Msg(format!(
            "reference backward recorded no gradient for {name}"
        )))
    })
}

fn runtime_available(device: &Device) -> bool {
    match device {
        Device::Cpu => true,
        Device::Cuda(_) => cuda_is_available(),
        Device::Metal(_) => metal_is_available(),
    }
}

fn validate_residency(q: &Tensor, k: &Tensor, v: &Tensor, device: &Device) -> Result<()> {
    for (name, tensor) in [("query", q), ("key", k), ("value", v)] {
        if !tensor.device().same_device(device) {
            return Err(AttentionError::Validation(format!(
                "{name} tensor must reside on the kernel device {device:?}, got {:?}",
                tensor.device()
            )));
        }
    }
    Ok(())
}

fn validate_shapes(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<()> {
    let rank = q.rank();
    if !(3..=4).contains(&rank) {
        return Err(AttentionError::Validation(format!(
            "attention tensors must be rank 3 or 4 with a trailing head_dim, got shape {:?}",
            q.dims()
        )));
    }
    let (q_dims, k_dims, v_dims) = (q.dims(), k.dims(), v.dims());
    if k_dims.len() != rank || v_dims != k_dims {
        return Err(AttentionError::Validation(format!(
            "key/value shapes must agree and match the query rank: q={q_dims:?} k={k_dims:?} v={v_dims:?}"
        )));
    }
    if k_dims[..rank - 2] != q_dims[..rank - 2] || k_dims[rank - 1] != q_dims[rank - 1] {
        return Err(AttentionError::Validation(format!(
            "key shape {k_dims:?} is incompatible with query shape {q_dims:?}"
        )));
    }
    let head_dim = q_dims[rank - 1];
    if head_dim % 8 != 0 {
        return Err(AttentionError::Validation(format!(
            "head_dim must be a multiple of eight, got {head_dim}"
        )));
    }
    Ok(())
}

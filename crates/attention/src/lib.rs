//! Accelerated scaled-dot-product attention with automatic fallback.
//!
//! The crate sits between a transformer attention module and a native
//! accelerator kernel. Forward calls are routed to the installed
//! [`NativeAttentionKernel`], operands are materialized into the storage
//! layout the kernel requires, and when the native backward fails the
//! gradients are recomputed through the always-correct reference path without
//! breaking the caller's gradient graph.
//!
//! Inputs `Q`, `K`, and `V` share the layout `[batch, n_heads, seq_len,
//! head_dim]` (or the merged `[batch * n_heads, seq_len, head_dim]`) and
//! dtype (f32, f16, or bf16). The forward output matches the query shape and
//! is paired with a retained dropout mask. Backward re-uses that mask on
//! either execution path, so both paths honour the kernel's inverted-dropout
//! contract.
//!
//! Host modules consume the layer through the [`AttentionBackend`] trait or
//! the [`flash_attention`] entry point; the accelerator library installs its
//! kernel through [`fused::install`] once its shared library is loaded.

pub mod core;
pub mod fused;
pub mod masks;
pub mod reference;

pub use crate::core::{AttentionBackend, AttentionError, AttentionParams, DispatchConfig, Result};
pub use fused::{
    flash_attention, install, is_available, AttentionOutput, BackwardPath, FlashAttention,
    GradientContext, NativeAttentionKernel,
};
pub use reference::reference_attention;

//! Core traits and types shared across the dispatch layer.
//!
//! Implementations operate on tensors with layout `[batch, n_heads, seq_len,
//! head_dim]` or the merged `[batch * n_heads, seq_len, head_dim]`. The
//! output tensor mirrors the layout and dtype of the query.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::{AttentionParams, DispatchConfig};
pub use errors::{AttentionError, Result};

/// Unified interface for attention backends.
///
/// Host attention modules take a backend instance by injection rather than
/// patching a shared method table, so an accelerated implementation can be
/// swapped in without touching the host's source.
///
/// * `q`, `k`, and `v` share layout and dtype; the returned output mirrors
///   the query shape.
/// * The second returned tensor is the retained dropout mask (`1` kept,
///   `0` dropped), detached from the gradient graph.
pub trait AttentionBackend {
    /// Compute scaled-dot-product attention, returning output and mask.
    fn compute(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        params: &AttentionParams,
    ) -> Result<(Tensor, Tensor)>;
}

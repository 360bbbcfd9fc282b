//! Reference attention kernel.
//!
//! The computation stays on primitive matmul/softmax operations. It must
//! never call a fused attention entry point: an installed native kernel
//! could otherwise be re-entered from its own fallback.

use candle_core::{Tensor, D};
use candle_nn::ops::softmax;

use crate::core::{AttentionError, Result};
use crate::masks::build_causal_mask;

/// Fully differentiable scaled-dot-product attention.
///
/// Accepts `[batch, n_heads, seq_len, head_dim]` or merged
/// `[batch * n_heads, seq_len, head_dim]` inputs; the output mirrors the
/// query shape. With `causal`, strictly-future score entries are pushed to
/// the dtype's most negative finite value before the softmax.
///
/// Dropout is deliberately not applied here. Callers reproduce it from the
/// retained mask with inverted-dropout scaling so both execution paths agree.
pub fn reference_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    scale: f64,
    causal: bool,
) -> Result<Tensor> {
    let q_dims = q.dims().to_vec();
    let rank = q_dims.len();
    if rank < 3 {
        return Err(AttentionError::Validation(format!(
            "attention inputs must be at least rank 3, got shape {q_dims:?}"
        )));
    }
    let head_dim = q_dims[rank - 1];
    let q_len = q_dims[rank - 2];
    let k_dims = k.dims();
    let k_len = k_dims[k_dims.len() - 2];
    let merged: usize = q_dims[..rank - 2].iter().product();

    let q3 = q.reshape((merged, q_len, head_dim))?;
    let k3 = k.reshape((merged, k_len, head_dim))?;
    let v3 = v.reshape((merged, k_len, head_dim))?;

    let mut scores = q3.matmul(&k3.transpose(1, 2)?)?.affine(scale, 0.0)?;
    if causal {
        let mask = build_causal_mask(q.device(), q_len, k_len, scores.dtype())?;
        scores = scores.broadcast_add(&mask)?;
    }
    let probs = softmax(&scores, D::Minus1)?;
    let output = probs.matmul(&v3)?;
    Ok(output.reshape(q_dims)?)
}

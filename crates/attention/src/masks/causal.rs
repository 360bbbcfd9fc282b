//! Builder for additive causal masks.

use candle_core::{DType, Device, Result, Tensor};

/// Most negative finite value representable in `dtype`.
///
/// `f32::MIN` rounds to infinity under bf16 conversion, so the bf16 and f16
/// limits are spelled out.
pub fn mask_fill_value(dtype: DType) -> f32 {
    match dtype {
        DType::F16 => -65504.0,
        DType::BF16 => -3.389_531_4e38,
        _ => f32::MIN,
    }
}

/// Construct a causal mask for the supplied sequence dimensions.
///
/// When `k_len > q_len`, queries are assumed to align with the most recent
/// `q_len` keys, allowing access to the extended prefix.
pub fn build_causal_mask(
    device: &Device,
    q_len: usize,
    k_len: usize,
    dtype: DType,
) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let fill = mask_fill_value(dtype);
    let mut data = vec![0f32; q_len * k_len];

    for q in 0..q_len {
        let row = q * k_len;
        for k in (q + offset + 1)..k_len {
            data[row + k] = fill;
        }
    }

    Tensor::from_vec(data, (q_len, k_len), device)?.to_dtype(dtype)
}

//! In-process software kernel standing in for the native accelerator library.

use std::sync::Mutex;

use attention::masks::build_causal_mask;
use attention::{AttentionError, AttentionParams, NativeAttentionKernel, Result};
use candle_core::{Device, Tensor, D};
use candle_nn::ops::softmax;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Deterministic scaled-dot-product attention kernel with analytic gradients.
///
/// Forward matches the dispatcher's reference semantics plus inverted-dropout
/// on the output; backward derives gradients in closed form, so parity tests
/// compare two genuinely different computations. Dropout masks come from a
/// seeded generator: two kernels built with the same seed produce identical
/// masks for identical call sequences.
pub struct SoftwareKernel {
    device: Device,
    rng: Mutex<StdRng>,
    fail_backward: bool,
    backward_supported: bool,
}

impl SoftwareKernel {
    pub fn new(seed: u64) -> Self {
        Self {
            device: Device::Cpu,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            fail_backward: false,
            backward_supported: true,
        }
    }

    /// Kernel whose backward always reports a storage failure.
    pub fn failing_backward(seed: u64) -> Self {
        Self {
            fail_backward: true,
            ..Self::new(seed)
        }
    }

    /// Kernel registered without a backward operation.
    pub fn forward_only(seed: u64) -> Self {
        Self {
            backward_supported: false,
            ..Self::new(seed)
        }
    }

    fn merged(t: &Tensor) -> Result<Tensor> {
        let dims = t.dims();
        let rank = dims.len();
        let merged: usize = dims[..rank - 2].iter().product();
        Ok(t.reshape((merged, dims[rank - 2], dims[rank - 1]))?)
    }

    fn probs(q: &Tensor, k: &Tensor, params: &AttentionParams) -> Result<Tensor> {
        let q3 = Self::merged(q)?;
        let k3 = Self::merged(k)?;
        let q_len = q3.dims()[1];
        let k_len = k3.dims()[1];
        let mut scores = q3.matmul(&k3.transpose(1, 2)?)?.affine(params.scale, 0.0)?;
        if params.causal {
            let mask = build_causal_mask(q.device(), q_len, k_len, scores.dtype())?;
            scores = scores.broadcast_add(&mask)?;
        }
        Ok(softmax(&scores, D::Minus1)?)
    }

    fn sample_mask(&self, dims: &[usize], device: &Device, dropout_p: f32) -> Result<Tensor> {
        let count: usize = dims.iter().product();
        let mut rng = self.rng.lock().expect("rng mutex poisoned");
        let data: Vec<f32> = (0..count)
            .map(|_| if rng.gen::<f32>() < dropout_p { 0.0 } else { 1.0 })
            .collect();
        Ok(Tensor::from_vec(data, dims, device)?)
    }
}

impl NativeAttentionKernel for SoftwareKernel {
    fn device(&self) -> Device {
        self.device.clone()
    }

    fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        params: &AttentionParams,
    ) -> Result<(Tensor, Tensor)> {
        let probs = Self::probs(q, k, params)?;
        let v3 = Self::merged(v)?;
        let output = probs.matmul(&v3)?.reshape(q.dims())?;

        let mask = self.sample_mask(q.dims(), q.device(), params.dropout_p)?;
        let keep_scale = 1.0 / (1.0 - f64::from(params.dropout_p));
        let output = output.mul(&mask)?.affine(keep_scale, 0.0)?;
        Ok((output, mask))
    }

    fn backward(
        &self,
        grad_output: &Tensor,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: &Tensor,
        params: &AttentionParams,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        if self.fail_backward {
            return Err(AttentionError::KernelExecution(
                "simulated storage-mode incompatibility".to_string(),
            ));
        }

        // Undo the output dropout first: d(out)/d(pre-dropout) is the mask
        // with inverted-dropout scaling.
        let keep_scale = 1.0 / (1.0 - f64::from(params.dropout_p));
        let seeded = grad_output
            .mul(&mask.to_dtype(grad_output.dtype())?)?
            .affine(keep_scale, 0.0)?;

        let g3 = Self::merged(&seeded)?;
        let q3 = Self::merged(q)?;
        let k3 = Self::merged(k)?;
        let v3 = Self::merged(v)?;
        let probs = Self::probs(q, k, params)?;

        // Closed-form softmax-attention backward.
        let grad_v = probs.transpose(1, 2)?.matmul(&g3)?;
        let grad_p = g3.matmul(&v3.transpose(1, 2)?)?;
        let inner = grad_p.mul(&probs)?.sum_keepdim(D::Minus1)?;
        let grad_s = probs.mul(&grad_p.broadcast_sub(&inner)?)?;
        let grad_q = grad_s.matmul(&k3)?.affine(params.scale, 0.0)?;
        let grad_k = grad_s.transpose(1, 2)?.matmul(&q3)?.affine(params.scale, 0.0)?;

        Ok((
            grad_q.reshape(q.dims())?,
            grad_k.reshape(k.dims())?,
            grad_v.reshape(v.dims())?,
        ))
    }

    fn supports_backward(&self) -> bool {
        self.backward_supported
    }
}

/// Deterministic test tensor with values `(i % modulus) * step`.
pub fn patterned(shape: &[usize], step: f32, modulus: f32, device: &Device) -> Tensor {
    let count: usize = shape.iter().product();
    let data: Vec<f32> = (0..count).map(|i| (i as f32 % modulus) * step).collect();
    Tensor::from_vec(data, shape, device).expect("tensor construction")
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> candle_core::Result<f32> {
    a.sub(b)?.abs()?.max_all()?.to_vec0::<f32>()
}

//! Call parameters and dispatcher configuration.
//!
//! [`AttentionParams`] captures the per-call knobs the kernels consume;
//! [`DispatchConfig`] captures process-level behaviour that callers can tune
//! through the environment without swapping implementations.

use crate::core::errors::{AttentionError, Result};

/// Immutable per-call attention parameters, captured in the gradient context.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttentionParams {
    /// Multiplier applied to raw attention scores, typically
    /// `1 / sqrt(head_dim)`.
    pub scale: f64,
    /// Probability of zeroing an output element during training.
    pub dropout_p: f32,
    /// Restrict attention to non-future positions.
    pub causal: bool,
}

impl AttentionParams {
    pub fn new(scale: f64, dropout_p: f32, causal: bool) -> Self {
        Self {
            scale,
            dropout_p,
            causal,
        }
    }

    /// Check the numeric ranges the kernels assume.
    pub fn validate(&self) -> Result<()> {
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(AttentionError::Validation(format!(
                "scale must be a positive finite value, got {}",
                self.scale
            )));
        }
        if !(0.0..1.0).contains(&self.dropout_p) {
            return Err(AttentionError::Validation(format!(
                "dropout_p must be in [0, 1), got {}",
                self.dropout_p
            )));
        }
        Ok(())
    }
}

/// Configuration driving dispatcher behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchConfig {
    /// Emit detailed diagnostics when the backward dispatcher changes path.
    pub debug: bool,
    /// Treat a missing native backward kernel as fatal instead of silently
    /// recomputing gradients through the reference path.
    pub strict: bool,
}

impl DispatchConfig {
    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply `FLASH_ATTN_DEBUG` and `FLASH_ATTN_STRICT` from the process
    /// environment.
    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = env_flag("FLASH_ATTN_DEBUG") {
            self.debug = value;
        }
        if let Some(value) = env_flag("FLASH_ATTN_STRICT") {
            self.strict = value;
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|value| !matches!(value.trim(), "" | "0" | "false" | "off"))
}

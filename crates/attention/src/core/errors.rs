//! Error types emitted by the dispatch layer.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AttentionError>;

/// Failure categories surfaced by the dispatchers.
///
/// Configuration and validation errors are fatal and are never swallowed.
/// Kernel execution errors are recoverable in backward, where they trigger
/// the reference fallback; forward surfaces them unchanged.
#[derive(Error, Debug)]
pub enum AttentionError {
    /// The accelerator runtime is absent or no usable kernel is registered.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The supplied tensors or parameters violate the documented contract.
    #[error("validation error: {0}")]
    Validation(String),

    /// The native kernel failed while executing.
    #[error("kernel execution error: {0}")]
    KernelExecution(String),

    /// The caller misused the per-call gradient context.
    #[error("contract violation: {0}")]
    ContractViolation(&'static str),

    /// A tensor-engine failure propagated to the caller.
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl AttentionError {
    /// Reclassify an arbitrary kernel failure as an execution error,
    /// preserving an existing classification.
    pub(crate) fn into_execution(self) -> Self {
        match self {
            err @ AttentionError::KernelExecution(_) => err,
            other => AttentionError::KernelExecution(other.to_string()),
        }
    }
}

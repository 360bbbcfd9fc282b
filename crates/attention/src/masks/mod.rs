//! Mask utilities for the reference attention path.
//!
//! Masks produced here are additive tensors shaped `[q_len, k_len]`. Entries
//! are `0.0` where attention is permitted and the dtype's most negative
//! finite value otherwise, so masked scores vanish under softmax.

pub mod causal;

pub use causal::{build_causal_mask, mask_fill_value};

//! Portable, exact scaled-dot-product attention.
//!
//! This path favours clarity over performance and serves as the baseline the
//! native kernel is validated against, and as the gradient fallback when the
//! kernel fails.

pub mod exact;

pub use exact::reference_attention;

//! Process-wide native kernel registration.
//!
//! Registration can happen at any point after process start (the accelerator
//! library is usually loaded lazily), so availability is re-checked on every
//! dispatch instead of being captured once.

use std::sync::{Arc, RwLock};

use super::NativeAttentionKernel;

static KERNEL: RwLock<Option<Arc<dyn NativeAttentionKernel>>> = RwLock::new(None);

/// Install the native kernel, replacing any previous registration.
pub fn install(kernel: Arc<dyn NativeAttentionKernel>) {
    let mut slot = KERNEL.write().unwrap_or_else(|err| err.into_inner());
    *slot = Some(kernel);
}

/// Remove the current registration.
pub fn uninstall() {
    let mut slot = KERNEL.write().unwrap_or_else(|err| err.into_inner());
    *slot = None;
}

/// The currently registered kernel, if any.
pub fn installed() -> Option<Arc<dyn NativeAttentionKernel>> {
    KERNEL.read().unwrap_or_else(|err| err.into_inner()).clone()
}

/// True iff both the forward and the backward-with-dropout operations are
/// registered in this process.
pub fn is_available() -> bool {
    installed()
        .map(|kernel| kernel.supports_backward())
        .unwrap_or(false)
}

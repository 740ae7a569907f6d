//! Audio unlock gate.
//!
//! Platform autoplay permission: opened once by a user-gesture handler
//! outside the engine and never closed again. Playback consults it before
//! every operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct UnlockGate {
    open: Arc<AtomicBool>,
}

impl UnlockGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the gate. Returns true the first time only.
    pub fn unlock(&self) -> bool {
        let first = !self.open.swap(true, Ordering::SeqCst);
        if first {
            info!("Audio unlocked by user gesture");
        }
        first
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

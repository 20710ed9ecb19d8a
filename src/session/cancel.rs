//! One-shot, non-resettable stop signal for a session

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Fired at most once; cloning shares the same underlying signal.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    token: CancellationToken,
    fired: Arc<AtomicBool>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal.
    ///
    /// Returns `true` only for the call that actually fired it.
    pub fn cancel(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal has fired, immediately if it already has.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

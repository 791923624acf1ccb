//! Cooperative cancellation flag checked at wait points.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mppsnap_error::{MppError, Result};

/// Shared cancellation flag.
///
/// Clones observe the same flag. The only blocking wait in this workspace,
/// the reader side of the gang handshake, calls [`CancelToken::checkpoint`]
/// on every wake-up.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    requested: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.requested.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Return `Err(QueryCanceled)` once cancellation has been requested.
    ///
    /// # Errors
    ///
    /// Returns [`MppError::QueryCanceled`] when the flag is set.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancel_requested() {
            return Err(MppError::QueryCanceled);
        }
        Ok(())
    }
}

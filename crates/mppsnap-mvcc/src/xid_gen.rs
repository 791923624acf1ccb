//! Local transaction id assignment.

use std::sync::atomic::{AtomicU64, Ordering};

use mppsnap_error::{MppError, Result};
use mppsnap_types::TransactionId;

/// Hands out normal transaction ids in increasing order.
#[derive(Debug)]
pub struct XidAllocator {
    next: AtomicU64,
}

impl Default for XidAllocator {
    fn default() -> Self {
        Self::starting_at(TransactionId::FIRST_NORMAL)
    }
}

impl XidAllocator {
    /// Allocator whose first id is `next` (raised to the first normal id).
    #[must_use]
    pub fn starting_at(next: TransactionId) -> Self {
        let first = next.max(TransactionId::FIRST_NORMAL);
        Self {
            next: AtomicU64::new(first.get()),
        }
    }

    /// The id the next call to [`Self::assign`] would return.
    #[must_use]
    pub fn peek_next(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }

    /// Assign a fresh id.
    ///
    /// # Errors
    ///
    /// Returns [`MppError::XidExhausted`] once the id space is used up.
    pub fn assign(&self) -> Result<TransactionId> {
        let raw = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                (raw <= TransactionId::MAX_RAW).then_some(raw + 1)
            })
            .map_err(|last| {
                tracing::error!(last, "transaction id space exhausted");
                MppError::XidExhausted { last }
            })?;
        TransactionId::new(raw).ok_or_else(|| MppError::internal("allocator produced invalid xid"))
    }
}

//! Global bound on simultaneous transfers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};

/// Default number of simultaneous transfers.
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 3;

/// Semaphore shared by every bundle so the capacity is a global limit.
///
/// Waiters are queued in FIFO order by the underlying semaphore.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    active: Arc<AtomicUsize>,
}

/// A granted slot. Dropping it releases the slot on every exit path.
#[derive(Debug)]
pub struct TransferPermit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for TransferPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT_TRANSFERS)
    }
}

impl ConcurrencyLimiter {
    /// Creates a limiter with `capacity` slots. A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Waits for a free slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] once the limiter has been closed.
    pub async fn acquire(&self) -> Result<TransferPermit> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::Closed)?;
        self.active.fetch_add(1, Ordering::AcqRel);
        Ok(TransferPermit {
            _permit: permit,
            active: Arc::clone(&self.active),
        })
    }

    /// Total number of slots.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Permits currently held.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Rejects all current and future waiters. Held permits stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Returns true once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

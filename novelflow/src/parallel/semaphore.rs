//! Counting semaphore with a FIFO wait queue.

use crate::errors::NovelflowError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

/// Bounds how many stages run at once.
///
/// Waiters are served in arrival order. Closing the semaphore wakes every
/// waiter with an error, which the executor uses to abort pending work.
#[derive(Debug, Clone)]
pub struct Semaphore {
    inner: Arc<tokio::sync::Semaphore>,
    capacity: usize,
    waiting: Arc<AtomicUsize>,
}

/// A held permit. Dropping it releases the slot.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

impl Permit {
    /// Releases the permit.
    pub fn release(self) {}
}

struct WaitGuard<'a>(&'a AtomicUsize);

impl<'a> WaitGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Semaphore {
    /// Creates a semaphore with `permits` slots (at least one).
    pub fn new(permits: usize) -> Self {
        let capacity = permits.max(1);
        Self {
            inner: Arc::new(tokio::sync::Semaphore::new(capacity)),
            capacity,
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Waits for a free slot.
    pub async fn acquire(&self) -> Result<Permit, NovelflowError> {
        let _waiting = WaitGuard::enter(&self.waiting);
        let permit = Arc::clone(&self.inner)
            .acquire_owned()
            .await
            .map_err(|_| NovelflowError::Internal("semaphore closed".to_string()))?;
        Ok(Permit { _permit: permit })
    }

    /// Takes a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<Permit> {
        Arc::clone(&self.inner)
            .try_acquire_owned()
            .ok()
            .map(|permit| Permit { _permit: permit })
    }

    /// Free slots.
    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }

    /// Tasks currently blocked in [`Self::acquire`].
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Total slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fails every pending and future `acquire`.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Whether [`Self::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

//! Counting semaphore with FIFO waiter wakeup.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore as TokioSemaphore};

/// Counting concurrency limiter.
///
/// Waiters are served strictly in arrival order. Unlike an RAII-only
/// semaphore, permits can be taken with [`acquire`](Self::acquire) and handed
/// back from anywhere with [`release`](Self::release); releasing more than
/// was acquired simply grows the available count.
#[derive(Debug, Clone)]
pub struct Semaphore {
    inner: Arc<TokioSemaphore>,
}

/// A permit returned to its [`Semaphore`] on drop.
#[derive(Debug)]
pub struct Permit {
    _inner: OwnedSemaphorePermit,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            inner: Arc::new(TokioSemaphore::new(permits)),
        }
    }

    /// Wait for a permit and take it.
    pub async fn acquire(&self) {
        // The inner semaphore is never closed, so acquisition cannot fail.
        if let Ok(permit) = self.inner.acquire().await {
            permit.forget();
        }
    }

    /// Give a permit back, waking the longest waiter if there is one.
    pub fn release(&self) {
        self.inner.add_permits(1);
    }

    /// Wait for a permit that is released when the returned guard drops.
    pub async fn acquire_permit(&self) -> Permit {
        match Arc::clone(&self.inner).acquire_owned().await {
            Ok(permit) => Permit { _inner: permit },
            Err(_) => std::future::pending().await,
        }
    }

    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }
}

//! FIFO-fair counting semaphore that serialises reader transactions

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;
use tokio::sync::oneshot;

use crate::types::RfidError;

#[derive(Debug)]
struct State {
    counter: usize,
    capacity: usize,
    // Bumped by purge so permits issued earlier release as no-ops
    epoch: u64,
    waiting: VecDeque<oneshot::Sender<u64>>,
}

/// Bounded semaphore granting waiters strictly in arrival order
///
/// With the default capacity of 1 at most one holder runs at a time, which
/// is what pairs each command written to the reader with the response read
/// back for it.
#[derive(Debug)]
pub struct TransactionSemaphore {
    state: Mutex<State>,
}

/// A held slot, released when dropped
#[derive(Debug)]
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct SemaphorePermit<'a> {
    semaphore: &'a TransactionSemaphore,
    epoch: u64,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release_slot(self.epoch);
    }
}

// Waiter queued in `acquire`; hands a slot that was granted after the
// acquiring future was dropped back to the semaphore.
struct PendingGrant<'a> {
    semaphore: &'a TransactionSemaphore,
    rx: oneshot::Receiver<u64>,
    settled: bool,
}

impl Drop for PendingGrant<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.rx.close();
        if let Ok(epoch) = self.rx.try_recv() {
            self.semaphore.release_slot(epoch);
        }
    }
}

impl Default for TransactionSemaphore {
    fn default() -> Self {
        Self::new(1)
    }
}

impl TransactionSemaphore {
    /// Create a semaphore with `capacity` slots; zero is treated as one
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                counter: 0,
                capacity: capacity.max(1),
                epoch: 0,
                waiting: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a slot, queueing behind earlier waiters when none is free
    ///
    /// Fails with [`RfidError::Cancelled`] if the queue is purged while
    /// waiting.
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>, RfidError> {
        let rx = {
            let mut state = self.lock();
            if state.counter < state.capacity {
                state.counter += 1;
                return Ok(SemaphorePermit {
                    semaphore: self,
                    epoch: state.epoch,
                });
            }
            let (tx, rx) = oneshot::channel();
            state.waiting.push_back(tx);
            rx
        };

        let mut pending = PendingGrant {
            semaphore: self,
            rx,
            settled: false,
        };
        let granted = (&mut pending.rx).await;
        pending.settled = true;

        match granted {
            Ok(epoch) => Ok(SemaphorePermit {
                semaphore: self,
                epoch,
            }),
            Err(_) => Err(RfidError::Cancelled),
        }
    }

    /// Give up a slot explicitly; same as dropping the permit
    pub fn release(&self, permit: SemaphorePermit<'_>) {
        drop(permit);
    }

    fn release_slot(&self, epoch: u64) {
        let mut state = self.lock();
        if epoch != state.epoch {
            return;
        }
        // Hand the slot straight to the oldest waiter still listening
        while let Some(waiter) = state.waiting.pop_front() {
            if waiter.send(epoch).is_ok() {
                return;
            }
        }
        state.counter = state.counter.saturating_sub(1);
    }

    /// Fail every queued waiter with [`RfidError::Cancelled`] and reset the
    /// counter to zero
    ///
    /// Returns the number of waiters purged. Permits held at the time of the
    /// purge no longer count against the capacity.
    pub fn purge(&self) -> usize {
        let mut state = self.lock();
        let purged = state.waiting.len();
        state.waiting.clear();
        state.counter = 0;
        state.epoch = state.epoch.wrapping_add(1);
        if purged > 0 {
            debug!("Purged {} waiting transactions", purged);
        }
        purged
    }

    /// Run `action` while holding a slot
    ///
    /// The slot is released on every exit path, including when the returned
    /// future is dropped before completion.
    pub async fn with<F, Fut, T>(&self, action: F) -> Result<T, RfidError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RfidError>>,
    {
        let _permit = self.acquire().await?;
        action().await
    }

    /// Number of slots currently held
    pub fn held(&self) -> usize {
        self.lock().counter
    }

    /// Number of callers waiting for a slot
    pub fn queued(&self) -> usize {
        self.lock().waiting.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::task::yield_now;

    async fn wait_for_queue(semaphore: &TransactionSemaphore, len: usize) {
        while semaphore.queued() < len {
            yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_acquire_immediate_when_free() {
        let semaphore = TransactionSemaphore::default();
        let permit = semaphore.acquire().await.unwrap();
        assert_eq!(semaphore.held(), 1);
        semaphore.release(permit);
        assert_eq!(semaphore.held(), 0);
    }

    #[tokio::test]
    async fn test_capacity_bound() {
        let semaphore = TransactionSemaphore::new(2);
        let _a = semaphore.acquire().await.unwrap();
        let _b = semaphore.acquire().await.unwrap();
        assert_eq!(semaphore.held(), 2);

        let third = tokio::time::timeout(std::time::Duration::from_millis(20), semaphore.acquire()).await;
        assert!(third.is_err());
        // The abandoned waiter does not leak a slot
        assert_eq!(semaphore.held(), 2);
    }

    #[tokio::test]
    async fn test_waiters_granted_in_arrival_order() {
        let semaphore = Arc::new(TransactionSemaphore::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = semaphore.acquire().await.unwrap();

        let mut tasks = Vec::new();
        for id in 0..3 {
            let task_semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = task_semaphore.acquire().await.unwrap();
                tx.send(id).unwrap();
                yield_now().await;
            }));
            wait_for_queue(&semaphore, id + 1).await;
        }

        drop(first);
        for task in tasks {
            task.await.unwrap();
        }
        drop(tx);

        let mut order = Vec::new();
        while let Some(id) = rx.recv().await {
            order.push(id);
        }
        assert_eq!(order, [0, 1, 2]);
        assert_eq!(semaphore.held(), 0);
    }

    #[tokio::test]
    async fn test_purge_cancels_waiters() {
        let semaphore = Arc::new(TransactionSemaphore::default());
        let holder = semaphore.acquire().await.unwrap();

        let waiter = {
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move { semaphore.acquire().await.map(|_| ()) })
        };
        wait_for_queue(&semaphore, 1).await;

        assert_eq!(semaphore.purge(), 1);
        assert_eq!(semaphore.held(), 0);
        assert_eq!(semaphore.queued(), 0);
        assert!(matches!(waiter.await.unwrap(), Err(RfidError::Cancelled)));

        // The pre-purge holder releasing must not underflow the counter
        let fresh = semaphore.acquire().await.unwrap();
        drop(holder);
        assert_eq!(semaphore.held(), 1);
        drop(fresh);
        assert_eq!(semaphore.held(), 0);
    }

    #[tokio::test]
    async fn test_with_releases_on_error() {
        let semaphore = TransactionSemaphore::default();
        let result: Result<(), RfidError> = semaphore
            .with(|| async { Err(RfidError::NoTag) })
            .await;
        assert!(matches!(result, Err(RfidError::NoTag)));
        assert_eq!(semaphore.held(), 0);

        let value = semaphore.with(|| async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(semaphore.held(), 0);
    }
}

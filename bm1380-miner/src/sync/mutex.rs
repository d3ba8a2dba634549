//! Single-holder async mutex with first-come, first-served hand-off.

use std::sync::Arc;

use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};

/// Exclusive access to the value in a [`Mutex`].
///
/// Dropping the guard releases the lock and wakes the next waiter.
pub type MutexGuard<T> = OwnedMutexGuard<T>;

/// An async mutual-exclusion lock.
///
/// `lock()` waits without blocking a thread and is granted in the order
/// callers started waiting. The lock is released when the guard drops, so a
/// release without a matching lock cannot be written. The lock is not
/// reentrant: locking again while holding a guard waits forever.
///
/// Guards own their access and carry no lifetime, so a task can hold one
/// across its whole run.
pub struct Mutex<T> {
    inner: Arc<TokioMutex<T>>,
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(TokioMutex::new(value)),
        }
    }

    /// Wait for the lock.
    ///
    /// Cancel-safe: dropping the future before it completes gives up the
    /// place in line without taking the lock.
    pub async fn lock(&self) -> MutexGuard<T> {
        Arc::clone(&self.inner).lock_owned().await
    }
}

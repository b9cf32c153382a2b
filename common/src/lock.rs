use std::{
    sync::{Mutex, MutexGuard, TryLockError},
    thread,
    time::{Duration, Instant},
};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Mutex that is only ever taken with a bounded wait.
///
/// Callers that miss the deadline skip their update instead of queueing; the
/// periodic reconciler re-applies every fail-safe rule on its next pass.
/// A poisoned lock is recovered so one panicking context cannot disable
/// forced closure in the others.
#[derive(Debug, Default)]
pub struct StateLock<T> {
    inner: Mutex<T>,
}

impl<T> StateLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, T>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.inner.try_lock() {
                Ok(guard) => return Some(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    thread::sleep(LOCK_POLL_INTERVAL.min(deadline - now));
                }
            }
        }
    }
}

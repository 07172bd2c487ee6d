//! Busy-wait mutex used to guard the runtime's short critical sections.
//!
//! Every shared structure in the runtime (loop queues, signal tables,
//! connection sets, scheduler state) is only ever locked for a handful of
//! instructions, so a spinning lock with exponential backoff beats parking
//! the thread.

use crossbeam::utils::Backoff;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// A spinning mutual-exclusion lock.
///
/// Contended lockers back off with [`crossbeam::utils::Backoff`] rather than
/// yielding to the OS. Not reentrant: locking twice on one thread deadlocks.
pub struct SpinMutex<T: ?Sized> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: the lock flag serializes all access to `value`.
unsafe impl<T: ?Sized + Send> Send for SpinMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinMutex<T> {}

/// RAII guard returned by [`SpinMutex::lock`].
pub struct SpinGuard<'a, T: ?Sized> {
    lock: &'a SpinMutex<T>,
}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        SpinMutex {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> SpinMutex<T> {
    /// Spins until the lock is acquired.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        let backoff = Backoff::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        SpinGuard { lock: self }
    }

    /// Acquires the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }
}

impl<T: ?Sized> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock exclusively.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T: ?Sized> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

impl<T: Default> Default for SpinMutex<T> {
    fn default() -> Self {
        SpinMutex::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_exclusive_increments() {
        let shared = Arc::new(SpinMutex::new(0u64));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let shared = shared.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    *shared.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*shared.lock(), 40_000);
    }

    #[test]
    fn test_try_lock() {
        let m = SpinMutex::new(5);
        let guard = m.lock();
        assert!(m.try_lock().is_none());
        drop(guard);
        assert_eq!(*m.try_lock().unwrap(), 5);
    }
}

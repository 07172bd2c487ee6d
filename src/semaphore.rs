//! Counted semaphore with a timed wait.
//!
//! The event loop blocks on one of these with exactly one token per queued
//! work item; the timer service uses the timed variant as its wakeup clock.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A counting semaphore built on `Mutex` + `Condvar`.
pub struct Semaphore {
    value: Mutex<i64>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new(value: i64) -> Self {
        Semaphore {
            value: Mutex::new(value),
            cv: Condvar::new(),
        }
    }

    /// Blocks until a token is available, then takes it.
    pub fn wait(&self) {
        let mut v = self.value.lock().unwrap();
        while *v <= 0 {
            v = self.cv.wait(v).unwrap();
        }
        *v -= 1;
    }

    /// Blocks up to `sec` seconds for a token.
    ///
    /// Returns `true` if a token was taken, `false` on timeout.
    pub fn wait_for(&self, sec: f64) -> bool {
        let deadline = Instant::now() + Duration::from_secs_f64(sec.max(0.0));
        let mut v = self.value.lock().unwrap();
        loop {
            if *v > 0 {
                *v -= 1;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cv.wait_timeout(v, deadline - now).unwrap();
            v = guard;
        }
    }

    /// Takes a token if one is available right now.
    pub fn try_wait(&self) -> bool {
        let mut v = self.value.lock().unwrap();
        if *v > 0 {
            *v -= 1;
            true
        } else {
            false
        }
    }

    /// Releases one token and wakes one waiter.
    pub fn post(&self) {
        let mut v = self.value.lock().unwrap();
        *v += 1;
        self.cv.notify_one();
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Semaphore::new(0)
    }
}

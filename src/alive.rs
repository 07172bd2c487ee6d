//! Liveness witnesses.
//!
//! Cross-thread callbacks in the runtime never hold strong references to the
//! objects they target. Instead they share a small `{mutex, alive}` cell with
//! the target and check it immediately before doing work. The cell's lock
//! gives a precise answer: once a destructor has flipped `alive` under the
//! lock, no observer that locks afterwards can see the object as live.

use crate::spin::SpinMutex;
use std::sync::Arc;

/// A shared liveness cell: a spin-locked boolean co-owned by an object and
/// every callback that must know whether the object still exists.
pub struct AliveCell {
    state: SpinMutex<bool>,
}

/// Shared handle to an [`AliveCell`].
pub type SharedAlive = Arc<AliveCell>;

impl AliveCell {
    pub fn new() -> SharedAlive {
        Arc::new(AliveCell {
            state: SpinMutex::new(true),
        })
    }

    /// Reads the flag under the cell lock.
    pub fn is_alive(&self) -> bool {
        *self.state.lock()
    }

    /// Flips the flag to dead under the cell lock. Idempotent.
    pub fn kill(&self) {
        *self.state.lock() = false;
    }

    /// Runs `f` while holding the cell lock, iff the target is still alive.
    ///
    /// Returns `Some` with `f`'s result when it ran. `f` must stay short:
    /// the lock is a spin lock, and the only thing allowed under it besides
    /// capturing state is posting work to a loop.
    pub fn if_alive<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let guard = self.state.lock();
        if *guard {
            Some(f())
        } else {
            None
        }
    }
}

/// Loop-teardown witness: runs its registered callback when the last shared
/// handle is dropped.
///
/// Anything that must learn about a loop's shutdown (cross-loop posted
/// closures, objects affine to the loop) holds one of these; the loop thread
/// itself stays alive until every handle is gone.
pub struct LoopAlive {
    on_drop: SpinMutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl LoopAlive {
    pub fn new(on_drop: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Arc::new(LoopAlive {
            on_drop: SpinMutex::new(Some(Box::new(on_drop))),
        })
    }
}

impl Drop for LoopAlive {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.lock().take() {
            f();
        }
    }
}

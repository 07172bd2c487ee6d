//! Per-thread event loop with two priority classes.
//!
//! An [`EventLoop`] owns one OS thread and serializes nullary closures onto
//! it. Priority 0 ([`HIGH_PRIORITY`]) items go through a dedicated ring that
//! always drains before the ordered map holding every other priority; within
//! a single priority, order is FIFO. One semaphore token is posted per item,
//! and the thread drains items until the token count runs dry.
//!
//! `process`, `wait_event` and `wait_process` are reserved for code already
//! running on the loop's thread (the coroutine scheduler drives them) and
//! panic when invoked from anywhere else. Panics inside a work closure are
//! not caught: they unwind the loop thread, by contract.

use crate::alive::LoopAlive;
use crate::ring::RingQueue;
use crate::semaphore::Semaphore;
use crate::signal::{ConnectId, SharedConnection};
use crate::spin::SpinMutex;
use lazy_static::lazy_static;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Work priority: lower value runs first.
pub type Priority = u32;

/// The fast-path priority. Items at this priority bypass the ordered map.
pub const HIGH_PRIORITY: Priority = 0;

pub(crate) type WorkFun = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static CURRENT_LOOP: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
}

lazy_static! {
    static ref DEFAULT_LOOP: EventLoop = EventLoop::new("swiftlet:default");
}

struct Queues {
    high: RingQueue<WorkFun>,
    events: BTreeMap<(Priority, u64), WorkFun>,
    seq: u64,
    connects: BTreeMap<ConnectId, SharedConnection>,
}

struct LoopShared {
    name: String,
    queues: SpinMutex<Queues>,
    run_sem: Semaphore,
    run_sta_sem: Semaphore,
    delete_sem: Arc<Semaphore>,
    shared_alive: SpinMutex<Option<Arc<LoopAlive>>>,
    terminate: AtomicBool,
}

/// Cheap-clone handle to an event loop.
///
/// Handles never keep the thread alive by themselves; shutdown goes through
/// [`EventLoop::delete_later`], after which the thread exits once the last
/// loop-alive witness is released.
pub struct EventLoop {
    shared: Arc<LoopShared>,
}

impl Clone for EventLoop {
    fn clone(&self) -> Self {
        EventLoop {
            shared: self.shared.clone(),
        }
    }
}

impl EventLoop {
    /// Spawns a new loop thread.
    pub fn new(name: &str) -> EventLoop {
        let delete_sem = Arc::new(Semaphore::new(0));
        let sem = delete_sem.clone();
        let shared = Arc::new(LoopShared {
            name: name.to_string(),
            queues: SpinMutex::new(Queues {
                high: RingQueue::new(),
                events: BTreeMap::new(),
                seq: 0,
                connects: BTreeMap::new(),
            }),
            run_sem: Semaphore::new(0),
            run_sta_sem: Semaphore::new(0),
            delete_sem,
            shared_alive: SpinMutex::new(None),
            terminate: AtomicBool::new(false),
        });
        *shared.shared_alive.lock() = Some(LoopAlive::new(move || {
            sem.post();
        }));

        let lp = EventLoop { shared };
        let thread_lp = lp.clone();
        let thread_name = name.to_string();
        let spawned = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                CURRENT_LOOP.with(|c| *c.borrow_mut() = Some(thread_lp.clone()));
                log::debug!("event loop {} started", thread_name);
                thread_lp.run();
                log::debug!("event loop {} exited", thread_name);
                CURRENT_LOOP.with(|c| *c.borrow_mut() = None);
            });
        if let Err(e) = spawned {
            // Out of threads this early is unrecoverable for the runtime.
            panic!("failed to spawn event loop thread {}: {}", name, e);
        }
        lp
    }

    /// The process-wide default loop, spawned on first use.
    pub fn instance() -> EventLoop {
        DEFAULT_LOOP.clone()
    }

    /// The loop owning the calling thread, or the default instance when the
    /// caller is not a loop thread.
    pub fn current() -> EventLoop {
        let found = CURRENT_LOOP.with(|c| c.borrow().clone());
        found.unwrap_or_else(EventLoop::instance)
    }

    /// Whether the calling thread is this loop's thread.
    pub fn is_current(&self) -> bool {
        CURRENT_LOOP.with(|c| {
            c.borrow()
                .as_ref()
                .map(|lp| Arc::ptr_eq(&lp.shared, &self.shared))
                .unwrap_or(false)
        })
    }

    /// Whether two handles refer to the same loop.
    pub fn same(&self, other: &EventLoop) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn name(&self) -> String {
        self.shared.name.clone()
    }

    /// Enqueues `f` at the fast-path priority and wakes the loop. Never
    /// blocks the caller.
    pub fn work(&self, f: impl FnOnce() + Send + 'static) {
        self.work_pri(f, HIGH_PRIORITY);
    }

    /// Enqueues `f` at an explicit priority and wakes the loop.
    pub fn work_pri(&self, f: impl FnOnce() + Send + 'static, pri: Priority) {
        let mut q = self.shared.queues.lock();
        self.enqueue(&mut q, Box::new(f), pri);
    }

    /// Enqueues `f` and blocks until it has run.
    ///
    /// Called from the loop's own thread, this drains pending work and then
    /// invokes `f` inline instead of deadlocking.
    pub fn work_sync(&self, f: impl FnOnce() + Send + 'static) {
        self.work_sync_pri(f, HIGH_PRIORITY);
    }

    /// Priority-ordered [`EventLoop::work_sync`]: returns only after every
    /// previously enqueued item at `pri` has run, then `f` itself.
    pub fn work_sync_pri(&self, f: impl FnOnce() + Send + 'static, pri: Priority) {
        if self.is_current() {
            self.process();
            f();
            return;
        }

        let sem = Arc::new(Semaphore::new(0));
        {
            let sem = sem.clone();
            let mut q = self.shared.queues.lock();
            self.enqueue(&mut q, Box::new(f), pri);
            self.enqueue(&mut q, Box::new(move || sem.post()), pri);
        }
        sem.wait();
    }

    /// Pauses (`false`) or resumes (`true`) event processing.
    ///
    /// Pausing posts a work item that parks the loop thread on a run-state
    /// semaphore; everything enqueued after it waits until the loop is
    /// resumed.
    pub fn set_run(&self, run: bool) {
        if run {
            self.shared.run_sta_sem.post();
        } else {
            let shared = self.shared.clone();
            self.work(move || shared.run_sta_sem.wait());
        }
    }

    /// Number of items waiting in the priority map (the fast-path ring is
    /// not counted).
    pub fn queue_size(&self) -> usize {
        self.shared.queues.lock().events.len()
    }

    /// Blocks the calling thread until at least one work item arrives.
    ///
    /// # Panics
    ///
    /// Panics when called from a thread other than the loop's own.
    pub fn wait_event(&self) {
        if !self.is_current() {
            panic!("EventLoop::wait_event called from a foreign thread");
        }
        self.shared.run_sem.wait();
    }

    /// Drains pending work without blocking; returns immediately when the
    /// queue is empty.
    ///
    /// # Panics
    ///
    /// Panics when called from a thread other than the loop's own.
    pub fn process(&self) {
        if !self.is_current() {
            panic!("EventLoop::process called from a foreign thread");
        }
        if !self.shared.run_sem.try_wait() {
            return;
        }
        self.process_data();
    }

    /// Blocks until work arrives, then drains it.
    ///
    /// # Panics
    ///
    /// Panics when called from a thread other than the loop's own.
    pub fn wait_process(&self) {
        if !self.is_current() {
            panic!("EventLoop::wait_process called from a foreign thread");
        }
        self.shared.run_sem.wait();
        self.process_data();
    }

    /// Registers a connection whose receiver side is this loop, so shutdown
    /// can cascade its teardown.
    pub fn add_connection(&self, conn: SharedConnection) {
        self.shared.queues.lock().connects.insert(conn.id(), conn);
    }

    pub fn remove_connection(&self, id: ConnectId) {
        self.shared.queues.lock().connects.remove(&id);
    }

    /// This loop's teardown witness; `None` once shutdown has begun.
    pub fn shared_alive(&self) -> Option<Arc<LoopAlive>> {
        self.shared.shared_alive.lock().clone()
    }

    /// Initiates graceful shutdown.
    ///
    /// Tears down every registered connection, releases the loop-alive
    /// witness, unpauses the loop and posts a final wakeup. The thread exits
    /// once the last outstanding loop-alive handle is dropped.
    pub fn delete_later(&self) {
        let drained: Vec<SharedConnection> = {
            let mut q = self.shared.queues.lock();
            std::mem::take(&mut q.connects).into_values().collect()
        };
        for conn in drained {
            conn.disconnect();
        }

        *self.shared.shared_alive.lock() = None;

        self.shared.terminate.store(true, Ordering::SeqCst);
        self.set_run(true);
        self.work(|| {});
    }

    fn enqueue(&self, q: &mut Queues, f: WorkFun, pri: Priority) {
        if pri == HIGH_PRIORITY {
            q.high.push(f);
        } else {
            let seq = q.seq;
            q.seq += 1;
            q.events.insert((pri, seq), f);
        }
        self.shared.run_sem.post();
    }

    fn run(&self) {
        while !self.shared.terminate.load(Ordering::SeqCst) {
            self.shared.run_sem.wait();
            self.process_data();
        }
        self.shared.delete_sem.wait();
    }

    fn process_data(&self) {
        loop {
            let item = {
                let mut q = self.shared.queues.lock();
                if let Some(w) = q.high.pop() {
                    Some(w)
                } else {
                    q.events.pop_first().map(|(_, w)| w)
                }
            };
            match item {
                Some(w) => w(),
                None => break,
            }
            if !self.shared.run_sem.try_wait() {
                break;
            }
        }
    }
}

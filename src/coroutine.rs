//! Stackful coroutines scheduled cooperatively on one event loop.
//!
//! A [`Coroutine`] owns a dedicated [`EventLoop`]; its [`Context`]s are
//! fibers multiplexed onto that loop's thread. Context switching is
//! delegated to `corosensei` — the scheduler resumes a fiber, and the fiber
//! returns control either by finishing or by suspending through its yielder
//! ([`Coroutine::yield_now`] re-queues first, [`Coroutine::pending`] parks
//! until someone calls [`Coroutine::resume`]).
//!
//! A context never migrates between loops, and at most one context of a
//! coroutine executes at any instant. Every fiber stack carries a sentinel
//! word at its deep end; [`stack_overflow_check`] scans the live set and
//! reports the first clobbered one.

use crate::error::SpawnError;
use crate::event_loop::{EventLoop, Priority};
use crate::object::{Emitter, Object};
use crate::signal::{connect, Signal};
use crate::spin::SpinMutex;
use crate::timer::{set_timeout, Seconds};
use corosensei::stack::{DefaultStack, Stack};
use corosensei::{CoroutineResult, Yielder};
use lazy_static::lazy_static;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;

/// Monotonically increasing context identity.
pub type ContextId = u64;

/// Default fiber stack size.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

const STACK_SENTINEL: u32 = 0x55AA_AA55;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

type Fiber = corosensei::Coroutine<(), (), ()>;

thread_local! {
    static CURRENT_CORO: RefCell<Option<Coroutine>> = const { RefCell::new(None) };
}

lazy_static! {
    static ref DEFAULT_CORO: Coroutine = Coroutine::new("swiftlet:co");
    static ref STACK_WATCH: SpinMutex<HashMap<ContextId, StackWatch>> =
        SpinMutex::new(HashMap::new());
}

struct StackWatch {
    loop_name: String,
    limit: usize,
    stack_size: usize,
}

/// Diagnostic record returned by [`stack_overflow_check`].
#[derive(Debug, Clone)]
pub struct StackReport {
    pub loop_name: String,
    pub stack_size: usize,
}

struct ContextState {
    alive: bool,
    running: bool,
}

/// A stackful fiber pinned to its coroutine's loop.
///
/// Shared as [`SharedContext`]; completion is observable three ways: the
/// blocking path of [`Coroutine::join`], the embedded `signal_complete`,
/// and [`Context::is_alive`].
pub struct Context {
    id: ContextId,
    pri: Priority,
    stack_size: usize,
    object: Object,
    pub signal_complete: Signal<()>,
    state: SpinMutex<ContextState>,
    done: Mutex<bool>,
    done_cv: Condvar,
    yielder: AtomicUsize,
    fiber: SpinMutex<Option<Fiber>>,
}

pub type SharedContext = Arc<Context>;

// SAFETY: the fiber cell and the yielder pointer are only touched by the
// owning coroutine's loop thread (the scheduler while resuming, the fiber
// body while running). Everything else is lock- or atomic-guarded.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.pri
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Whether the context's closure has not yet run to completion.
    pub fn is_alive(&self) -> bool {
        self.state.lock().alive
    }
}

impl Emitter for Context {
    fn object(&self) -> &Object {
        &self.object
    }
}

struct SchedState {
    running: BTreeMap<(Priority, u64), SharedContext>,
    contexts: HashMap<ContextId, SharedContext>,
    current: Option<SharedContext>,
    seq: u64,
}

struct CoroutineShared {
    lp: EventLoop,
    stack_size: AtomicUsize,
    sched: SpinMutex<SchedState>,
    terminate: AtomicBool,
}

/// Cheap-clone handle to a coroutine scheduler and its loop.
pub struct Coroutine {
    shared: Arc<CoroutineShared>,
}

impl Clone for Coroutine {
    fn clone(&self) -> Self {
        Coroutine {
            shared: self.shared.clone(),
        }
    }
}

impl Coroutine {
    /// Spawns a coroutine with a dedicated loop thread.
    pub fn new(name: &str) -> Coroutine {
        let lp = EventLoop::new(name);
        let shared = Arc::new(CoroutineShared {
            lp: lp.clone(),
            stack_size: AtomicUsize::new(DEFAULT_STACK_SIZE),
            sched: SpinMutex::new(SchedState {
                running: BTreeMap::new(),
                contexts: HashMap::new(),
                current: None,
                seq: 0,
            }),
            terminate: AtomicBool::new(false),
        });

        let sched = shared.clone();
        lp.work(move || Coroutine::scheduler(sched));

        Coroutine { shared }
    }

    /// The process-wide default coroutine, spawned on first use.
    pub fn instance() -> Coroutine {
        DEFAULT_CORO.clone()
    }

    /// The coroutine owning the calling thread, if any.
    pub fn current() -> Option<Coroutine> {
        CURRENT_CORO.with(|c| c.borrow().clone())
    }

    /// Whether two handles refer to the same coroutine.
    pub fn same(&self, other: &Coroutine) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn event_loop(&self) -> EventLoop {
        self.shared.lp.clone()
    }

    /// The context currently executing on this coroutine, if any.
    pub fn current_context(&self) -> Option<SharedContext> {
        self.shared.sched.lock().current.clone()
    }

    /// Number of contexts registered and not yet completed.
    pub fn work_set_size(&self) -> usize {
        self.shared.sched.lock().contexts.len()
    }

    pub fn set_stack_size(&self, size: usize) {
        self.shared.stack_size.store(size, Ordering::Relaxed);
    }

    pub fn stack_size(&self) -> usize {
        self.shared.stack_size.load(Ordering::Relaxed)
    }

    /// Pauses (`false`) or resumes (`true`) the underlying loop.
    pub fn set_run(&self, run: bool) {
        self.shared.lp.set_run(run);
    }

    /// Spawns a context running `f` with the default stack and priority.
    pub fn work<F>(&self, f: F) -> Result<SharedContext, SpawnError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.work_with(f, 0, 0)
    }

    /// Spawns a context with an explicit stack size (0 = coroutine default;
    /// the coroutine default is also the floor) and priority.
    pub fn work_with<F>(
        &self,
        f: F,
        stack_size: usize,
        pri: Priority,
    ) -> Result<SharedContext, SpawnError>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = stack_size.max(self.shared.stack_size.load(Ordering::Relaxed));
        let stack = DefaultStack::new(size)?;
        let limit = stack.limit().get();
        // SAFETY: `limit` is the lowest usable word of the freshly mapped
        // stack; nothing has run on it yet.
        unsafe { (limit as *mut u32).write_volatile(STACK_SENTINEL) };

        let lp = self.shared.lp.clone();
        let lp_name = lp.name();
        let ctx: SharedContext = Arc::new_cyclic(|weak: &Weak<Context>| {
            let weak = weak.clone();
            let fiber = Fiber::with_stack(stack, move |yielder, _input: ()| {
                let ctx = match weak.upgrade() {
                    Some(c) => c,
                    None => return,
                };
                ctx.yielder
                    .store(yielder as *const Yielder<(), ()> as usize, Ordering::Release);
                STACK_WATCH.lock().insert(
                    ctx.id,
                    StackWatch {
                        loop_name: lp_name,
                        limit,
                        stack_size: size,
                    },
                );

                f();

                {
                    let mut st = ctx.state.lock();
                    st.alive = false;
                }
                {
                    let mut done = ctx.done.lock().unwrap();
                    *done = true;
                }
                ctx.done_cv.notify_all();

                ctx.signal_complete.dispatch(());

                STACK_WATCH.lock().remove(&ctx.id);
            });

            Context {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                pri,
                stack_size: size,
                object: Object::with_loop(&lp),
                signal_complete: Signal::new(),
                state: SpinMutex::new(ContextState {
                    alive: true,
                    running: true,
                }),
                done: Mutex::new(false),
                done_cv: Condvar::new(),
                yielder: AtomicUsize::new(0),
                fiber: SpinMutex::new(Some(fiber)),
            }
        });

        let shared = self.shared.clone();
        let c2 = ctx.clone();
        self.shared.lp.work(move || {
            let mut s = shared.sched.lock();
            s.contexts.insert(c2.id, c2.clone());
            let seq = s.seq;
            s.seq += 1;
            s.running.insert((c2.pri, seq), c2);
        });

        Ok(ctx)
    }

    /// Makes a parked context runnable again.
    ///
    /// Posted to this coroutine's loop: a context that is unknown, dead, or
    /// already marked running is left alone. When called from within one of
    /// this coroutine's own contexts, additionally yields so the resumed
    /// context gets a chance to run.
    pub fn resume(&self, ctx: &SharedContext) {
        let shared = self.shared.clone();
        let c2 = ctx.clone();
        self.shared.lp.work(move || {
            let mut s = shared.sched.lock();
            if !s.contexts.contains_key(&c2.id) {
                return;
            }
            {
                let mut st = c2.state.lock();
                if !st.alive || st.running {
                    return;
                }
                st.running = true;
            }
            let seq = s.seq;
            s.seq += 1;
            s.running.insert((c2.pri, seq), c2);
        });

        if let Some(cur) = Coroutine::current() {
            if cur.same(self) && cur.current_context().is_some() {
                Coroutine::yield_now();
            }
        }
    }

    /// Waits for `ctx` to run to completion.
    ///
    /// Outside any coroutine this blocks the calling thread on the context's
    /// completion condition. Inside a coroutine it connects a one-shot slot
    /// on the target's completion signal that resumes the caller, then
    /// parks. Joining an already-complete context returns immediately.
    pub fn join(&self, ctx: &SharedContext) {
        let caller = Coroutine::current()
            .and_then(|co| co.current_context().map(|c| (co, c)));

        match caller {
            None => {
                let mut done = ctx.done.lock().unwrap();
                while !*done {
                    done = ctx.done_cv.wait(done).unwrap();
                }
            }
            Some((co, caller_ctx)) => {
                {
                    let st = ctx.state.lock();
                    if !st.alive {
                        return;
                    }
                    let co2 = co.clone();
                    let _ = connect(&**ctx, &ctx.signal_complete, move |()| {
                        co2.resume(&caller_ctx);
                    });
                }
                Coroutine::pending();
            }
        }
    }

    /// Re-queues the current context at its priority and switches back to
    /// the scheduler. Outside a coroutine, degrades to an OS-thread yield.
    pub fn yield_now() {
        let Some(co) = Coroutine::current() else {
            thread::yield_now();
            return;
        };
        let Some(ctx) = co.current_context() else {
            thread::yield_now();
            return;
        };

        let shared = co.shared.clone();
        let c2 = ctx.clone();
        co.shared.lp.work(move || {
            let mut s = shared.sched.lock();
            let seq = s.seq;
            s.seq += 1;
            s.running.insert((c2.pri, seq), c2);
        });

        Self::switch_out(&ctx);
    }

    /// Switches back to the scheduler without re-queueing; the context stays
    /// parked until someone calls [`Coroutine::resume`] on it.
    pub fn pending() {
        let Some(co) = Coroutine::current() else {
            log::warn!("Coroutine::pending called outside a coroutine");
            return;
        };
        let Some(ctx) = co.current_context() else {
            log::warn!("Coroutine::pending called outside a context");
            return;
        };
        Self::switch_out(&ctx);
    }

    /// Parks the current context and schedules a one-shot timer that resumes
    /// it after `sec` seconds.
    pub fn yield_for(sec: Seconds) {
        let Some(co) = Coroutine::current() else {
            log::warn!("Coroutine::yield_for called outside a coroutine");
            return;
        };
        let Some(ctx) = co.current_context() else {
            log::warn!("Coroutine::yield_for called outside a context");
            return;
        };

        let co2 = co.clone();
        let c2 = ctx.clone();
        let _timer = set_timeout(sec, move || {
            co2.resume(&c2);
        });

        Self::switch_out(&ctx);
    }

    /// Shuts down the scheduler and its loop.
    pub fn delete_later(&self) {
        self.shared.lp.delete_later();
        self.shared.terminate.store(true, Ordering::SeqCst);
        self.shared.lp.set_run(true);
        self.shared.lp.work(|| {});
    }

    fn switch_out(ctx: &Context) {
        let ptr = ctx.yielder.load(Ordering::Acquire);
        if ptr == 0 {
            return;
        }
        // SAFETY: reachable only from inside the context's own closure on
        // its loop thread, where the yielder reference is live.
        let yielder = unsafe { &*(ptr as *const Yielder<(), ()>) };
        yielder.suspend(());
    }

    /// The scheduler body, run as a work item on the coroutine's loop that
    /// returns only at shutdown.
    fn scheduler(shared: Arc<CoroutineShared>) {
        CURRENT_CORO.with(|c| {
            *c.borrow_mut() = Some(Coroutine {
                shared: shared.clone(),
            })
        });

        loop {
            if shared.terminate.load(Ordering::SeqCst) {
                break;
            }

            let idle = shared.sched.lock().running.is_empty();
            if idle {
                // Blocks until registrations, resumes or timers land.
                shared.lp.wait_process();
                continue;
            }
            shared.lp.process();

            let next = shared.sched.lock().running.pop_first();
            let Some((_, ctx)) = next else {
                continue;
            };
            shared.sched.lock().current = Some(ctx.clone());

            let fiber = ctx.fiber.lock().take();
            if let Some(mut fiber) = fiber {
                match fiber.resume(()) {
                    CoroutineResult::Yield(()) => {
                        *ctx.fiber.lock() = Some(fiber);
                    }
                    CoroutineResult::Return(()) => {}
                }
            }

            let alive = {
                let mut st = ctx.state.lock();
                st.running = false;
                st.alive
            };
            let mut s = shared.sched.lock();
            if !alive {
                s.contexts.remove(&ctx.id);
            }
            s.current = None;
        }

        CURRENT_CORO.with(|c| *c.borrow_mut() = None);
    }
}

/// Scans every live context's stack sentinel and reports the first one that
/// has been clobbered by deep stack usage.
pub fn stack_overflow_check() -> Option<StackReport> {
    let watch = STACK_WATCH.lock();
    for info in watch.values() {
        // SAFETY: entries are registered only while their stack mapping is
        // alive; the watched word is never written after spawn.
        let word = unsafe { (info.limit as *const u32).read_volatile() };
        if word != STACK_SENTINEL {
            return Some(StackReport {
                loop_name: info.loop_name.clone(),
                stack_size: info.stack_size,
            });
        }
    }
    None
}

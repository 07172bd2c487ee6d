//! Shared timer service driving timeouts and intervals through the signal
//! graph.
//!
//! One scheduling thread (a dedicated [`EventLoop`]) owns an ordered map of
//! absolute deadlines. On each pass it pops everything due, emits each
//! still-running timer's `signal_timeout` — which re-enters the dispatch
//! machinery, so slots land on their own loops — re-inserts periodic
//! entries, and sleeps until the next head deadline (or a large idle
//! sentinel when the map is empty).

use crate::event_loop::EventLoop;
use crate::object::{Emitter, Object};
use crate::semaphore::Semaphore;
use crate::signal::{connect, Signal, SignalShared};
use crate::spin::SpinMutex;
use lazy_static::lazy_static;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Wall-clock seconds; the unit of every timer API.
pub type Seconds = f64;

/// Service wait when no timer is armed.
const IDLE_WAIT: Seconds = 666_666.0;

static NEXT_TIMER_SEQ: AtomicU64 = AtomicU64::new(1);

lazy_static! {
    static ref CLOCK_ANCHOR: Instant = Instant::now();
    static ref EPOCH_AT_ANCHOR: Seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    static ref SERVICE: TimerService = TimerService::start();
}

/// Monotonic seconds anchored to the Unix epoch at first use.
pub fn now() -> Seconds {
    *EPOCH_AT_ANCHOR + CLOCK_ANCHOR.elapsed().as_secs_f64()
}

/// Monotonic seconds since the runtime's clock anchor.
pub fn uptime() -> Seconds {
    CLOCK_ANCHOR.elapsed().as_secs_f64()
}

fn to_us(sec: Seconds) -> u64 {
    if sec <= 0.0 {
        0
    } else {
        (sec * 1_000_000.0) as u64
    }
}

type DeadlineKey = (u64, u64);

struct TimerStatus {
    running: bool,
    single_shot: bool,
    timeout: Seconds,
    last_emit: Seconds,
    deadline_key: Option<DeadlineKey>,
    signal: Option<Arc<SignalShared<()>>>,
}

type SharedTimerStatus = Arc<SpinMutex<TimerStatus>>;

type TimerMap = Arc<Mutex<BTreeMap<DeadlineKey, SharedTimerStatus>>>;

struct TimerService {
    sem: Arc<Semaphore>,
    map: TimerMap,
    _lp: EventLoop,
}

impl TimerService {
    fn start() -> TimerService {
        let sem = Arc::new(Semaphore::new(0));
        let map: TimerMap = Arc::new(Mutex::new(BTreeMap::new()));
        let lp = EventLoop::new("swiftlet:timer");

        let sem2 = sem.clone();
        let map2 = map.clone();
        lp.work(move || service_main(sem2, map2));

        TimerService { sem, map, _lp: lp }
    }
}

/// The service body: runs forever as one work item on the timer loop.
fn service_main(sem: Arc<Semaphore>, map: TimerMap) {
    let mut wait_time: Seconds = IDLE_WAIT;
    let mut ready: Vec<SharedTimerStatus> = Vec::new();

    loop {
        sem.wait_for(wait_time);

        {
            let mut m = map.lock().unwrap();
            let now_us = to_us(now());
            while let Some(entry) = m.first_entry() {
                if entry.key().0 > now_us {
                    break;
                }
                ready.push(entry.remove());
            }
        }

        for sts in ready.drain(..) {
            let keep = sts.clone();
            let mut st = keep.lock();
            if !st.running {
                continue;
            }
            if let Some(sig) = st.signal.clone() {
                sig.dispatch(());
            }
            if !st.single_shot {
                let n = now();
                st.last_emit = n;
                let key = (
                    to_us(n + st.timeout),
                    NEXT_TIMER_SEQ.fetch_add(1, Ordering::Relaxed),
                );
                st.deadline_key = Some(key);
                map.lock().unwrap().insert(key, sts);
            }
        }

        {
            let m = map.lock().unwrap();
            wait_time = match m.first_key_value() {
                Some((&(us, _), _)) => (us as Seconds / 1_000_000.0 - now()).max(0.0),
                None => IDLE_WAIT,
            };
        }
    }
}

/// One-shot or periodic timer; expiry is announced through
/// `signal_timeout`, so slots obey the usual cross-loop routing.
pub struct Timer {
    object: Object,
    pub signal_timeout: Signal<()>,
    status: SharedTimerStatus,
}

impl Emitter for Timer {
    fn object(&self) -> &Object {
        &self.object
    }
}

impl Timer {
    pub fn new() -> Timer {
        // First timer spins up the service thread.
        let _ = &*SERVICE;

        let signal_timeout: Signal<()> = Signal::new();
        let status = Arc::new(SpinMutex::new(TimerStatus {
            running: false,
            single_shot: true,
            timeout: 1.0,
            last_emit: 0.0,
            deadline_key: None,
            signal: Some(signal_timeout.shared().clone()),
        }));

        Timer {
            object: Object::new(),
            signal_timeout,
            status,
        }
    }

    /// Arms the timer to fire after `sec` seconds; restarts if already
    /// armed.
    pub fn start(&self, sec: Seconds) {
        self.stop();

        let key;
        {
            let mut st = self.status.lock();
            st.last_emit = now();
            st.running = true;
            st.timeout = sec;
            key = (
                to_us(st.last_emit + sec),
                NEXT_TIMER_SEQ.fetch_add(1, Ordering::Relaxed),
            );
            st.deadline_key = Some(key);
        }

        SERVICE.map.lock().unwrap().insert(key, self.status.clone());
        SERVICE.sem.post();
    }

    /// Disarms the timer, removing exactly its own pending entry.
    pub fn stop(&self) {
        let key = {
            let mut st = self.status.lock();
            st.running = false;
            st.deadline_key.take()
        };
        if let Some(key) = key {
            SERVICE.map.lock().unwrap().remove(&key);
        }
    }

    pub fn is_running(&self) -> bool {
        self.status.lock().running
    }

    pub fn timeout(&self) -> Seconds {
        self.status.lock().timeout
    }

    /// Seconds until the next expiry, clamped at zero.
    pub fn remaining(&self) -> Seconds {
        let st = self.status.lock();
        let due = st.last_emit + st.timeout;
        (due - now()).max(0.0)
    }

    pub fn set_single_shot(&self, single_shot: bool) {
        self.status.lock().single_shot = single_shot;
    }

    pub fn single_shot(&self) -> bool {
        self.status.lock().single_shot
    }
}

impl Default for Timer {
    fn default() -> Self {
        Timer::new()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.status.lock().running = false;
    }
}

/// Fires `f` once after `sec` seconds on the calling thread's loop.
///
/// The timer keeps itself alive until it fires, then releases; the returned
/// handle may be used to restart or stop it early.
pub fn set_timeout<F>(sec: Seconds, f: F) -> Arc<Timer>
where
    F: Fn() + Send + Sync + 'static,
{
    let t = Arc::new(Timer::new());

    // signal_timeout is a field of Timer, so the membership check cannot
    // fail; the handle is deliberately not kept.
    let _ = connect(&*t, &t.signal_timeout, move |()| f());

    let holder: Arc<SpinMutex<Option<Arc<Timer>>>> = Arc::new(SpinMutex::new(Some(t.clone())));
    let holder2 = holder.clone();
    let _ = connect(&*t, &t.signal_timeout, move |()| {
        holder2.lock().take();
    });

    t.start(sec);
    t
}

/// Fires `f` every `sec` seconds on the calling thread's loop until the
/// returned timer is stopped or dropped.
pub fn set_interval<F>(sec: Seconds, f: F) -> Arc<Timer>
where
    F: Fn() + Send + Sync + 'static,
{
    let t = Arc::new(Timer::new());

    // signal_timeout is a field of Timer, so the membership check cannot
    // fail; the handle is deliberately not kept.
    let _ = connect(&*t, &t.signal_timeout, move |()| f());

    t.set_single_shot(false);
    t.start(sec);
    t
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_clock_is_monotonic() {
        let a = now();
        let b = now();
        assert!(b >= a);
        assert!(uptime() >= 0.0);
    }

    #[test]
    fn test_timer_stop_before_expiry() {
        let lp = EventLoop::new("t:timer-stop");
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        lp.work_sync(move || {
            let t = set_timeout(0.05, move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            });
            t.stop();
        });
        thread::sleep(Duration::from_millis(150));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        lp.delete_later();
    }

    #[test]
    fn test_timer_remaining_decreases() {
        let t = Timer::new();
        t.start(10.0);
        let r = t.remaining();
        assert!(r > 9.0 && r <= 10.0);
        t.stop();
        assert!(!t.is_running());
    }

    #[test]
    fn test_restart_replaces_deadline() {
        let t = Timer::new();
        t.start(5.0);
        t.start(50.0);
        let r = t.remaining();
        assert!(r > 45.0);
        t.stop();
    }
}

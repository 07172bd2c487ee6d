//! Timer service behavior: one-shot lower bound, periodic cadence,
//! restarts, and stop semantics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use swiftlet::{connect, now, set_interval, set_timeout, EventLoop, Timer};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A one-shot timer fires no earlier than its delay.
#[test]
fn one_shot_fires_no_earlier_than_delay() {
    init_logging();
    let lp = EventLoop::new("tm:oneshot");
    let fired_at = Arc::new(Mutex::new(None));

    let fired2 = fired_at.clone();
    let started = Arc::new(Mutex::new(0.0));
    let started2 = started.clone();
    lp.work_sync(move || {
        *started2.lock().unwrap() = now();
        set_timeout(0.15, move || {
            *fired2.lock().unwrap() = Some(now());
        });
    });

    thread::sleep(Duration::from_millis(500));
    let fired = fired_at.lock().unwrap().expect("timer never fired");
    let started = *started.lock().unwrap();
    // Deadlines are kept at microsecond resolution.
    assert!(fired - started >= 0.15 - 1e-5);
    lp.delete_later();
}

#[test]
fn one_shot_fires_exactly_once() {
    init_logging();
    let lp = EventLoop::new("tm:once");
    let hits = Arc::new(AtomicUsize::new(0));

    let hits2 = hits.clone();
    lp.work_sync(move || {
        set_timeout(0.05, move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
    });

    thread::sleep(Duration::from_millis(400));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    lp.delete_later();
}

/// Interval cadence stays close to the period over a longer run.
#[test]
fn interval_tick_cadence() {
    init_logging();
    let lp = EventLoop::new("tm:interval");
    let ticks = Arc::new(AtomicUsize::new(0));
    let holder = Arc::new(Mutex::new(None));

    let ticks2 = ticks.clone();
    let holder2 = holder.clone();
    lp.work_sync(move || {
        let t = set_interval(0.05, move || {
            ticks2.fetch_add(1, Ordering::SeqCst);
        });
        *holder2.lock().unwrap() = Some(t);
    });

    thread::sleep(Duration::from_millis(600));
    if let Some(t) = holder.lock().unwrap().take() {
        t.stop();
    }
    let n = ticks.load(Ordering::SeqCst);
    // ~12 expected at a 50ms period; wide bounds absorb scheduler noise.
    assert!(n >= 6, "only {} ticks in 600ms", n);
    assert!(n <= 14, "{} ticks in 600ms", n);
    lp.delete_later();
}

/// Restarting an armed timer replaces its deadline instead of doubling it.
#[test]
fn restart_replaces_pending_shot() {
    init_logging();
    let lp = EventLoop::new("tm:restart");
    let hits = Arc::new(AtomicUsize::new(0));
    let holder: Arc<Mutex<Option<Timer>>> = Arc::new(Mutex::new(None));

    let hits2 = hits.clone();
    let holder2 = holder.clone();
    lp.work_sync(move || {
        let t = Timer::new();
        let hits3 = hits2.clone();
        connect(&t, &t.signal_timeout, move |()| {
            hits3.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        t.start(0.5);
        t.start(0.1);
        *holder2.lock().unwrap() = Some(t);
    });

    thread::sleep(Duration::from_millis(300));
    // Only the restarted shot fires; the replaced deadline is gone.
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    thread::sleep(Duration::from_millis(400));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    holder.lock().unwrap().take();
    lp.delete_later();
}

/// A dropped timer never fires, even with a pending map entry.
#[test]
fn dropped_timer_is_silent() {
    init_logging();
    let lp = EventLoop::new("tm:dropped");
    let hits = Arc::new(AtomicUsize::new(0));

    let hits2 = hits.clone();
    lp.work_sync(move || {
        let t = Timer::new();
        let hits3 = hits2.clone();
        connect(&t, &t.signal_timeout, move |()| {
            hits3.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        t.start(0.05);
        drop(t);
    });

    thread::sleep(Duration::from_millis(250));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    lp.delete_later();
}

/// Slots of a timer land on the loop the connection was made from.
#[test]
fn timer_slot_runs_on_connect_loop() {
    init_logging();
    let lp = EventLoop::new("tm:affine");
    let name = Arc::new(Mutex::new(String::new()));

    let name2 = name.clone();
    lp.work_sync(move || {
        set_timeout(0.05, move || {
            *name2.lock().unwrap() = thread::current().name().unwrap_or("").to_string();
        });
    });

    thread::sleep(Duration::from_millis(300));
    assert_eq!(name.lock().unwrap().as_str(), "tm:affine");
    lp.delete_later();
}

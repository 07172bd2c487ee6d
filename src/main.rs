use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use swiftlet::{
    connect, connect_signal, coroutine_pool, Coroutine, Emitter, EventLoop, Mode, Object, Signal,
};

struct Producer {
    object: Object,
    produced: Signal<i32>,
    relayed: Signal<i32>,
}

impl Emitter for Producer {
    fn object(&self) -> &Object {
        &self.object
    }
}

fn main() {
    println!("Swiftlet - Event-Driven Concurrency Runtime\n");

    // Example 1: signals dispatched on one loop
    println!("Example 1: Same-loop signal dispatch");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    EventLoop::instance().work_sync(move || {
        let p = Producer {
            object: Object::new(),
            produced: Signal::new(),
            relayed: Signal::new(),
        };
        let seen3 = seen2.clone();
        connect(&p, &p.produced, move |v| {
            seen3.lock().unwrap().push(v);
        })
        .unwrap();

        // Chain produced -> relayed -> counter slot.
        connect_signal(&p, &p.produced, &p, &p.relayed, Mode::Auto).unwrap();
        let seen4 = seen2.clone();
        connect(&p, &p.relayed, move |v| {
            seen4.lock().unwrap().push(v * 10);
        })
        .unwrap();

        p.produced.dispatch(7);
    });
    EventLoop::instance().work_sync(|| {});
    println!("  observed: {:?}\n", seen.lock().unwrap());

    // Example 2: coroutines yielding to each other
    println!("Example 2: Cooperative contexts");
    let co = Coroutine::new("demo:co");
    let log = Arc::new(Mutex::new(Vec::new()));
    let log_a = log.clone();
    let a = co
        .work(move || {
            for i in 0..3 {
                log_a.lock().unwrap().push(format!("A{}", i));
                Coroutine::yield_now();
            }
        })
        .unwrap();
    let log_b = log.clone();
    let b = co
        .work(move || {
            for i in 0..3 {
                log_b.lock().unwrap().push(format!("B{}", i));
                Coroutine::yield_now();
            }
        })
        .unwrap();
    co.join(&a);
    co.join(&b);
    println!("  interleaving: {:?}\n", log.lock().unwrap());

    // Example 3: timers
    println!("Example 3: Timers through the signal graph");
    let ticks = Arc::new(AtomicUsize::new(0));
    let ticks2 = ticks.clone();
    let lp = EventLoop::instance();
    let t = Arc::new(Mutex::new(None));
    let t2 = t.clone();
    lp.work_sync(move || {
        let timer = swiftlet::set_interval(0.05, move || {
            ticks2.fetch_add(1, Ordering::SeqCst);
        });
        *t2.lock().unwrap() = Some(timer);
    });
    std::thread::sleep(Duration::from_millis(300));
    if let Some(timer) = t.lock().unwrap().take() {
        timer.stop();
    }
    println!("  ticks in 300ms at 50ms period: {}\n", ticks.load(Ordering::SeqCst));

    // Example 4: the balanced pool
    println!("Example 4: Coroutine pool");
    let done = Arc::new(AtomicUsize::new(0));
    let mut infos = Vec::new();
    for _ in 0..8 {
        let done2 = done.clone();
        infos.push(
            coroutine_pool::coroutine_work(move || {
                std::thread::sleep(Duration::from_millis(10));
                done2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap(),
        );
    }
    for info in &infos {
        info.coroutine.join(&info.context);
    }
    println!("  pool ran {} jobs\n", done.load(Ordering::SeqCst));

    co.delete_later();
    println!("done");
}

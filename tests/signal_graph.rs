//! Signal dispatch semantics: same-loop and cross-loop delivery, chaining,
//! teardown under emission, and synchronous dispatch ordering.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use swiftlet::{
    connect, connect_signal, connect_with, Emitter, EventLoop, Mode, Object, Signal,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Node {
    object: Object,
    sig1: Signal<()>,
    sig2: Signal<i32>,
    sig3: Signal<i32>,
}

impl Node {
    fn on(lp: &EventLoop) -> Node {
        Node {
            object: Object::with_loop(lp),
            sig1: Signal::new(),
            sig2: Signal::new(),
            sig3: Signal::new(),
        }
    }
}

impl Emitter for Node {
    fn object(&self) -> &Object {
        &self.object
    }
}

/// Same-loop emission invokes a connected lambda slot.
#[test]
fn dispatch_to_lambda_same_loop() {
    init_logging();
    let lp = EventLoop::new("sig:s1");
    let values = Arc::new(Mutex::new(Vec::new()));

    let values2 = values.clone();
    let lp2 = lp.clone();
    lp.work_sync(move || {
        let p = Node::on(&lp2);
        let values3 = values2.clone();
        connect(&p, &p.sig2, move |v| {
            values3.lock().unwrap().push(v);
        })
        .unwrap();

        p.sig2.dispatch(1);
    });
    lp.work_sync(|| {});

    assert_eq!(*values.lock().unwrap(), vec![1]);
    lp.delete_later();
}

/// Auto delivery to a receiver on another loop lands on that loop's
/// thread.
#[test]
fn cross_loop_auto_delivery() {
    init_logging();
    let loop_a = EventLoop::new("sig:a");
    let loop_b = EventLoop::new("sig:b");

    let sender = Node::on(&loop_a);
    let receiver = Node::on(&loop_b);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    connect_with(
        &sender,
        &sender.sig2,
        &receiver,
        move |v| {
            let name = thread::current().name().unwrap_or("").to_string();
            seen2.lock().unwrap().push((name, v));
        },
        Mode::Auto,
    )
    .unwrap();
    // Let both setup halves land before emitting.
    loop_a.work_sync(|| {});
    loop_b.work_sync(|| {});

    sender.sig2.dispatch(42);

    let deadline = Instant::now() + Duration::from_millis(100);
    loop {
        if !seen.lock().unwrap().is_empty() {
            break;
        }
        if Instant::now() > deadline {
            panic!("slot was not delivered within 100ms");
        }
        thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(
        *seen.lock().unwrap(),
        vec![("sig:b".to_string(), 42)]
    );
    loop_a.delete_later();
    loop_b.delete_later();
}

/// A chained signal forwards exactly once with the original argument.
#[test]
fn signal_chaining_forwards_once() {
    init_logging();
    let lp = EventLoop::new("sig:s3");
    let hits = Arc::new(Mutex::new(Vec::new()));

    let hits2 = hits.clone();
    let lp2 = lp.clone();
    lp.work_sync(move || {
        let p = Node::on(&lp2);
        connect_signal(&p, &p.sig2, &p, &p.sig3, Mode::Auto).unwrap();
        let hits3 = hits2.clone();
        connect(&p, &p.sig3, move |v| {
            hits3.lock().unwrap().push(v);
        })
        .unwrap();

        p.sig2.dispatch(7);
    });
    lp.work_sync(|| {});

    assert_eq!(*hits.lock().unwrap(), vec![7]);
    lp.delete_later();
}

/// A slot destroying the signal's container stops the emission cleanly;
/// later slots of the same emission never run.
#[test]
fn destroy_container_during_dispatch() {
    init_logging();
    let lp = EventLoop::new("sig:s4");
    let later_slot_hits = Arc::new(AtomicUsize::new(0));
    let holder: Arc<Mutex<Option<Node>>> = Arc::new(Mutex::new(None));

    {
        let holder = holder.clone();
        let later = later_slot_hits.clone();
        let lp2 = lp.clone();
        lp.work_sync(move || {
            let p = Node::on(&lp2);

            let holder2 = holder.clone();
            connect(&p, &p.sig1, move |()| {
                // Suicide: drop the container mid-emission.
                holder2.lock().unwrap().take();
            })
            .unwrap();

            let later2 = later.clone();
            connect(&p, &p.sig1, move |()| {
                later2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

            *holder.lock().unwrap() = Some(p);
        });
    }

    // Emission is re-posted to the signal's loop, where the first slot
    // drops the container out from under the second.
    {
        let guard = holder.lock().unwrap();
        if let Some(p) = guard.as_ref() {
            p.sig1.dispatch(());
        }
    }
    lp.work_sync(|| {});

    assert_eq!(later_slot_hits.load(Ordering::SeqCst), 0);
    assert!(holder.lock().unwrap().is_none());
    lp.delete_later();
}

/// Deleting the receiver before emission means its slot never runs, even
/// across loops.
#[test]
fn dead_receiver_slot_never_runs() {
    init_logging();
    let loop_a = EventLoop::new("sig:dead-a");
    let loop_b = EventLoop::new("sig:dead-b");

    let sender = Node::on(&loop_a);
    let receiver = Node::on(&loop_b);
    let hits = Arc::new(AtomicUsize::new(0));

    let hits2 = hits.clone();
    connect_with(
        &sender,
        &sender.sig2,
        &receiver,
        move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        },
        Mode::Auto,
    )
    .unwrap();
    loop_a.work_sync(|| {});
    loop_b.work_sync(|| {});

    // Tear the receiver down on its own loop, then emit.
    let receiver = Arc::new(Mutex::new(Some(receiver)));
    let receiver2 = receiver.clone();
    loop_b.work_sync(move || {
        receiver2.lock().unwrap().take();
    });

    sender.sig2.dispatch(5);
    loop_a.work_sync(|| {});
    loop_b.work_sync(|| {});

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    loop_a.delete_later();
    loop_b.delete_later();
}

/// Explicit disconnect severs future deliveries without touching other
/// connections.
#[test]
fn disconnect_severs_one_connection() {
    init_logging();
    let lp = EventLoop::new("sig:cut");
    let kept = Arc::new(AtomicUsize::new(0));
    let cut = Arc::new(AtomicUsize::new(0));

    let kept2 = kept.clone();
    let cut2 = cut.clone();
    let lp2 = lp.clone();
    lp.work_sync(move || {
        let p = Node::on(&lp2);
        let kept3 = kept2.clone();
        connect(&p, &p.sig2, move |_| {
            kept3.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        let cut3 = cut2.clone();
        let conn = connect(&p, &p.sig2, move |_| {
            cut3.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        p.sig2.dispatch(1);
        conn.disconnect();
        lp2.process();
        p.sig2.dispatch(2);
    });
    lp.work_sync(|| {});

    assert_eq!(kept.load(Ordering::SeqCst), 2);
    assert_eq!(cut.load(Ordering::SeqCst), 1);
    lp.delete_later();
}

/// After dispatch_sync returns, the Sync slot has run, and every item
/// scheduled before it on the receiver's loop ran first.
#[test]
fn dispatch_sync_orders_after_prior_work() {
    init_logging();
    let loop_a = EventLoop::new("sig:sync-a");
    let loop_b = EventLoop::new("sig:sync-b");

    let sender = Node::on(&loop_a);
    let receiver = Node::on(&loop_b);

    let counter = Arc::new(AtomicUsize::new(0));
    let observed = Arc::new(AtomicUsize::new(usize::MAX));

    let counter2 = counter.clone();
    let observed2 = observed.clone();
    connect_with(
        &sender,
        &sender.sig2,
        &receiver,
        move |_| {
            observed2.store(counter2.load(Ordering::SeqCst), Ordering::SeqCst);
        },
        Mode::Sync,
    )
    .unwrap();
    loop_a.work_sync(|| {});
    loop_b.work_sync(|| {});

    for _ in 0..100 {
        let counter = counter.clone();
        loop_b.work(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    sender.sig2.dispatch_sync(9);

    // The slot must have seen all 100 earlier items already processed.
    assert_eq!(observed.load(Ordering::SeqCst), 100);
    loop_a.delete_later();
    loop_b.delete_later();
}

/// Object-scoped disconnects: dropping the sender tears down the whole fan.
#[test]
fn sender_drop_tears_down_connections() {
    init_logging();
    let lp = EventLoop::new("sig:drop-sender");
    let hits = Arc::new(AtomicUsize::new(0));

    let hits2 = hits.clone();
    let lp2 = lp.clone();
    lp.work_sync(move || {
        let p = Node::on(&lp2);
        let hits3 = hits2.clone();
        let conn = connect(&p, &p.sig2, move |_| {
            hits3.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        drop(p);
        assert!(!conn.is_alive());
    });
    lp.work_sync(|| {});

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    lp.delete_later();
}

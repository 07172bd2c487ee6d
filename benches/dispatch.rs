//! Dispatch and scheduling throughput benchmarks using criterion.
//!
//! Measures same-loop signal emission, round-trip work posting, and the
//! coroutine yield cycle.

use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use swiftlet::{connect, Coroutine, Emitter, EventLoop, Object, Signal};

struct Bench {
    object: Object,
    sig: Signal<usize>,
}

impl Emitter for Bench {
    fn object(&self) -> &Object {
        &self.object
    }
}

/// Emission from a foreign thread: alive checks plus the posting path.
fn bench_cross_loop_dispatch(c: &mut Criterion) {
    let lp = EventLoop::new("bench:dispatch");
    let hits = Arc::new(AtomicUsize::new(0));

    let sender = Bench {
        object: Object::with_loop(&lp),
        sig: Signal::new(),
    };
    let hits2 = hits.clone();
    connect(&sender, &sender.sig, move |v| {
        hits2.fetch_add(v, Ordering::Relaxed);
    })
    .unwrap();
    lp.work_sync(|| {});

    // Warmup
    for i in 0..1000 {
        sender.sig.dispatch(i);
    }
    lp.work_sync(|| {});

    c.bench_function("cross_loop_dispatch", |b| {
        b.iter(|| {
            sender.sig.dispatch(std::hint::black_box(1));
        })
    });
    lp.work_sync(|| {});
    lp.delete_later();
}

/// Cross-thread work posting round trip.
fn bench_work_sync_round_trip(c: &mut Criterion) {
    let lp = EventLoop::new("bench:worksync");

    // Warmup
    for _ in 0..100 {
        lp.work_sync(|| {});
    }

    c.bench_function("work_sync_round_trip", |b| {
        b.iter(|| {
            lp.work_sync(std::hint::black_box(|| {}));
        })
    });
    lp.delete_later();
}

/// Full spawn/join cycle of a coroutine context.
fn bench_context_spawn_join(c: &mut Criterion) {
    let co = Coroutine::new("bench:ctx");

    // Warmup
    for _ in 0..100 {
        let ctx = co.work(|| {}).unwrap();
        co.join(&ctx);
    }

    c.bench_function("context_spawn_join", |b| {
        b.iter(|| {
            let ctx = co.work(std::hint::black_box(|| {})).unwrap();
            co.join(&ctx);
        })
    });
    co.delete_later();
}

criterion_group!(
    benches,
    bench_cross_loop_dispatch,
    bench_work_sync_round_trip,
    bench_context_spawn_join
);
criterion_main!(benches);

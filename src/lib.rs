//! # Swiftlet - Event-Driven Concurrency Runtime
//!
//! A reusable core for reactive, multi-threaded applications built from four
//! interlocking subsystems:
//!
//! - **Event loops**: per-thread prioritized work queues with a
//!   high-priority fast path ([`EventLoop`])
//! - **Signals**: typed N-to-M dispatch that safely crosses loop boundaries
//!   and survives sender/receiver teardown ([`Signal`], [`connect`])
//! - **Coroutines**: stackful fibers scheduled cooperatively on a loop,
//!   with yield/pending/resume/join primitives and a balanced pool
//!   ([`Coroutine`], [`coroutine_pool`])
//! - **Timers**: a shared service driving timeouts and intervals through
//!   the signal graph ([`Timer`], [`set_timeout`], [`set_interval`])
//!
//! ## Example
//!
//! ```no_run
//! use swiftlet::{connect, Emitter, EventLoop, Object, Signal};
//!
//! struct Sensor {
//!     object: Object,
//!     reading: Signal<i32>,
//! }
//!
//! impl Emitter for Sensor {
//!     fn object(&self) -> &Object {
//!         &self.object
//!     }
//! }
//!
//! EventLoop::instance().work_sync(|| {
//!     let sensor = Sensor {
//!         object: Object::new(),
//!         reading: Signal::new(),
//!     };
//!     connect(&sensor, &sensor.reading, |value| {
//!         println!("reading: {}", value);
//!     })
//!     .unwrap();
//!     sensor.reading.dispatch(42);
//! });
//! ```

pub mod alive;
pub mod coroutine;
pub mod coroutine_pool;
pub mod error;
pub mod event_loop;
pub mod object;
pub mod ring;
pub mod semaphore;
pub mod signal;
pub mod spin;
pub mod timer;

pub use alive::{AliveCell, LoopAlive, SharedAlive};
pub use coroutine::{
    stack_overflow_check, Context, ContextId, Coroutine, SharedContext, StackReport,
    DEFAULT_STACK_SIZE,
};
pub use coroutine_pool::ContextInfo;
pub use error::{ConnectError, SpawnError};
pub use event_loop::{EventLoop, Priority, HIGH_PRIORITY};
pub use object::{Emitter, Object, ObjectId};
pub use ring::RingQueue;
pub use semaphore::Semaphore;
pub use signal::{
    connect, connect_signal, connect_with, disconnect, disconnect_as_receiver,
    disconnect_as_sender, disconnect_objects, ConnectId, Connection, Mode, SharedConnection,
    Signal, SignalArg,
};
pub use spin::SpinMutex;
pub use timer::{now, set_interval, set_timeout, uptime, Seconds, Timer};

//! Identity-bearing participants in the signal graph.
//!
//! An [`Object`] pins an identity to exactly one [`EventLoop`] and publishes
//! two witnesses: a liveness cell checked by cross-thread callbacks, and a
//! clone of its loop's teardown handle. Connection records accumulate in two
//! sets (as-sender, as-receiver) and are torn down by `Drop` through each
//! record's disconnect closure.
//!
//! Dropping an object from a thread other than its affine loop's is a user
//! bug: it is logged and teardown proceeds anyway.

use crate::alive::{AliveCell, LoopAlive, SharedAlive};
use crate::event_loop::EventLoop;
use crate::signal::{ConnectId, SharedConnection, SignalNode};
use crate::spin::SpinMutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Monotonically increasing object identity.
pub type ObjectId = u64;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct ObjectState {
    lp: EventLoop,
    loop_alive: Option<Arc<LoopAlive>>,
    as_sender: BTreeMap<ConnectId, SharedConnection>,
    as_receiver: BTreeMap<ConnectId, SharedConnection>,
    signals: Vec<Weak<dyn SignalNode>>,
}

pub(crate) struct ObjectShared {
    id: ObjectId,
    alive: SharedAlive,
    state: SpinMutex<ObjectState>,
}

impl ObjectShared {
    pub(crate) fn id(&self) -> ObjectId {
        self.id
    }

    pub(crate) fn alive(&self) -> &SharedAlive {
        &self.alive
    }

    pub(crate) fn event_loop(&self) -> EventLoop {
        self.state.lock().lp.clone()
    }

    pub(crate) fn add_as_sender(&self, conn: SharedConnection) {
        self.state.lock().as_sender.insert(conn.id(), conn);
    }

    pub(crate) fn remove_as_sender(&self, id: ConnectId) {
        self.state.lock().as_sender.remove(&id);
    }

    pub(crate) fn add_as_receiver(&self, conn: SharedConnection) {
        self.state.lock().as_receiver.insert(conn.id(), conn);
    }

    pub(crate) fn remove_as_receiver(&self, id: ConnectId) {
        self.state.lock().as_receiver.remove(&id);
    }

    /// Records a signal as bound to this container so loop migration can
    /// rebind it, deduplicating by node identity.
    pub(crate) fn bind_signal(&self, node: &Arc<dyn SignalNode>) {
        let mut state = self.state.lock();
        let key = node.key();
        let already = state
            .signals
            .iter()
            .any(|w| w.upgrade().map(|n| n.key() == key).unwrap_or(false));
        if !already {
            state.signals.push(Arc::downgrade(node));
        }
    }
}

/// An identity pinned to an event loop, embedded by anything that owns
/// signals or receives slot invocations.
///
/// Cloning produces a *new* identity affine to the current loop; the
/// original's connections are not carried over.
pub struct Object {
    shared: Arc<ObjectShared>,
}

impl Object {
    /// Creates an object affine to the calling thread's loop.
    pub fn new() -> Object {
        Object::with_loop(&EventLoop::current())
    }

    /// Creates an object affine to an explicit loop.
    pub fn with_loop(lp: &EventLoop) -> Object {
        let shared = Arc::new(ObjectShared {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            alive: AliveCell::new(),
            state: SpinMutex::new(ObjectState {
                lp: lp.clone(),
                loop_alive: lp.shared_alive(),
                as_sender: BTreeMap::new(),
                as_receiver: BTreeMap::new(),
                signals: Vec::new(),
            }),
        });
        Object { shared }
    }

    pub fn id(&self) -> ObjectId {
        self.shared.id()
    }

    /// The loop this object is affine to.
    pub fn event_loop(&self) -> EventLoop {
        self.shared.event_loop()
    }

    /// This object's liveness cell.
    pub fn alive_handle(&self) -> SharedAlive {
        self.shared.alive.clone()
    }

    /// The affine loop's teardown witness as captured at creation or the
    /// last migration.
    pub fn loop_alive(&self) -> Option<Arc<LoopAlive>> {
        self.shared.state.lock().loop_alive.clone()
    }

    /// Reassigns the object (and every signal bound to it) to `lp`.
    pub fn move_to_loop(&self, lp: &EventLoop) {
        if !self.event_loop().is_current() {
            log::warn!(
                "Object::move_to_loop on object {} from a foreign thread (affine loop {})",
                self.shared.id,
                self.event_loop().name()
            );
        }

        let nodes: Vec<Arc<dyn SignalNode>> = {
            let state = self.shared.state.lock();
            state.signals.iter().filter_map(|w| w.upgrade()).collect()
        };
        for node in nodes {
            node.bind_container(self.shared.alive.clone(), lp.clone());
        }

        let mut state = self.shared.state.lock();
        state.lp = lp.clone();
        state.loop_alive = lp.shared_alive();
    }

    /// Severs every as-sender connection targeting `receiver_id`.
    pub fn disconnect_receiver(&self, receiver_id: ObjectId) {
        for conn in self.snapshot_as_sender() {
            if conn.receiver_id() == Some(receiver_id) {
                conn.disconnect();
            }
        }
    }

    /// Severs every as-receiver connection originating from `sender_id`.
    pub fn disconnect_sender(&self, sender_id: ObjectId) {
        for conn in self.snapshot_as_receiver() {
            if conn.sender_id() == sender_id {
                conn.disconnect();
            }
        }
    }

    /// Severs every connection involving `signal` on either side: as-sender
    /// records emitting from it, and as-receiver records chained into it.
    pub fn disconnect_signal<A: crate::signal::SignalArg>(&self, signal: &crate::signal::Signal<A>) {
        let key = signal.node().key();
        for conn in self.snapshot_as_sender() {
            if conn.signal_key() == key {
                conn.disconnect();
            }
        }
        for conn in self.snapshot_as_receiver() {
            if conn.slot_key() == key {
                conn.disconnect();
            }
        }
    }

    /// Severs every connection where this object is the sender.
    pub fn disconnect_all_as_sender(&self) {
        for conn in self.snapshot_as_sender() {
            conn.disconnect();
        }
    }

    /// Severs every connection where this object is the receiver.
    pub fn disconnect_all_as_receiver(&self) {
        for conn in self.snapshot_as_receiver() {
            conn.disconnect();
        }
    }

    pub(crate) fn shared(&self) -> &Arc<ObjectShared> {
        &self.shared
    }

    fn snapshot_as_sender(&self) -> Vec<SharedConnection> {
        self.shared
            .state
            .lock()
            .as_sender
            .values()
            .cloned()
            .collect()
    }

    fn snapshot_as_receiver(&self) -> Vec<SharedConnection> {
        self.shared
            .state
            .lock()
            .as_receiver
            .values()
            .cloned()
            .collect()
    }
}

impl Default for Object {
    fn default() -> Self {
        Object::new()
    }
}

impl Clone for Object {
    /// A clone is a brand-new identity on the current loop; connections are
    /// intentionally not copied.
    fn clone(&self) -> Self {
        Object::new()
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        self.shared.alive.kill();

        if !self.event_loop().is_current() {
            log::warn!(
                "Object {} dropped from a foreign thread (affine loop {})",
                self.shared.id,
                self.event_loop().name()
            );
        }

        let (senders, receivers) = {
            let state = self.shared.state.lock();
            (
                state.as_sender.values().cloned().collect::<Vec<_>>(),
                state.as_receiver.values().cloned().collect::<Vec<_>>(),
            )
        };
        for conn in senders.into_iter().chain(receivers) {
            conn.disconnect();
        }
    }
}

/// Marks a value that embeds an [`Object`] and may own signals, taking the
/// place of base-class inheritance in the dispatch API.
pub trait Emitter {
    fn object(&self) -> &Object;
}

impl Emitter for Object {
    fn object(&self) -> &Object {
        self
    }
}

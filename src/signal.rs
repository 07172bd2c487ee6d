//! Typed N-to-M dispatch across loop boundaries.
//!
//! A [`Signal`] is an emission point embedded next to an [`Object`] inside a
//! sender value. Connections link it to slots: plain callables, callables
//! bound to a receiver object, or another signal (chaining). Each connection
//! carries a delivery [`Mode`] deciding whether a cross-loop invocation is
//! posted non-blocking or synchronously.
//!
//! Emission never runs a slot for a dead counterpart: receiver liveness is
//! re-checked under the receiver's alive cell both when resolving its loop
//! and again inside the posted closure. A slot may even destroy the signal's
//! own container mid-emission; the emission loop notices and stops.

use crate::alive::{LoopAlive, SharedAlive};
use crate::error::ConnectError;
use crate::event_loop::EventLoop;
use crate::object::{Emitter, ObjectId, ObjectShared};
use crate::spin::SpinMutex;
use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Monotonically increasing connection identity.
pub type ConnectId = u64;

static NEXT_CONNECT_ID: AtomicU64 = AtomicU64::new(1);

/// Cross-loop delivery mode of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Post to the receiver's loop without blocking the emitter.
    Auto,
    /// Post to the receiver's loop and block until the slot has run.
    Sync,
}

/// Payload carried by a signal; use a tuple for multiple arguments.
pub trait SignalArg: Clone + Send + 'static {}

impl<T: Clone + Send + 'static> SignalArg for T {}

type SlotFn<A> = Arc<dyn Fn(A) + Send + Sync>;
type DisconnectFn = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Type-erased view of a signal, shared between objects (for loop
/// migration) and connection records (for teardown).
pub(crate) trait SignalNode: Send + Sync {
    /// Stable identity of the signal's shared state.
    fn key(&self) -> usize;
    /// Rebinds the signal to its container's alive cell and loop.
    fn bind_container(&self, alive: SharedAlive, lp: EventLoop);
    /// Drops one connection from the slot table.
    fn remove_connect(&self, id: ConnectId);
}

/// Durable record linking (sender, signal, receiver?, slot, mode).
///
/// Shared between the sender object, the signal's slot table, the receiver
/// object (or the receiver loop's registry when receiver-less), and the
/// caller of `connect`. Dropping the handle does **not** disconnect; call
/// [`disconnect`] or one of the object-scoped helpers.
pub struct Connection {
    id: ConnectId,
    alive: AtomicBool,
    mode: Mode,
    sender_id: ObjectId,
    receiver_id: Option<ObjectId>,
    sender_alive: SharedAlive,
    receiver_alive: Option<SharedAlive>,
    receiver: Option<Weak<ObjectShared>>,
    signal_key: usize,
    slot_key: usize,
    receiver_loop: Option<EventLoop>,
    // Held so the receiver loop's thread cannot finish shutdown while a
    // receiver-less connection still routes to it.
    _receiver_loop_alive: Option<Arc<LoopAlive>>,
    disconnect_fun: SpinMutex<Option<DisconnectFn>>,
}

pub type SharedConnection = Arc<Connection>;

impl Connection {
    pub fn id(&self) -> ConnectId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn sender_id(&self) -> ObjectId {
        self.sender_id
    }

    pub fn receiver_id(&self) -> Option<ObjectId> {
        self.receiver_id
    }

    pub(crate) fn signal_key(&self) -> usize {
        self.signal_key
    }

    pub(crate) fn slot_key(&self) -> usize {
        self.slot_key
    }

    /// Severs the connection. Idempotent: the record's alive flag flips
    /// exactly once, and later calls return without effect.
    pub fn disconnect(&self) {
        let fun = self.disconnect_fun.lock().clone();
        if let Some(f) = fun {
            f(self);
        }
    }

    fn set_disconnect(&self, f: DisconnectFn) {
        *self.disconnect_fun.lock() = Some(f);
    }
}

/// Severs a connection; free-function form of [`Connection::disconnect`].
pub fn disconnect(conn: &SharedConnection) {
    conn.disconnect();
}

/// Severs every connection from `sender` to `receiver`.
pub fn disconnect_objects(sender: &impl Emitter, receiver: &impl Emitter) {
    sender.object().disconnect_receiver(receiver.object().id());
}

/// Severs every connection where `sender` is the emitting side.
pub fn disconnect_as_sender(sender: &impl Emitter) {
    sender.object().disconnect_all_as_sender();
}

/// Severs every connection where `receiver` is the receiving side.
pub fn disconnect_as_receiver(receiver: &impl Emitter) {
    receiver.object().disconnect_all_as_receiver();
}

struct Binding {
    lp: Option<EventLoop>,
    container_alive: Option<SharedAlive>,
}

struct SlotEntry<A> {
    conn: SharedConnection,
    func: SlotFn<A>,
}

pub(crate) struct SignalShared<A: SignalArg> {
    self_weak: Weak<SignalShared<A>>,
    binding: SpinMutex<Binding>,
    table: SpinMutex<BTreeMap<ConnectId, SlotEntry<A>>>,
}

impl<A: SignalArg> SignalShared<A> {
    fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| SignalShared {
            self_weak: weak.clone(),
            binding: SpinMutex::new(Binding {
                lp: None,
                container_alive: None,
            }),
            table: SpinMutex::new(BTreeMap::new()),
        })
    }

    fn insert(&self, conn: SharedConnection, func: SlotFn<A>) {
        self.table.lock().insert(conn.id(), SlotEntry { conn, func });
    }

    fn binding_snapshot(&self) -> (Option<EventLoop>, Option<SharedAlive>) {
        let b = self.binding.lock();
        (b.lp.clone(), b.container_alive.clone())
    }

    pub(crate) fn dispatch(&self, args: A) {
        self.emit(args, false);
    }

    pub(crate) fn dispatch_sync(&self, args: A) {
        self.emit(args, true);
    }

    fn emit(&self, args: A, sync: bool) {
        let (lp, container_alive) = self.binding_snapshot();
        let Some(lp) = lp else {
            // Never connected; nothing can be listening.
            return;
        };

        if lp.is_current() {
            self.emit_inline(args, sync);
            return;
        }

        let Some(this) = self.self_weak.upgrade() else {
            return;
        };
        let run = move || {
            if let Some(alive) = &container_alive {
                if !alive.is_alive() {
                    return;
                }
            }
            this.emit_inline(args, sync);
        };
        if sync {
            lp.work_sync(run);
        } else {
            lp.work(run);
        }
    }

    /// Inline emission helper: runs on the signal's own loop thread.
    fn emit_inline(&self, args: A, sync: bool) {
        let (lp, container_alive) = self.binding_snapshot();
        let Some(my_loop) = lp else {
            return;
        };

        // Snapshot the handles so concurrent disconnects during emission are
        // tolerated; each entry is re-looked-up under the table lock below.
        let snapshot: Vec<ConnectId> = self.table.lock().keys().copied().collect();

        for id in snapshot {
            let entry = {
                let table = self.table.lock();
                table.get(&id).map(|e| (e.conn.clone(), e.func.clone()))
            };
            let Some((conn, func)) = entry else {
                continue;
            };
            if !conn.is_alive() {
                continue;
            }

            // Resolve the receiver's loop; a dead receiver skips the slot.
            let receiver_loop = if let (Some(r_alive), Some(r_weak)) =
                (&conn.receiver_alive, &conn.receiver)
            {
                match r_alive.if_alive(|| r_weak.upgrade().map(|o| o.event_loop())) {
                    Some(Some(lp)) => lp,
                    _ => continue,
                }
            } else if let Some(lp) = &conn.receiver_loop {
                lp.clone()
            } else {
                continue;
            };

            if receiver_loop.same(&my_loop) {
                func(args.clone());
            } else {
                let call: Box<dyn FnOnce() + Send> = match &conn.receiver_alive {
                    Some(r_alive) => {
                        let r_alive = r_alive.clone();
                        let func = func.clone();
                        let args = args.clone();
                        Box::new(move || {
                            if !r_alive.is_alive() {
                                return;
                            }
                            func(args);
                        })
                    }
                    None => {
                        let func = func.clone();
                        let args = args.clone();
                        Box::new(move || func(args))
                    }
                };
                if sync {
                    receiver_loop.work_sync(call);
                } else {
                    match conn.mode {
                        Mode::Auto => receiver_loop.work(call),
                        Mode::Sync => receiver_loop.work_sync(call),
                    }
                }
            }

            // A slot may have destroyed the signal's own container; stop the
            // emission rather than touch freed user state.
            if let Some(alive) = &container_alive {
                if !alive.is_alive() {
                    return;
                }
            }
        }
    }
}

impl<A: SignalArg> SignalNode for SignalShared<A> {
    fn key(&self) -> usize {
        self as *const Self as *const () as usize
    }

    fn bind_container(&self, alive: SharedAlive, lp: EventLoop) {
        let mut b = self.binding.lock();
        b.lp = Some(lp);
        b.container_alive = Some(alive);
    }

    fn remove_connect(&self, id: ConnectId) {
        self.table.lock().remove(&id);
    }
}

/// A typed emission point. Embed next to an [`Object`] inside the sender.
///
/// Signals are intentionally not `Clone`: a signal's identity is its place
/// inside exactly one container object.
pub struct Signal<A: SignalArg = ()> {
    shared: Arc<SignalShared<A>>,
}

impl<A: SignalArg> Signal<A> {
    pub fn new() -> Self {
        Signal {
            shared: SignalShared::new(),
        }
    }

    /// Emits to every live connection.
    ///
    /// Runs inline when called on the signal's loop; otherwise re-enters on
    /// that loop without blocking the caller. Same-loop slots are invoked
    /// directly; cross-loop slots are posted per their connection's
    /// [`Mode`].
    pub fn dispatch(&self, args: A) {
        // The local handle keeps the shared state alive even if a slot
        // destroys the container this signal is embedded in.
        let shared = self.shared.clone();
        shared.dispatch(args);
    }

    /// Like [`Signal::dispatch`], but every cross-loop hop blocks until the
    /// slot has run — including between slots, so a slow receiver delays
    /// the ones after it.
    pub fn dispatch_sync(&self, args: A) {
        let shared = self.shared.clone();
        shared.dispatch_sync(args);
    }

    pub(crate) fn shared(&self) -> &Arc<SignalShared<A>> {
        &self.shared
    }

    pub(crate) fn node(&self) -> Arc<dyn SignalNode> {
        self.shared.clone()
    }
}

impl<A: SignalArg> Default for Signal<A> {
    fn default() -> Self {
        Signal::new()
    }
}

fn check_signal_member<S, A: SignalArg>(
    sender: &S,
    signal: &Signal<A>,
) -> Result<(), ConnectError> {
    let base = sender as *const S as usize;
    let sig = signal as *const Signal<A> as usize;
    if sig < base || sig > base + mem::size_of::<S>() {
        return Err(ConnectError::SignalNotMember);
    }
    Ok(())
}

/// Connects `signal` to a free-standing slot.
///
/// The slot is affine to the loop current at the time of this call and will
/// always be invoked there. Returns the shared connection record; dropping
/// it does not disconnect.
pub fn connect<S, A, F>(
    sender: &S,
    signal: &Signal<A>,
    slot: F,
) -> Result<SharedConnection, ConnectError>
where
    S: Emitter,
    A: SignalArg,
    F: Fn(A) + Send + Sync + 'static,
{
    check_signal_member(sender, signal)?;

    let receiver_loop = EventLoop::current();
    let conn = Arc::new(Connection {
        id: NEXT_CONNECT_ID.fetch_add(1, Ordering::Relaxed),
        alive: AtomicBool::new(true),
        mode: Mode::Auto,
        sender_id: sender.object().id(),
        receiver_id: None,
        sender_alive: sender.object().alive_handle(),
        receiver_alive: None,
        receiver: None,
        signal_key: signal.shared.key(),
        slot_key: 0,
        _receiver_loop_alive: receiver_loop.shared_alive(),
        receiver_loop: Some(receiver_loop),
        disconnect_fun: SpinMutex::new(None),
    });

    finish_connect(sender.object().shared(), signal, conn.clone(), Arc::new(slot), None);
    Ok(conn)
}

/// Connects `signal` to a slot bound to `receiver`.
///
/// The slot runs on whatever loop `receiver` is affine to at emission time
/// and is skipped once the receiver is gone, wherever its state lives.
pub fn connect_with<S, R, A, F>(
    sender: &S,
    signal: &Signal<A>,
    receiver: &R,
    slot: F,
    mode: Mode,
) -> Result<SharedConnection, ConnectError>
where
    S: Emitter,
    R: Emitter,
    A: SignalArg,
    F: Fn(A) + Send + Sync + 'static,
{
    check_signal_member(sender, signal)?;
    let conn = receiver_connection(sender, signal, receiver, 0, mode);
    finish_connect(
        sender.object().shared(),
        signal,
        conn.clone(),
        Arc::new(slot),
        Some(receiver.object().shared().clone()),
    );
    Ok(conn)
}

/// Chains `signal` into `target`: every emission is forwarded literally to
/// `target.dispatch`, re-entering the dispatch machinery on the receiver.
pub fn connect_signal<S, R, A>(
    sender: &S,
    signal: &Signal<A>,
    receiver: &R,
    target: &Signal<A>,
    mode: Mode,
) -> Result<SharedConnection, ConnectError>
where
    S: Emitter,
    R: Emitter,
    A: SignalArg,
{
    check_signal_member(sender, signal)?;

    let target_shared = target.shared.clone();
    let slot_key = target_shared.key();
    let conn = receiver_connection(sender, signal, receiver, slot_key, mode);
    let forward: SlotFn<A> = Arc::new(move |args| target_shared.dispatch(args));
    finish_connect(
        sender.object().shared(),
        signal,
        conn.clone(),
        forward,
        Some(receiver.object().shared().clone()),
    );
    Ok(conn)
}

fn receiver_connection<S, R, A>(
    sender: &S,
    signal: &Signal<A>,
    receiver: &R,
    slot_key: usize,
    mode: Mode,
) -> SharedConnection
where
    S: Emitter,
    R: Emitter,
    A: SignalArg,
{
    Arc::new(Connection {
        id: NEXT_CONNECT_ID.fetch_add(1, Ordering::Relaxed),
        alive: AtomicBool::new(true),
        mode,
        sender_id: sender.object().id(),
        receiver_id: Some(receiver.object().id()),
        sender_alive: sender.object().alive_handle(),
        receiver_alive: Some(receiver.object().alive_handle()),
        receiver: Some(Arc::downgrade(receiver.object().shared())),
        signal_key: signal.shared.key(),
        slot_key,
        receiver_loop: None,
        _receiver_loop_alive: None,
        disconnect_fun: SpinMutex::new(None),
    })
}

/// Completes a connection: posts sender-side (and receiver-side) setup to
/// the owning loops and installs the teardown closure.
fn finish_connect<A: SignalArg>(
    sender_shared: &Arc<ObjectShared>,
    signal: &Signal<A>,
    conn: SharedConnection,
    func: SlotFn<A>,
    receiver_shared: Option<Arc<ObjectShared>>,
) {
    let sender_alive = sender_shared.alive().clone();
    let sender_weak = Arc::downgrade(sender_shared);
    let signal_shared = signal.shared.clone();

    // Sender-side setup runs on the sender's loop so its connection set is
    // only ever mutated by the owning thread.
    {
        let sender_alive = sender_alive.clone();
        let sender_shared = sender_shared.clone();
        let signal_shared = signal_shared.clone();
        let conn = conn.clone();
        let has_receiver = receiver_shared.is_some();
        let sender_loop = sender_shared.event_loop();
        let setup = move || {
            if !sender_alive.is_alive() {
                return;
            }
            let node: Arc<dyn SignalNode> = signal_shared.clone();
            signal_shared.bind_container(sender_alive.clone(), sender_shared.event_loop());
            sender_shared.bind_signal(&node);
            sender_shared.add_as_sender(conn.clone());
            signal_shared.insert(conn.clone(), func.clone());
            if !has_receiver {
                if let Some(rl) = &conn.receiver_loop {
                    rl.add_connection(conn.clone());
                }
            }
        };
        if sender_loop.is_current() {
            setup();
        } else {
            sender_loop.work(setup);
        }
    }

    // Receiver-side registration, analogously on the receiver's loop.
    if let Some(receiver_shared) = &receiver_shared {
        let receiver_alive = receiver_shared.alive().clone();
        let receiver_shared2 = receiver_shared.clone();
        let conn2 = conn.clone();
        let setup = move || {
            if !receiver_alive.is_alive() {
                return;
            }
            receiver_shared2.add_as_receiver(conn2.clone());
        };
        let receiver_loop = receiver_shared.event_loop();
        if receiver_loop.is_current() {
            setup();
        } else {
            receiver_loop.work(setup);
        }
    }

    // Teardown closure. Captures only weak references and alive cells; the
    // record itself arrives as a parameter so the closure cannot keep its
    // own connection alive.
    let signal_weak: Weak<SignalShared<A>> = Arc::downgrade(&signal_shared);
    let receiver_side = receiver_shared.as_ref().map(|rs| {
        (rs.alive().clone(), Arc::downgrade(rs))
    });
    let df: DisconnectFn = Arc::new(move |scb: &Connection| {
        if !scb.alive.swap(false, Ordering::SeqCst) {
            return;
        }

        sender_alive.if_alive(|| {
            if let Some(ss) = sender_weak.upgrade() {
                let sa = sender_alive.clone();
                let sw = sender_weak.clone();
                let sig = signal_weak.clone();
                let id = scb.id;
                ss.event_loop().work(move || {
                    if !sa.is_alive() {
                        return;
                    }
                    if let Some(ss) = sw.upgrade() {
                        ss.remove_as_sender(id);
                    }
                    if let Some(sig) = sig.upgrade() {
                        sig.remove_connect(id);
                    }
                });
            }
        });

        match &receiver_side {
            Some((r_alive, r_weak)) => {
                r_alive.if_alive(|| {
                    if let Some(rs) = r_weak.upgrade() {
                        let ra = r_alive.clone();
                        let rw = r_weak.clone();
                        let id = scb.id;
                        rs.event_loop().work(move || {
                            if !ra.is_alive() {
                                return;
                            }
                            if let Some(rs) = rw.upgrade() {
                                rs.remove_as_receiver(id);
                            }
                        });
                    }
                });
            }
            None => {
                if let Some(rl) = &scb.receiver_loop {
                    rl.remove_connection(scb.id);
                }
            }
        }
    });
    conn.set_disconnect(df);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Object;
    use std::sync::atomic::AtomicUsize;

    struct Probe {
        object: Object,
        fired: Signal<i32>,
    }

    impl Emitter for Probe {
        fn object(&self) -> &Object {
            &self.object
        }
    }

    #[test]
    fn test_signal_without_connections_is_inert() {
        let s: Signal<i32> = Signal::new();
        // Never connected: no loop binding, dispatch must be a no-op.
        s.dispatch(1);
    }

    #[test]
    fn test_connect_rejects_foreign_signal() {
        let lp = EventLoop::new("t:member");
        lp.work_sync(|| {
            let p = Probe {
                object: Object::new(),
                fired: Signal::new(),
            };
            let stray: Signal<i32> = Signal::new();
            let err = connect(&p, &stray, |_| {});
            assert!(matches!(err, Err(ConnectError::SignalNotMember)));
            // The member signal itself is accepted.
            assert!(connect(&p, &p.fired, |_| {}).is_ok());
        });
        lp.delete_later();
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let lp = EventLoop::new("t:idem");
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let lp2 = lp.clone();
        lp.work_sync(move || {
            let p = Probe {
                object: Object::new(),
                fired: Signal::new(),
            };
            let conn = connect(&p, &p.fired, move |_| {
                hits2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

            p.fired.dispatch(1);
            lp2.process();

            conn.disconnect();
            conn.disconnect();
            assert!(!conn.is_alive());

            p.fired.dispatch(2);
            lp2.process();
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        lp.delete_later();
    }
}

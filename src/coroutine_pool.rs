//! Process-wide pool of coroutines, balanced by outstanding work.
//!
//! Members are ranked in an ordered map keyed by a load score, so the
//! least-loaded member is always at the head. Scores are integer work units
//! seeded with a per-member epsilon (the member index) so that insertion
//! order breaks ties. A score is elevated only while its job is queued or
//! running: context jobs un-bump through the completion signal, plain loop
//! jobs through an un-bump item posted right behind them.

use crate::coroutine::{Coroutine, SharedContext};
use crate::error::SpawnError;
use crate::event_loop::Priority;
use crate::signal::connect;
use crate::spin::SpinMutex;
use lazy_static::lazy_static;
use std::collections::BTreeMap;
use std::thread;

/// One queued/running job's worth of load.
const JOB_UNIT: u64 = 1_000_000;

/// A pool placement: which member took the job and the spawned context.
pub struct ContextInfo {
    pub coroutine: Coroutine,
    pub context: SharedContext,
}

struct Member {
    co: Coroutine,
    load: u64,
}

struct PoolState {
    target_size: usize,
    stack_size: usize,
    pin: bool,
    members: Vec<Member>,
    by_load: BTreeMap<(u64, usize), usize>,
}

lazy_static! {
    static ref POOL: SpinMutex<PoolState> = SpinMutex::new(PoolState {
        target_size: thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
        stack_size: 0,
        pin: false,
        members: Vec::new(),
        by_load: BTreeMap::new(),
    });
}

fn init_pool(p: &mut PoolState) {
    if p.members.len() >= p.target_size {
        return;
    }
    let core_ids = if p.pin {
        core_affinity::get_core_ids().unwrap_or_default()
    } else {
        Vec::new()
    };

    while p.members.len() < p.target_size {
        let i = p.members.len();
        let name = format!("swiftlet:co:pool{}", i);
        let co = Coroutine::new(&name);
        if !core_ids.is_empty() {
            let core = core_ids[i % core_ids.len()];
            co.event_loop().work(move || {
                core_affinity::set_for_current(core);
            });
        }
        let load = i as u64;
        p.by_load.insert((load, i), i);
        p.members.push(Member { co, load });
    }
}

fn head_member(p: &PoolState) -> usize {
    // init_pool has always run by the time members are ranked, and the
    // target size is at least one, so the map is never empty.
    p.by_load.values().next().copied().unwrap_or_default()
}

fn bump(p: &mut PoolState, idx: usize) {
    let old = p.members[idx].load;
    p.by_load.remove(&(old, idx));
    let new = old + JOB_UNIT;
    p.members[idx].load = new;
    p.by_load.insert((new, idx), idx);
}

fn unbump(p: &mut PoolState, idx: usize) {
    let old = p.members[idx].load;
    p.by_load.remove(&(old, idx));
    let new = old.saturating_sub(JOB_UNIT);
    p.members[idx].load = new;
    p.by_load.insert((new, idx), idx);
}

/// Grows the pool's target size; the pool never shrinks.
pub fn set_pool_size(size: usize) {
    let mut p = POOL.lock();
    if size > p.target_size {
        p.target_size = size;
    }
    init_pool(&mut p);
}

pub fn pool_size() -> usize {
    POOL.lock().target_size
}

/// Default stack size for pool contexts; 0 defers to each member's own
/// default.
pub fn set_stack_size(size: usize) {
    POOL.lock().stack_size = size;
}

pub fn stack_size() -> usize {
    POOL.lock().stack_size
}

/// Pins members spawned from now on linearly onto CPU cores.
pub fn set_pin_to_cores(pin: bool) {
    POOL.lock().pin = pin;
}

/// Spawns `f` as a context on the least-loaded member.
pub fn coroutine_work<F>(f: F) -> Result<ContextInfo, SpawnError>
where
    F: FnOnce() + Send + 'static,
{
    coroutine_work_with(f, 0, 0)
}

/// Spawns `f` as a context on the least-loaded member with an explicit
/// stack size (0 = pool default) and priority.
pub fn coroutine_work_with<F>(
    f: F,
    stack_size: usize,
    pri: Priority,
) -> Result<ContextInfo, SpawnError>
where
    F: FnOnce() + Send + 'static,
{
    let mut p = POOL.lock();
    init_pool(&mut p);

    let idx = head_member(&p);
    let co = p.members[idx].co.clone();
    let stack = if stack_size == 0 { p.stack_size } else { stack_size };
    let ctx = co.work_with(f, stack, pri)?;
    bump(&mut p, idx);

    let _ = connect(&*ctx, &ctx.signal_complete, move |()| {
        let mut p = POOL.lock();
        unbump(&mut p, idx);
    });

    Ok(ContextInfo {
        coroutine: co,
        context: ctx,
    })
}

/// Enqueues `f` directly onto the least-loaded member's loop, without a new
/// context.
pub fn loop_work<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    loop_work_pri(f, 0)
}

/// Priority-ordered [`loop_work`].
pub fn loop_work_pri<F>(f: F, pri: Priority)
where
    F: FnOnce() + Send + 'static,
{
    let mut p = POOL.lock();
    init_pool(&mut p);

    let idx = head_member(&p);
    let lp = p.members[idx].co.event_loop();
    lp.work_pri(f, pri);
    bump(&mut p, idx);

    // Same priority, queued right behind the job: the score drops as soon
    // as the job has run.
    lp.work_pri(
        move || {
            let mut p = POOL.lock();
            unbump(&mut p, idx);
        },
        pri,
    );
}

//! §4.3 — ready/sleep lists, round-robin scheduling with priority donation,
//! and the optional 4.4BSD MLFQS. Grounded on the teacher's
//! `scheduler::Scheduler` (a single global `Mutex<Scheduler>`, processes
//! moved between a `VecDeque` and `current` by value) generalized from
//! cooperative-only round robin to the full policy in spec §4.3/§9.
//!
//! Threads live in a single arena (`threads`); the ready list, sleep list,
//! and every semaphore/lock/condvar waiter list hold only `ThreadId`s into
//! it (§9 REDESIGN FLAGS: arena + integer handles replace the intrusive
//! list, since membership in exactly one collection can no longer be
//! enforced by shared embedding).

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::config::{
    BootConfig, FIXED_POINT_F, MAX_THREADS, MLFQS_PRIORITY_FREQ, MLFQS_RECALC_FREQ, PRI_MAX,
    PRI_MIN, TIME_SLICE,
};
use crate::errors::ResourceExhaustion;
use crate::sync::lock::LockId;
use crate::thread::context::Context;
use crate::thread::{alloc_kernel_stack, Thread, ThreadId, ThreadState};

pub struct Scheduler {
    threads: BTreeMap<ThreadId, Thread>,
    /// Priority-descending; ties are FIFO (insertion-order preserved).
    ready: Vec<ThreadId>,
    /// Ascending by `wake_tick`.
    sleeping: Vec<ThreadId>,
    current: ThreadId,
    idle: ThreadId,
    next_id: u64,
    mlfqs: bool,
    /// 17.14 fixed-point system load average.
    load_avg: i64,
    ticks_this_slice: u64,
    yield_pending: bool,
}

impl Scheduler {
    fn ready_insert(&mut self, id: ThreadId) {
        let p = self.threads[&id].priority;
        let pos = self.ready.iter().position(|&o| self.threads[&o].priority < p).unwrap_or(self.ready.len());
        self.ready.insert(pos, id);
    }

    fn reorder_ready(&mut self, id: ThreadId) {
        if let Some(pos) = self.ready.iter().position(|&o| o == id) {
            self.ready.remove(pos);
            self.ready_insert(id);
        }
    }
}

lazy_static! {
    static ref SCHED: Mutex<Scheduler> = Mutex::new(fresh_scheduler());
    /// Serializes unit tests that touch the global scheduler — this crate
    /// models a single-core kernel, so its global state is not meant to be
    /// accessed from more than one OS thread at a time even under `cargo
    /// test`'s default parallel harness.
    static ref TEST_GUARD: Mutex<()> = Mutex::new(());
}

fn fresh_scheduler() -> Scheduler {
    let idle_stack = alloc_kernel_stack();
    let mut idle = Thread::new(ThreadId(0), "idle", PRI_MIN, idle_stack, Context::empty());
    idle.state = ThreadState::Running;
    idle.write_canary();
    let mut threads = BTreeMap::new();
    threads.insert(ThreadId(0), idle);
    Scheduler {
        threads,
        ready: Vec::new(),
        sleeping: Vec::new(),
        current: ThreadId(0),
        idle: ThreadId(0),
        next_id: 1,
        mlfqs: false,
        load_avg: 0,
        ticks_this_slice: 0,
        yield_pending: false,
    }
}

/// Re-initialize scheduler state with the given boot configuration. Call
/// once before any other thread/sync/vm/process API.
pub fn init(boot: BootConfig) {
    let mut s = SCHED.lock();
    *s = fresh_scheduler();
    s.mlfqs = boot.mlfqs;
}

#[cfg(test)]
pub fn test_reset() -> spin::MutexGuard<'static, ()> {
    let guard = TEST_GUARD.lock();
    *SCHED.lock() = fresh_scheduler();
    guard
}

// ---------------------------------------------------------------- queries

pub fn current_id() -> ThreadId {
    SCHED.lock().current
}

pub fn priority_of(id: ThreadId) -> u8 {
    SCHED.lock().threads.get(&id).map(|t| t.priority).unwrap_or(PRI_MIN)
}

pub fn is_mlfqs() -> bool {
    SCHED.lock().mlfqs
}

pub fn with_current<R>(f: impl FnOnce(&mut Thread) -> R) -> R {
    let mut s = SCHED.lock();
    let id = s.current;
    f(s.threads.get_mut(&id).expect("current thread missing from arena"))
}

pub fn with_thread<R>(id: ThreadId, f: impl FnOnce(&Thread) -> R) -> Option<R> {
    SCHED.lock().threads.get(&id).map(f)
}

pub fn with_thread_mut<R>(id: ThreadId, f: impl FnOnce(&mut Thread) -> R) -> Option<R> {
    SCHED.lock().threads.get_mut(&id).map(f)
}

/// Snapshot of (id, name, state) for every live thread — diagnostic use.
pub fn list_threads() -> Vec<(ThreadId, alloc::string::String, ThreadState)> {
    SCHED.lock().threads.values().map(|t| (t.id, t.name.clone(), t.state)).collect()
}

// ---------------------------------------------------------------- creation

/// §4.3 `create`: allocate a kernel stack, build the initial register
/// frame so the thread resumes at `entry(aux)`, enqueue it READY, and
/// preempt the caller immediately if the new thread outranks it.
pub fn create(name: &str, priority: u8, entry: extern "C" fn(usize) -> !, aux: usize) -> Result<ThreadId, ResourceExhaustion> {
    let mut s = SCHED.lock();
    if s.threads.len() >= MAX_THREADS {
        return Err(ResourceExhaustion::OutOfMemory);
    }
    let id = ThreadId(s.next_id);
    s.next_id += 1;

    let stack = alloc_kernel_stack();
    let stack_top = stack.as_ptr() as u64 + stack.len() as u64;
    // `kernel_thread` trampoline convention: r12/r13 carry entry/aux so the
    // first `restore_context` lands in a small shim that re-enables
    // interrupts before calling `entry(aux)` — mirrored in `mod.rs`'s
    // `kernel_thread_trampoline` used by `process::exec`/`fork`.
    let mut ctx = Context::new(kernel_thread_trampoline as u64, stack_top);
    ctx.r12 = entry as u64;
    ctx.r13 = aux as u64;

    let mut t = Thread::new(id, name, priority, stack, ctx);
    t.write_canary();
    t.state = ThreadState::Ready;
    s.threads.insert(id, t);
    s.ready_insert(id);

    let current_pri = s.threads[&s.current].priority;
    drop(s);
    if priority > current_pri {
        yield_now();
    }
    Ok(id)
}

/// Trampoline every freshly-created thread's context first resumes at (the
/// same role as the teacher's Ring-3 trampoline, generalized to kernel
/// threads): enable interrupts, then call the real entry point. Never
/// returns — a thread that falls off the end of `entry` must call `exit`.
extern "C" fn kernel_thread_trampoline() -> ! {
    let (entry, aux): (u64, u64) = with_current(|t| (t.context.r12, t.context.r13));
    enable_interrupts();
    let f: extern "C" fn(usize) -> ! = unsafe { core::mem::transmute(entry as usize) };
    f(aux as usize)
}

#[cfg(target_arch = "x86_64")]
fn enable_interrupts() {
    #[cfg(not(test))]
    unsafe {
        core::arch::asm!("sti");
    }
}
#[cfg(not(target_arch = "x86_64"))]
fn enable_interrupts() {}

// ---------------------------------------------------------------- block/unblock/yield

/// Current thread → BLOCKED, schedule. Caller must already have removed
/// itself from the ready list (it isn't on one while running) and must
/// have recorded itself wherever it expects to be woken from.
pub fn block() {
    let mut s = SCHED.lock();
    let id = s.current;
    s.threads.get_mut(&id).unwrap().state = ThreadState::Blocked;
    schedule(s);
}

/// BLOCKED → READY, enqueued in priority order. Does not itself preempt;
/// callers that need the wake-up-preempts-immediately behavior call
/// `yield_if_outranked` afterward (matching §4.3's "does not itself
/// preempt (caller decides)").
pub fn unblock(id: ThreadId) {
    let mut s = SCHED.lock();
    let t = s.threads.get_mut(&id).expect("unblock of unknown thread");
    assert_eq!(t.state, ThreadState::Blocked, "unblock called on non-blocked thread");
    t.state = ThreadState::Ready;
    s.ready_insert(id);
}

/// Yields the CPU right now if `id` is ready and outranks the current
/// thread, and we're not already running it. Outside interrupt context.
pub fn yield_if_outranked(id: ThreadId) {
    let should = {
        let s = SCHED.lock();
        s.current != id && s.threads.get(&id).map(|t| t.priority) > s.threads.get(&s.current).map(|t| t.priority)
    };
    if should {
        yield_now();
    }
}

/// Re-enqueue the current thread (unless it's the idle thread with nothing
/// else ready) and schedule.
pub fn yield_now() {
    let mut s = SCHED.lock();
    let id = s.current;
    if id != s.idle || !s.ready.is_empty() {
        s.threads.get_mut(&id).unwrap().state = ThreadState::Ready;
        s.ready_insert(id);
    }
    schedule(s);
}

/// §4.3 `set_priority`: updates base priority, recomputes effective
/// priority, yields if a now-higher-priority thread is ready. A no-op
/// under MLFQS (recent_cpu/nice drive priority there instead).
pub fn set_priority(p: u8) {
    if is_mlfqs() {
        return;
    }
    let id = current_id();
    with_thread_mut(id, |t| t.base_priority = p);
    recompute_effective_priority(id);
    let top = SCHED.lock().ready.first().copied();
    if let Some(top) = top {
        yield_if_outranked(top);
    }
}

/// Terminates the current thread: marks it DYING and schedules away. Real
/// callers (the trap-return path) never resume execution past this call;
/// kept non-diverging here so it stays host-testable.
pub fn exit_current() {
    let mut s = SCHED.lock();
    let id = s.current;
    s.threads.get_mut(&id).unwrap().state = ThreadState::Dying;
    schedule(s);
    // `schedule` reaps DYING threads it finds in the ready list's place
    // once their context is no longer live; see `reap` below.
}

// ---------------------------------------------------------------- sleep/wake

pub fn sleep_until(wake_tick: i64) {
    let mut s = SCHED.lock();
    let id = s.current;
    s.threads.get_mut(&id).unwrap().wake_tick = wake_tick;
    s.threads.get_mut(&id).unwrap().state = ThreadState::Blocked;
    let pos = s.sleeping.iter().position(|&o| s.threads[&o].wake_tick > wake_tick).unwrap_or(s.sleeping.len());
    s.sleeping.insert(pos, id);
    schedule(s);
}

/// Called from the tick handler: wake every sleeper whose `wake_tick <=
/// now`, in ascending wake-tick order (§5 ordering guarantee).
pub fn awake(now: i64) {
    let mut s = SCHED.lock();
    let mut woken = Vec::new();
    while let Some(&first) = s.sleeping.first() {
        if s.threads[&first].wake_tick <= now {
            woken.push(first);
            s.sleeping.remove(0);
        } else {
            break;
        }
    }
    for id in woken {
        s.threads.get_mut(&id).unwrap().state = ThreadState::Ready;
        s.ready_insert(id);
    }
}

// ---------------------------------------------------------------- tick accounting

/// §4.1/§4.3: quantum accounting and, under MLFQS, recent_cpu/load_avg/
/// priority recomputation on the prescribed schedule.
pub fn on_tick(now: i64) {
    let mut s = SCHED.lock();
    if s.mlfqs {
        if s.current != s.idle {
            let id = s.current;
            s.threads.get_mut(&id).unwrap().recent_cpu += FIXED_POINT_F;
        }
        if now % (MLFQS_RECALC_FREQ as i64) == 0 {
            recalc_load_avg_and_recent_cpu(&mut s);
        }
        if now % (MLFQS_PRIORITY_FREQ as i64) == 0 {
            recalc_priorities(&mut s);
        }
    }
    s.ticks_this_slice += 1;
    if s.ticks_this_slice >= TIME_SLICE {
        s.yield_pending = true;
    }
}

/// Whether the tick handler should request a yield at interrupt return
/// (§4.3 preemption: "after TIME_SLICE ticks the handler requests a yield
/// at interrupt return").
pub fn take_yield_pending() -> bool {
    let mut s = SCHED.lock();
    let pending = s.yield_pending;
    s.yield_pending = false;
    pending
}

fn recalc_load_avg_and_recent_cpu(s: &mut Scheduler) {
    let ready_count = (s.ready.len() + if s.current != s.idle { 1 } else { 0 }) as i64;
    // load_avg = (59/60)*load_avg + (1/60)*ready_count, in 17.14 fixed point.
    let f = FIXED_POINT_F;
    s.load_avg = fp_mul_frac(59, 60, s.load_avg) + fp_mul_frac(1, 60, ready_count * f);
    let ids: Vec<ThreadId> = s.threads.keys().copied().collect();
    for id in ids {
        if id == s.idle {
            continue;
        }
        let (recent_cpu, nice) = {
            let t = &s.threads[&id];
            (t.recent_cpu, t.nice as i64)
        };
        // recent_cpu = (2*load_avg)/(2*load_avg+1) * recent_cpu + nice
        let two_la = 2 * s.load_avg;
        let coeff_num = two_la;
        let coeff_den = two_la + f;
        let new_cpu = fp_mul_div(coeff_num, recent_cpu, coeff_den) + nice * f;
        s.threads.get_mut(&id).unwrap().recent_cpu = new_cpu;
    }
}

fn recalc_priorities(s: &mut Scheduler) {
    let ids: Vec<ThreadId> = s.threads.keys().copied().collect();
    for id in ids {
        if id == s.idle {
            continue;
        }
        let t = &s.threads[&id];
        let f = FIXED_POINT_F;
        // priority = PRI_MAX - recent_cpu/4 - nice*2, clamped to [0,63].
        let raw = (PRI_MAX as i64) * f - t.recent_cpu / 4 - (t.nice as i64) * 2 * f;
        let pri = (raw / f).clamp(PRI_MIN as i64, PRI_MAX as i64) as u8;
        s.threads.get_mut(&id).unwrap().priority = pri;
        s.reorder_ready(id);
    }
}

fn fp_mul_frac(num: i64, den: i64, fp_value: i64) -> i64 {
    // (num/den) * fp_value computed to avoid truncating the fraction first.
    (num * fp_value) / den
}

fn fp_mul_div(a_fp: i64, b_fp: i64, c_fp: i64) -> i64 {
    // (a_fp/c_fp) * b_fp, all 17.14 fixed point, widened through i128.
    (((a_fp as i128) * (b_fp as i128)) / (c_fp as i128)) as i64
}

// ---------------------------------------------------------------- donation (called by sync::lock)

pub fn base_priority(id: ThreadId) -> u8 {
    with_thread(id, |t| t.base_priority).unwrap_or(PRI_MIN)
}

pub fn donations_of(id: ThreadId) -> Vec<ThreadId> {
    with_thread(id, |t| t.donations.clone()).unwrap_or_default()
}

pub fn set_wait_on_lock(id: ThreadId, lock: Option<LockId>) {
    with_thread_mut(id, |t| t.wait_on_lock = lock);
}

pub fn wait_on_lock_of(id: ThreadId) -> Option<LockId> {
    with_thread(id, |t| t.wait_on_lock).flatten()
}

pub fn push_donation(holder: ThreadId, donor: ThreadId) {
    with_thread_mut(holder, |t| {
        if !t.donations.contains(&donor) {
            t.donations.push(donor);
        }
    });
}

/// Removes every donor currently blocked on `lock` from `holder`'s
/// donation list (release-time cleanup, §4.2).
pub fn remove_donations_for_lock(holder: ThreadId, lock: LockId) {
    let mut s = SCHED.lock();
    if let Some(t) = s.threads.get_mut(&holder) {
        t.donations.retain(|&donor| s.threads.get(&donor).and_then(|d| d.wait_on_lock) != Some(lock));
    }
}

/// `priority = max(base, donors' effective priorities)`, written back and
/// reordered on the ready list if present. Returns the new priority.
pub fn recompute_effective_priority(id: ThreadId) -> u8 {
    let mut s = SCHED.lock();
    let (base, donors) = match s.threads.get(&id) {
        Some(t) => (t.base_priority, t.donations.clone()),
        None => return PRI_MIN,
    };
    let max_donor = donors.iter().filter_map(|&d| s.threads.get(&d).map(|t| t.priority)).max().unwrap_or(PRI_MIN);
    let new_pri = base.max(max_donor);
    s.threads.get_mut(&id).unwrap().priority = new_pri;
    s.reorder_ready(id);
    new_pri
}

// ---------------------------------------------------------------- core schedule()

/// Pick the next thread to run and switch to it. Takes the `SCHED` guard by
/// value and drops it before the real context switch — the teacher's
/// `drop(sched)` discipline, required here because the switch suspends this
/// call stack indefinitely and the next thread to run will want `SCHED` for
/// itself (it deadlocks the very first time any other code tries to lock it
/// while we're still "inside" this call, which from its perspective is
/// forever). Reaps the previous DYING thread's resources once it's safe to
/// (§4.3: "the dying thread's page is freed lazily at the next scheduler
/// entry").
fn schedule(mut s: spin::MutexGuard<'static, Scheduler>) {
    debug_assert!(s.threads[&s.current].canary_intact(), "kernel stack overflow");

    let prev_dying = s.threads[&s.current].state == ThreadState::Dying;
    let prev_id = s.current;

    let next_id = pick_next(&mut s);
    s.threads.get_mut(&next_id).unwrap().state = ThreadState::Running;
    s.current = next_id;
    s.ticks_this_slice = 0;

    if prev_id != next_id {
        // Raw pointers into the arena's values, valid only for the
        // instantaneous asm save/restore below: nothing else runs between
        // dropping `s` and entering `perform_switch`, so the map can't be
        // mutated out from under them on this side of the switch.
        let prev_ptr = s.threads.get_mut(&prev_id).unwrap() as *mut Thread;
        let next_ptr = s.threads.get(&next_id).unwrap() as *const Thread;
        drop(s);
        perform_switch(prev_dying, prev_ptr, next_ptr);
    } else {
        drop(s);
    }

    if prev_dying {
        reap(prev_id);
    }
}

fn pick_next(s: &mut Scheduler) -> ThreadId {
    if let Some(id) = s.ready.first().copied() {
        s.ready.remove(0);
        id
    } else {
        s.idle
    }
}

fn reap(id: ThreadId) {
    let t = SCHED.lock().threads.remove(&id);
    if let Some(t) = t {
        if let Some(user) = t.user {
            crate::process::reap_resources(user);
        }
    }
}

#[cfg(not(test))]
fn perform_switch(prev_dying: bool, prev_ptr: *mut Thread, next_ptr: *const Thread) {
    unsafe {
        let prev_ctx = &mut (*prev_ptr).context as *mut Context;
        let next_ctx = &(*next_ptr).context as *const Context;
        if prev_dying {
            crate::thread::context::restore_context(next_ctx);
        } else {
            crate::thread::context::switch_context(prev_ctx, next_ctx);
        }
    }
}

/// Host unit tests never have a second real execution context to switch
/// into — only the bookkeeping in `schedule()` above is exercised.
#[cfg(test)]
fn perform_switch(_prev_dying: bool, _prev_ptr: *mut Thread, _next_ptr: *const Thread) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BootConfig;

    extern "C" fn noop_entry(_aux: usize) -> ! {
        loop {}
    }

    #[test]
    fn create_enqueues_ready_in_priority_order() {
        let _g = test_reset();
        init(BootConfig::default());
        let low = create("low", 10, noop_entry, 0).unwrap();
        let high = create("high", 40, noop_entry, 0).unwrap();
        let s = SCHED.lock();
        assert_eq!(s.ready[0], high);
        assert_eq!(s.ready[1], low);
    }

    #[test]
    fn equal_priority_is_fifo() {
        let _g = test_reset();
        init(BootConfig::default());
        let a = create("a", 20, noop_entry, 0).unwrap();
        let b = create("b", 20, noop_entry, 0).unwrap();
        let s = SCHED.lock();
        let pos_a = s.ready.iter().position(|&x| x == a).unwrap();
        let pos_b = s.ready.iter().position(|&x| x == b).unwrap();
        assert!(pos_a < pos_b);
    }

    #[test]
    fn sleep_list_orders_by_wake_tick() {
        let _g = test_reset();
        init(BootConfig::default());
        let stack = alloc_kernel_stack();
        // Simulate three sleepers directly via the internal API.
        let mut s = SCHED.lock();
        for (name, wake) in [("t100", 100i64), ("t50", 50), ("t150", 150)] {
            let id = ThreadId(s.next_id);
            s.next_id += 1;
            let mut t = Thread::new(id, name, 31, alloc_kernel_stack(), Context::empty());
            t.wake_tick = wake;
            t.state = ThreadState::Blocked;
            s.threads.insert(id, t);
            let pos = s.sleeping.iter().position(|&o| s.threads[&o].wake_tick > wake).unwrap_or(s.sleeping.len());
            s.sleeping.insert(pos, id);
        }
        drop(stack);
        let order: Vec<i64> = s.sleeping.iter().map(|&id| s.threads[&id].wake_tick).collect();
        assert_eq!(order, alloc::vec![50, 100, 150]);
    }

    #[test]
    fn donation_raises_holder_effective_priority() {
        let _g = test_reset();
        init(BootConfig::default());
        let holder = create("holder", 10, noop_entry, 0).unwrap();
        let donor = create("donor", 30, noop_entry, 0).unwrap();
        push_donation(holder, donor);
        let new_pri = recompute_effective_priority(holder);
        assert_eq!(new_pri, 30);
    }
}

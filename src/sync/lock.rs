//! Mutex with owner tracking and priority donation (§4.2). Locks are
//! registered in a small global arena so a `LockId` can be followed back
//! from a waiter to the lock it's blocked on and from there to the lock's
//! current holder — the hop the donation chain needs and that a bare
//! `Lock` value (which might live on a test's stack, not just in a
//! `'static`) can't support with a raw pointer alone.

use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex as SpinMutex;

use crate::config::DONATION_DEPTH_MAX;
use crate::sync::semaphore::{insert_by_priority, Semaphore};
use crate::thread::{scheduler, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LockId(pub u64);

struct LockSlot {
    sema: Semaphore,
    holder: Option<ThreadId>,
}

lazy_static! {
    static ref LOCKS: SpinMutex<Vec<LockSlot>> = SpinMutex::new(Vec::new());
}

pub struct Lock {
    id: LockId,
}

impl Lock {
    pub fn new() -> Self {
        let mut locks = LOCKS.lock();
        let id = LockId(locks.len() as u64);
        locks.push(LockSlot { sema: Semaphore::new(1), holder: None });
        Lock { id }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    pub fn holder(&self) -> Option<ThreadId> {
        LOCKS.lock()[self.id.0 as usize].holder
    }

    pub fn is_held_by_current(&self) -> bool {
        self.holder() == Some(scheduler::current_id())
    }

    /// §4.2: on contention, record `wait_on_lock`, join the holder's
    /// donation list, and propagate priority up the `holder ->
    /// holder.wait_on_lock.holder -> ...` chain to a bounded depth.
    pub fn acquire(&self) {
        let me = scheduler::current_id();
        if self.try_acquire_fast() {
            return;
        }
        if !scheduler::is_mlfqs() {
            self.donate_chain(me);
        }
        {
            let mut locks = LOCKS.lock();
            let slot = &mut locks[self.id.0 as usize];
            insert_by_priority(slot.sema.waiters_mut(), me);
        }
        loop {
            // Mirrors `Semaphore::down`'s loop shape but needs to record
            // the new holder under the same lock as the decrement.
            let acquired = {
                let mut locks = LOCKS.lock();
                let slot = &mut locks[self.id.0 as usize];
                if slot.sema.try_down_raw() {
                    slot.sema.waiters_mut().retain(|&w| w != me);
                    slot.holder = Some(me);
                    true
                } else {
                    false
                }
            };
            if acquired {
                break;
            }
            scheduler::block();
        }
        scheduler::set_wait_on_lock(me, None);
    }

    fn try_acquire_fast(&self) -> bool {
        let mut locks = LOCKS.lock();
        let slot = &mut locks[self.id.0 as usize];
        if slot.sema.try_down_raw() {
            slot.holder = Some(scheduler::current_id());
            true
        } else {
            false
        }
    }

    /// Walk `holder -> holder.wait_on_lock.holder -> ...` donating `donor`'s
    /// priority at each hop, bounded by `DONATION_DEPTH_MAX` (§5: "donation
    /// chains walk at most N hops to bound interrupt-disabled time").
    fn donate_chain(&self, donor: ThreadId) {
        scheduler::set_wait_on_lock(donor, Some(self.id));
        let mut current_lock = self.id;
        let mut hops = 0;
        loop {
            let holder_opt = LOCKS.lock()[current_lock.0 as usize].holder;
            let holder = match holder_opt {
                Some(h) => h,
                None => break,
            };
            scheduler::push_donation(holder, donor);
            scheduler::recompute_effective_priority(holder);
            hops += 1;
            if hops >= DONATION_DEPTH_MAX {
                break;
            }
            match scheduler::wait_on_lock_of(holder) {
                Some(next_lock) => current_lock = next_lock,
                None => break,
            }
        }
    }

    /// §4.2: drop donors blocked on this lock from the releaser's donation
    /// list, recompute the releaser's priority, then wake the
    /// highest-priority waiter.
    pub fn release(&self) {
        let me = scheduler::current_id();
        scheduler::remove_donations_for_lock(me, self.id);
        scheduler::recompute_effective_priority(me);

        let woken = {
            let mut locks = LOCKS.lock();
            let slot = &mut locks[self.id.0 as usize];
            slot.holder = None;
            slot.sema.waiters_mut().sort_by(|a, b| scheduler::priority_of(*b).cmp(&scheduler::priority_of(*a)));
            let next = if slot.sema.waiters_mut().is_empty() { None } else { Some(slot.sema.waiters_mut().remove(0)) };
            slot.sema.up_raw();
            next
        };
        if let Some(id) = woken {
            scheduler::unblock(id);
            scheduler::yield_if_outranked(id);
        }
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BootConfig;
    use crate::thread::scheduler;

    extern "C" fn noop_entry(_aux: usize) -> ! {
        loop {}
    }

    #[test]
    fn uncontended_acquire_sets_holder() {
        let _g = scheduler::test_reset();
        scheduler::init(BootConfig::default());
        let l = Lock::new();
        l.acquire();
        assert!(l.is_held_by_current());
        l.release();
        assert_eq!(l.holder(), None);
    }

    #[test]
    fn donation_chain_raises_holder_priority() {
        let _g = scheduler::test_reset();
        scheduler::init(BootConfig::default());
        let l1 = Lock::new();
        let l2 = Lock::new();

        // A (pri 10) holds L1; B (pri 20) will hold L2 and wait on L1.
        let a = scheduler::create("A", 10, noop_entry, 0).unwrap();
        let b = scheduler::create("B", 20, noop_entry, 0).unwrap();
        let c = scheduler::create("C", 30, noop_entry, 0).unwrap();

        // Simulate A holding L1 directly (bypassing the real scheduler
        // since these are not actually-running threads in this test).
        {
            let mut locks = LOCKS.lock();
            locks[l1.id.0 as usize].sema.force_value(0);
            locks[l1.id.0 as usize].holder = Some(a);
            locks[l2.id.0 as usize].sema.force_value(0);
            locks[l2.id.0 as usize].holder = Some(b);
        }

        // B donates to A via L1.
        l1.donate_chain(b);
        assert_eq!(scheduler::priority_of(a), 20);

        // C donates to B via L2, which chains to A via L1 since B recorded
        // wait_on_lock = L1 above (as it would have while genuinely blocked).
        scheduler::set_wait_on_lock(b, Some(l1.id()));
        l2.donate_chain(c);
        assert_eq!(scheduler::priority_of(b), 30);
        assert_eq!(scheduler::priority_of(a), 30);
    }
}

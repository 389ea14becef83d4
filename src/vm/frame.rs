//! Global frame table: a fixed-size pool of page-sized buffers plus clock
//! eviction (§4.4). A frame's "physical address", as far as `hal::
//! AddressSpace::map` is concerned, is just its index into this table —
//! there's no real physical memory here, only the byte storage this table
//! owns on the crate's behalf.

use alloc::boxed::Box;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::config::{FRAME_POOL_SIZE, PGSIZE};
use crate::thread::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameId(pub usize);

struct Frame {
    data: Box<[u8]>,
    /// Owning thread and the virtual address it mapped this frame at —
    /// what the clock evictor needs to reach back into that thread's
    /// address space and SPT.
    owner: (ThreadId, u64),
}

struct FrameTable {
    frames: Vec<Option<Frame>>,
    clock_hand: usize,
}

lazy_static! {
    static ref FRAMES: Mutex<FrameTable> =
        Mutex::new(FrameTable { frames: (0..FRAME_POOL_SIZE).map(|_| None).collect(), clock_hand: 0 });
}

#[cfg(test)]
pub fn test_reset() {
    let mut t = FRAMES.lock();
    t.frames = (0..FRAME_POOL_SIZE).map(|_| None).collect();
    t.clock_hand = 0;
}

fn fresh_zeroed() -> Box<[u8]> {
    alloc::vec![0u8; PGSIZE as usize].into_boxed_slice()
}

/// Claims a free frame for `owner`'s page at `va`, running clock eviction
/// over the pool first if none are free. Returns a zeroed frame.
pub fn alloc_for(owner: ThreadId, va: u64) -> Option<FrameId> {
    if let Some(id) = try_claim_free(owner, va) {
        return Some(id);
    }
    evict_one()?;
    try_claim_free(owner, va)
}

fn try_claim_free(owner: ThreadId, va: u64) -> Option<FrameId> {
    let mut t = FRAMES.lock();
    let idx = (0..t.frames.len()).find(|&i| t.frames[i].is_none())?;
    t.frames[idx] = Some(Frame { data: fresh_zeroed(), owner: (owner, va) });
    Some(FrameId(idx))
}

/// Clock algorithm (§4.4): advance the hand over the frame list; a frame is
/// victim when its page's accessed bit is clear, else the bit is cleared
/// and the hand advances. At most two full sweeps are attempted before
/// giving up (every frame accessed twice in a row without being claimable
/// means there is genuinely nothing to evict).
fn evict_one() -> Option<()> {
    let len = FRAMES.lock().frames.len();
    for _ in 0..(2 * len.max(1)) {
        let owner = {
            let mut t = FRAMES.lock();
            if t.frames.is_empty() {
                return None;
            }
            let hand = t.clock_hand;
            t.clock_hand = (t.clock_hand + 1) % t.frames.len();
            t.frames[hand].as_ref().map(|f| f.owner)
        };
        let Some((tid, va)) = owner else { continue };
        let accessed = crate::thread::scheduler::with_thread_mut(tid, |th| {
            th.user.as_ref().map(|u| u.addr_space.is_accessed(va)).unwrap_or(false)
        })
        .unwrap_or(false);
        if accessed {
            crate::thread::scheduler::with_thread_mut(tid, |th| {
                if let Some(u) = th.user.as_mut() {
                    u.addr_space.clear_accessed(va);
                }
            });
            continue;
        }
        let evicted = crate::thread::scheduler::with_thread_mut(tid, |th| {
            let u = th.user.as_mut()?;
            let page = u.spt.pages.get_mut(&va)?;
            page.swap_out(u.addr_space.as_mut()).ok()?;
            Some(())
        })
        .flatten();
        if evicted.is_some() {
            return Some(());
        }
    }
    None
}

pub fn free(id: FrameId) {
    FRAMES.lock().frames[id.0] = None;
}

pub fn zero(id: FrameId) {
    with_bytes_mut(id, |b| b.fill(0));
}

pub fn with_bytes<R>(id: FrameId, f: impl FnOnce(&[u8]) -> R) -> R {
    let t = FRAMES.lock();
    f(&t.frames[id.0].as_ref().expect("dangling FrameId").data)
}

pub fn with_bytes_mut<R>(id: FrameId, f: impl FnOnce(&mut [u8]) -> R) -> R {
    let mut t = FRAMES.lock();
    f(&mut t.frames[id.0].as_mut().expect("dangling FrameId").data)
}

pub fn snapshot(id: FrameId) -> Vec<u8> {
    with_bytes(id, |b| b.to_vec())
}

pub fn restore(id: FrameId, bytes: &[u8]) {
    with_bytes_mut(id, |b| b.copy_from_slice(bytes));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_returns_zeroed_frame() {
        test_reset();
        let id = alloc_for(ThreadId(1), 0x1000).unwrap();
        with_bytes(id, |b| assert!(b.iter().all(|&x| x == 0)));
        free(id);
    }

    #[test]
    fn freed_frame_is_reused() {
        test_reset();
        let a = alloc_for(ThreadId(1), 0x1000).unwrap();
        free(a);
        let b = alloc_for(ThreadId(1), 0x2000).unwrap();
        assert_eq!(a, b);
    }
}

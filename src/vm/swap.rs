//! Anonymous-page swap area: a first-fit bitmap of fixed-size slots over a
//! registered `hal::BlockDevice` (§4.4/§6 — "channel=1, device=1", slot size
//! = PGSIZE).

use alloc::boxed::Box;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::config::{PGSIZE, SWAP_SLOT_COUNT};
use crate::hal::BlockDevice;
use crate::vm::frame::{self, FrameId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlotId(pub usize);

struct SwapArea {
    device: Option<Box<dyn BlockDevice>>,
    used: Vec<bool>,
}

lazy_static! {
    static ref SWAP: Mutex<SwapArea> =
        Mutex::new(SwapArea { device: None, used: alloc::vec![false; SWAP_SLOT_COUNT] });
}

/// Registers the backing block device. Call once at boot (or once per
/// test setup).
pub fn init(device: Box<dyn BlockDevice>) {
    let mut s = SWAP.lock();
    let n = device.slot_count().min(SWAP_SLOT_COUNT);
    s.device = Some(device);
    s.used = alloc::vec![false; n];
}

#[cfg(test)]
pub fn test_reset() {
    let mut s = SWAP.lock();
    s.device = None;
    s.used = alloc::vec![false; SWAP_SLOT_COUNT];
}

/// First-fit allocation over the bitmap (§6).
pub fn alloc_slot() -> Option<SwapSlotId> {
    let mut s = SWAP.lock();
    let idx = s.used.iter().position(|&used| !used)?;
    s.used[idx] = true;
    Some(SwapSlotId(idx))
}

pub fn free_slot(id: SwapSlotId) {
    let mut s = SWAP.lock();
    if id.0 < s.used.len() {
        s.used[id.0] = false;
    }
}

pub fn write_slot_from(id: SwapSlotId, frame_id: FrameId) {
    frame::with_bytes(frame_id, |buf| {
        let mut s = SWAP.lock();
        if let Some(dev) = s.device.as_mut() {
            dev.write_slot(id.0, buf);
        }
    });
}

pub fn read_slot_into(id: SwapSlotId, frame_id: FrameId) {
    let mut tmp = alloc::vec![0u8; PGSIZE as usize];
    {
        let mut s = SWAP.lock();
        if let Some(dev) = s.device.as_mut() {
            dev.read_slot(id.0, &mut tmp);
        }
    }
    frame::with_bytes_mut(frame_id, |buf| buf.copy_from_slice(&tmp));
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemBlockDevice {
        slots: Vec<[u8; 4096]>,
    }

    impl BlockDevice for MemBlockDevice {
        fn slot_count(&self) -> usize {
            self.slots.len()
        }
        fn read_slot(&mut self, slot: usize, buf: &mut [u8]) {
            buf.copy_from_slice(&self.slots[slot]);
        }
        fn write_slot(&mut self, slot: usize, buf: &[u8]) {
            self.slots[slot].copy_from_slice(buf);
        }
    }

    #[test]
    fn write_then_read_slot_round_trips() {
        test_reset();
        frame::test_reset();
        init(Box::new(MemBlockDevice { slots: alloc::vec![[0u8; 4096]; 4] }));
        let frame_id = frame::alloc_for(crate::thread::ThreadId(1), 0x1000).unwrap();
        frame::with_bytes_mut(frame_id, |b| b[0] = 0xAB);
        let slot = alloc_slot().unwrap();
        write_slot_from(slot, frame_id);
        frame::with_bytes_mut(frame_id, |b| b[0] = 0);
        read_slot_into(slot, frame_id);
        frame::with_bytes(frame_id, |b| assert_eq!(b[0], 0xAB));
    }

    #[test]
    fn allocation_is_first_fit_and_reusable() {
        test_reset();
        let a = alloc_slot().unwrap();
        let b = alloc_slot().unwrap();
        assert!(b.0 > a.0);
        free_slot(a);
        let c = alloc_slot().unwrap();
        assert_eq!(a, c);
    }
}

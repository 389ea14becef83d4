//! Page descriptor: a tagged union over {UNINIT, ANON, FILE} (§3; §9
//! REDESIGN FLAGS) carrying its own swap_in/swap_out/destroy behavior as a
//! plain `match`, replacing the source's per-type operations-table pointer.

use crate::errors::ResourceExhaustion;
use crate::hal::{AddressSpace, FileHandle};
use crate::vm::frame::{self, FrameId};
use crate::vm::swap::{self, SwapSlotId};

/// What an UNINIT page becomes on first fault, and the parameters its real
/// initializer needs (§3: "pending initializer + opaque aux + target
/// type").
#[derive(Debug, Clone, Copy)]
pub enum UninitTarget {
    Anon,
    File { handle: FileHandle, offset: u64, read_bytes: u32, zero_bytes: u32 },
}

#[derive(Debug, Clone, Copy)]
pub enum PageKind {
    Uninit(UninitTarget),
    Anon { slot: Option<SwapSlotId> },
    File { handle: FileHandle, offset: u64, read_bytes: u32, zero_bytes: u32 },
}

pub struct Page {
    pub va: u64,
    pub writable: bool,
    pub frame: Option<FrameId>,
    pub kind: PageKind,
}

impl Page {
    pub fn new_uninit(va: u64, writable: bool, target: UninitTarget) -> Self {
        Page { va, writable, frame: None, kind: PageKind::Uninit(target) }
    }

    /// Installs `frame_id` as this page's resident frame, running the
    /// appropriate data-fill: the UNINIT initializer on first touch, or a
    /// swap-in / zero-fill on every subsequent claim (§4.4).
    pub fn swap_in(&mut self, frame_id: FrameId) {
        match self.kind {
            PageKind::Uninit(UninitTarget::Anon) => {
                frame::zero(frame_id);
                self.kind = PageKind::Anon { slot: None };
            }
            PageKind::Uninit(UninitTarget::File { handle, offset, read_bytes, zero_bytes }) => {
                load_file_page(frame_id, handle, offset, read_bytes, zero_bytes);
                self.kind = PageKind::File { handle, offset, read_bytes, zero_bytes };
            }
            PageKind::Anon { slot: Some(slot) } => {
                swap::read_slot_into(slot, frame_id);
                swap::free_slot(slot);
                self.kind = PageKind::Anon { slot: None };
            }
            PageKind::Anon { slot: None } => {
                frame::zero(frame_id);
            }
            PageKind::File { handle, offset, read_bytes, zero_bytes } => {
                load_file_page(frame_id, handle, offset, read_bytes, zero_bytes);
            }
        }
        self.frame = Some(frame_id);
    }

    /// Evicts this page's frame: writes it back to swap or file as needed,
    /// unmaps it from `addr_space`, and releases it (§4.4). A no-op if the
    /// page isn't resident.
    pub fn swap_out(&mut self, addr_space: &mut dyn AddressSpace) -> Result<(), ResourceExhaustion> {
        let Some(frame_id) = self.frame else { return Ok(()) };
        match &mut self.kind {
            PageKind::Anon { slot } => {
                let new_slot = swap::alloc_slot().ok_or(ResourceExhaustion::OutOfSwap)?;
                swap::write_slot_from(new_slot, frame_id);
                *slot = Some(new_slot);
            }
            PageKind::File { handle, offset, read_bytes, .. } => {
                if addr_space.is_dirty(self.va) {
                    write_back_file_page(frame_id, *handle, *offset, *read_bytes);
                }
            }
            PageKind::Uninit(_) => {}
        }
        addr_space.unmap(self.va);
        frame::free(frame_id);
        self.frame = None;
        Ok(())
    }

    /// Process-exit/munmap teardown: same dirty-writeback rule as
    /// `swap_out` for FILE pages, then unconditionally releases whatever
    /// frame or swap slot this page is holding (§4.4 `kill`, `do_munmap`).
    pub fn destroy(&mut self, addr_space: &mut dyn AddressSpace) {
        if let PageKind::File { handle, offset, read_bytes, .. } = &self.kind {
            if let Some(frame_id) = self.frame {
                if addr_space.is_dirty(self.va) {
                    write_back_file_page(frame_id, *handle, *offset, *read_bytes);
                }
            }
        }
        if self.frame.is_some() {
            addr_space.unmap(self.va);
        }
        if let Some(frame_id) = self.frame.take() {
            frame::free(frame_id);
        }
        if let PageKind::Anon { slot: Some(s) } = self.kind {
            swap::free_slot(s);
        }
    }
}

fn load_file_page(frame_id: FrameId, handle: FileHandle, offset: u64, read_bytes: u32, zero_bytes: u32) {
    let read_bytes = read_bytes as usize;
    let zero_bytes = zero_bytes as usize;
    frame::with_bytes_mut(frame_id, |buf| {
        let n = crate::process::fs::with(|fs| fs.read_at(handle, offset, &mut buf[..read_bytes]));
        for b in &mut buf[n..read_bytes] {
            *b = 0;
        }
        for b in &mut buf[read_bytes..read_bytes + zero_bytes] {
            *b = 0;
        }
    });
}

fn write_back_file_page(frame_id: FrameId, handle: FileHandle, offset: u64, read_bytes: u32) {
    frame::with_bytes(frame_id, |buf| {
        crate::process::fs::with(|fs| {
            let _ = fs.write_at(handle, offset, &buf[..read_bytes as usize]);
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MemAddressSpace;
    use crate::thread::ThreadId;

    #[test]
    fn uninit_anon_first_touch_zeroes_frame() {
        frame::test_reset();
        let mut page = Page::new_uninit(0x1000, true, UninitTarget::Anon);
        let frame_id = frame::alloc_for(ThreadId(1), 0x1000).unwrap();
        frame::with_bytes_mut(frame_id, |b| b.fill(0xFF));
        page.swap_in(frame_id);
        frame::with_bytes(frame_id, |b| assert!(b.iter().all(|&x| x == 0)));
        assert!(matches!(page.kind, PageKind::Anon { slot: None }));
    }

    #[test]
    fn anon_swap_out_then_swap_in_round_trips_bytes() {
        frame::test_reset();
        swap::test_reset();
        let mut page = Page::new_uninit(0x2000, true, UninitTarget::Anon);
        let frame_id = frame::alloc_for(ThreadId(1), 0x2000).unwrap();
        page.swap_in(frame_id);
        frame::with_bytes_mut(frame_id, |b| b[10] = 0x42);
        let mut space = MemAddressSpace::new();
        space.map(0x2000, frame_id.0 as u64, true);
        page.swap_out(&mut space).unwrap();
        assert!(page.frame.is_none());
        assert!(matches!(page.kind, PageKind::Anon { slot: Some(_) }));

        let frame_id2 = frame::alloc_for(ThreadId(1), 0x2000).unwrap();
        page.swap_in(frame_id2);
        frame::with_bytes(frame_id2, |b| assert_eq!(b[10], 0x42));
    }
}

//! Address-space manager entry points (§4.4): the supplemental page table
//! plus the page-fault / stack-growth / fork-copy / process-teardown
//! operations built from `page.rs`/`frame.rs`/`swap.rs`/`file_backed.rs`.

pub mod file_backed;
pub mod frame;
pub mod page;
pub mod swap;

use alloc::collections::BTreeMap;

use crate::config::{PGSIZE, STACK_GROWTH_LIMIT, USER_BOUNDARY, USER_STACK_TOP};
use crate::errors::UserError;
use crate::hal::AddressSpace;
use crate::thread::ThreadId;
use page::{Page, UninitTarget};

/// Per-process supplemental page table: page-aligned virtual address →
/// `Page` (§3). A `BTreeMap` stands in for the source's hash table — both
/// are a total map over reserved user addresses.
pub struct Spt {
    pub pages: BTreeMap<u64, Page>,
}

impl Spt {
    pub fn new() -> Self {
        Spt { pages: BTreeMap::new() }
    }
}

impl Default for Spt {
    fn default() -> Self {
        Self::new()
    }
}

fn page_align(addr: u64) -> u64 {
    addr & !(PGSIZE - 1)
}

/// §4.4 `alloc_page_with_initializer`: installs a lazy UNINIT page at `va`.
/// Fails if `va` is already present.
pub fn alloc_page_with_initializer(spt: &mut Spt, va: u64, writable: bool, target: UninitTarget) -> Result<(), UserError> {
    let va = page_align(va);
    if spt.pages.contains_key(&va) {
        return Err(UserError::InvalidArgument);
    }
    spt.pages.insert(va, Page::new_uninit(va, writable, target));
    Ok(())
}

/// §4.4 `claim_page`: obtains a frame, maps it, and runs the page's
/// swap_in — the first call on an UNINIT page runs its real initializer.
pub fn claim_page(owner: ThreadId, spt: &mut Spt, addr_space: &mut dyn AddressSpace, va: u64) -> Result<(), UserError> {
    let va = page_align(va);
    let writable = spt.pages.get(&va).ok_or(UserError::BadPointer)?.writable;
    let frame_id = frame::alloc_for(owner, va).ok_or(UserError::BadPointer)?;
    let page = spt.pages.get_mut(&va).expect("checked above");
    page.swap_in(frame_id);
    addr_space.map(va, frame_id.0 as u64, writable);
    Ok(())
}

/// §4.4 page-fault entry: rejects kernel-address faults, writes to
/// read-only pages, and non-"not-present" faults outright; claims an
/// already-tracked page; otherwise grows the stack into the documented
/// window or fails.
pub fn try_handle_fault(
    owner: ThreadId,
    spt: &mut Spt,
    addr_space: &mut dyn AddressSpace,
    fault_addr: u64,
    user_rsp: u64,
    write: bool,
    not_present: bool,
) -> Result<(), UserError> {
    if fault_addr >= USER_BOUNDARY || !not_present {
        return Err(UserError::BadPointer);
    }
    let va = page_align(fault_addr);
    if let Some(page) = spt.pages.get(&va) {
        if write && !page.writable {
            return Err(UserError::BadPointer);
        }
        return claim_page(owner, spt, addr_space, va);
    }

    let stack_limit = USER_STACK_TOP.saturating_sub(STACK_GROWTH_LIMIT);
    let in_window = fault_addr > user_rsp.saturating_sub(PGSIZE)
        && fault_addr < USER_STACK_TOP
        && fault_addr > stack_limit;
    if !in_window {
        return Err(UserError::BadPointer);
    }

    let bottom = page_align(fault_addr);
    let top = page_align(USER_STACK_TOP - PGSIZE);
    let mut va = bottom;
    while va <= top {
        if !spt.pages.contains_key(&va) {
            alloc_page_with_initializer(spt, va, true, UninitTarget::Anon)?;
        }
        va += PGSIZE;
    }
    claim_page(owner, spt, addr_space, bottom)
}

/// §4.4 `copy`: duplicates every SPT entry from `src` into `dst` — UNINIT
/// and FILE entries re-install their initializer lazily; already-resident
/// ANON entries get a fresh frame with the source's bytes copied in. Used
/// by fork.
pub fn copy(
    dst_owner: ThreadId,
    dst_spt: &mut Spt,
    dst_addr_space: &mut dyn AddressSpace,
    src_spt: &Spt,
) -> bool {
    for (&va, page) in src_spt.pages.iter() {
        let target = match page.kind {
            page::PageKind::Uninit(t) => t,
            page::PageKind::File { handle, offset, read_bytes, zero_bytes } => {
                UninitTarget::File { handle, offset, read_bytes, zero_bytes }
            }
            page::PageKind::Anon { .. } => UninitTarget::Anon,
        };
        if alloc_page_with_initializer(dst_spt, va, page.writable, target).is_err() {
            return false;
        }
        if let Some(src_frame) = page.frame {
            if claim_page(dst_owner, dst_spt, dst_addr_space, va).is_err() {
                return false;
            }
            let bytes = frame::snapshot(src_frame);
            if let Some(dst_frame) = dst_spt.pages.get(&va).and_then(|p| p.frame) {
                frame::restore(dst_frame, &bytes);
            }
        }
    }
    true
}

/// Copies `len` bytes starting at `va` out of the process's address space
/// into a fresh kernel buffer, claiming a frame for any page along the way
/// that is tracked but not yet resident. Used by the syscall layer to read
/// user-supplied buffers (§4.6).
pub fn copy_from_user(owner: ThreadId, spt: &mut Spt, addr_space: &mut dyn AddressSpace, va: u64, len: usize) -> Option<alloc::vec::Vec<u8>> {
    let mut out = alloc::vec![0u8; len];
    let mut remaining = len;
    let mut cur = va;
    let mut written = 0usize;
    while remaining > 0 {
        let page_va = page_align(cur);
        if !spt.pages.contains_key(&page_va) {
            return None;
        }
        if spt.pages.get(&page_va).unwrap().frame.is_none() {
            claim_page(owner, spt, addr_space, page_va).ok()?;
        }
        let frame_id = spt.pages.get(&page_va).unwrap().frame.unwrap();
        let in_page_off = (cur - page_va) as usize;
        let chunk = remaining.min(PGSIZE as usize - in_page_off);
        frame::with_bytes(frame_id, |buf| {
            out[written..written + chunk].copy_from_slice(&buf[in_page_off..in_page_off + chunk]);
        });
        written += chunk;
        remaining -= chunk;
        cur += chunk as u64;
    }
    Some(out)
}

/// Writes `data` into the process's address space starting at `va`,
/// claiming frames for tracked-but-absent pages along the way. Fails (and
/// writes nothing further) the first time it reaches an address with no
/// SPT entry or a read-only page (§4.6).
pub fn copy_to_user(owner: ThreadId, spt: &mut Spt, addr_space: &mut dyn AddressSpace, va: u64, data: &[u8]) -> bool {
    let mut remaining = data.len();
    let mut cur = va;
    let mut read = 0usize;
    while remaining > 0 {
        let page_va = page_align(cur);
        match spt.pages.get(&page_va) {
            Some(p) if p.writable => {}
            _ => return false,
        }
        if spt.pages.get(&page_va).unwrap().frame.is_none() && claim_page(owner, spt, addr_space, page_va).is_err() {
            return false;
        }
        let frame_id = spt.pages.get(&page_va).unwrap().frame.unwrap();
        let in_page_off = (cur - page_va) as usize;
        let chunk = remaining.min(PGSIZE as usize - in_page_off);
        frame::with_bytes_mut(frame_id, |buf| {
            buf[in_page_off..in_page_off + chunk].copy_from_slice(&data[read..read + chunk]);
        });
        addr_space.map(page_va, frame_id.0 as u64, true);
        read += chunk;
        remaining -= chunk;
        cur += chunk as u64;
    }
    true
}

/// §4.4 `kill`: destroys every page (triggering writeback where needed) and
/// clears the table. Used at process exit and, per-page, by munmap.
pub fn kill(spt: &mut Spt, addr_space: &mut dyn AddressSpace) {
    for page in spt.pages.values_mut() {
        page.destroy(addr_space);
    }
    spt.pages.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MemAddressSpace;

    const OWNER: ThreadId = ThreadId(1);

    #[test]
    fn fault_on_tracked_uninit_page_claims_it() {
        frame::test_reset();
        let mut spt = Spt::new();
        let mut space = MemAddressSpace::new();
        alloc_page_with_initializer(&mut spt, 0x4000, true, UninitTarget::Anon).unwrap();
        try_handle_fault(OWNER, &mut spt, &mut space, 0x4000, 0x4000, false, true).unwrap();
        assert!(space.translate(0x4000).is_some());
    }

    #[test]
    fn fault_within_stack_growth_window_allocates_and_maps() {
        frame::test_reset();
        let mut spt = Spt::new();
        let mut space = MemAddressSpace::new();
        let rsp = USER_STACK_TOP - 16;
        let fault_addr = USER_STACK_TOP - 20;
        try_handle_fault(OWNER, &mut spt, &mut space, fault_addr, rsp, true, true).unwrap();
        assert!(space.translate(page_align(USER_STACK_TOP - PGSIZE)).is_some());
    }

    #[test]
    fn fault_outside_stack_growth_window_fails() {
        frame::test_reset();
        let mut spt = Spt::new();
        let mut space = MemAddressSpace::new();
        let rsp = USER_STACK_TOP - 16;
        let fault_addr = USER_STACK_TOP - 2 * PGSIZE - 16;
        assert!(try_handle_fault(OWNER, &mut spt, &mut space, fault_addr, rsp, true, true).is_err());
    }

    #[test]
    fn fault_exactly_one_page_below_rsp_fails() {
        frame::test_reset();
        let mut spt = Spt::new();
        let mut space = MemAddressSpace::new();
        let rsp = USER_STACK_TOP - 16;
        let fault_addr = rsp - PGSIZE;
        assert!(try_handle_fault(OWNER, &mut spt, &mut space, fault_addr, rsp, true, true).is_err());
    }

    #[test]
    fn write_fault_on_read_only_page_fails() {
        frame::test_reset();
        let mut spt = Spt::new();
        let mut space = MemAddressSpace::new();
        alloc_page_with_initializer(&mut spt, 0x5000, false, UninitTarget::Anon).unwrap();
        assert!(try_handle_fault(OWNER, &mut spt, &mut space, 0x5000, 0x5000, true, true).is_err());
    }

    #[test]
    fn copy_duplicates_resident_anon_page_contents_independently() {
        frame::test_reset();
        let mut src_spt = Spt::new();
        let mut src_space = MemAddressSpace::new();
        alloc_page_with_initializer(&mut src_spt, 0x6000, true, UninitTarget::Anon).unwrap();
        claim_page(OWNER, &mut src_spt, &mut src_space, 0x6000).unwrap();
        let src_frame = src_spt.pages.get(&0x6000).unwrap().frame.unwrap();
        frame::with_bytes_mut(src_frame, |b| b[0] = 7);

        let mut dst_spt = Spt::new();
        let mut dst_space = MemAddressSpace::new();
        assert!(copy(ThreadId(2), &mut dst_spt, &mut dst_space, &src_spt));
        let dst_frame = dst_spt.pages.get(&0x6000).unwrap().frame.unwrap();
        frame::with_bytes(dst_frame, |b| assert_eq!(b[0], 7));

        frame::with_bytes_mut(dst_frame, |b| b[0] = 9);
        frame::with_bytes(src_frame, |b| assert_eq!(b[0], 7));
    }

    #[test]
    fn kill_clears_spt_and_unmaps_every_page() {
        frame::test_reset();
        let mut spt = Spt::new();
        let mut space = MemAddressSpace::new();
        alloc_page_with_initializer(&mut spt, 0x7000, true, UninitTarget::Anon).unwrap();
        claim_page(OWNER, &mut spt, &mut space, 0x7000).unwrap();
        kill(&mut spt, &mut space);
        assert!(spt.pages.is_empty());
        assert!(space.translate(0x7000).is_none());
    }
}

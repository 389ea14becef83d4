//! Memory-mapped files (§4.4 `do_mmap`/`do_munmap`, §10 supplemented
//! feature 3): installs a run of lazy FILE pages over an open file, and
//! tears one down page-by-page on unmap, writing back whichever pages a
//! write actually touched.

use crate::config::{PGSIZE, USER_STACK_TOP};
use crate::errors::UserError;
use crate::hal::{AddressSpace, FileHandle};
use crate::vm::page::UninitTarget;
use crate::vm::{alloc_page_with_initializer, Spt};

fn page_align(addr: u64) -> u64 {
    addr & !(PGSIZE - 1)
}

/// Maps `length` bytes of the file already open as `handle`, starting at
/// `offset`, into the calling process's address space at `va` (§4.4/§4.6).
/// `va`, `length`, and `offset` must all be page-aligned; `length` must be
/// nonzero; `va` must be nonzero and must not land in the user stack's
/// region. The mapping is installed as a run of lazy FILE pages, one
/// `alloc_page_with_initializer` per page, rolled back entirely if any page
/// in the run is already occupied. The caller keeps `handle` open for the
/// life of the mapping — `do_mmap` never closes it, matching
/// `do_munmap`'s writeback-only teardown.
pub fn do_mmap(spt: &mut Spt, va: u64, length: u64, writable: bool, handle: FileHandle, offset: u64) -> Result<u64, UserError> {
    if va == 0 || va != page_align(va) || length == 0 || offset != page_align(offset) {
        return Err(UserError::InvalidArgument);
    }
    let page_span = (length + PGSIZE - 1) & !(PGSIZE - 1);
    if va >= USER_STACK_TOP.saturating_sub(page_span) {
        return Err(UserError::InvalidArgument);
    }
    let file_len = crate::process::fs::with(|fs| fs.length(handle));
    if offset >= file_len && file_len > 0 {
        return Err(UserError::InvalidArgument);
    }

    let mut installed: alloc::vec::Vec<u64> = alloc::vec::Vec::new();
    let mut page_va = va;
    let mut remaining = length;
    let mut off = offset;
    let result = (|| {
        while remaining > 0 {
            let file_remaining = file_len.saturating_sub(off);
            let this_len = remaining.min(PGSIZE).min(file_remaining);
            let read_bytes = this_len as u32;
            let zero_bytes = (PGSIZE - this_len) as u32;
            alloc_page_with_initializer(
                spt,
                page_va,
                writable,
                UninitTarget::File { handle, offset: off, read_bytes, zero_bytes },
            )?;
            installed.push(page_va);
            page_va += PGSIZE;
            off += this_len;
            remaining = remaining.saturating_sub(PGSIZE);
        }
        Ok(())
    })();

    if result.is_err() {
        for v in installed {
            spt.pages.remove(&v);
        }
        return Err(UserError::InvalidArgument);
    }
    Ok(va)
}

/// Unmaps the mapping starting at `va`: walks pages from `va` in `PGSIZE`
/// steps, destroying each (which writes back dirty FILE pages, §4.4) until
/// the first address with no SPT entry — the end of this mapping's run.
pub fn do_munmap(spt: &mut Spt, addr_space: &mut dyn AddressSpace, va: u64) {
    let mut page_va = page_align(va);
    while let Some(mut page) = spt.pages.remove(&page_va) {
        page.destroy(addr_space);
        page_va += PGSIZE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MemAddressSpace;
    use crate::thread::ThreadId;
    use crate::vm::{claim_page, frame};

    fn setup_fs(path: &str, data: &[u8]) {
        use crate::hal::MemFileStore;
        let mut store = MemFileStore::new();
        store.seed(path, data);
        crate::process::fs::init(alloc::boxed::Box::new(store));
    }

    #[test]
    fn mmap_installs_one_page_per_chunk_with_tail_zero_fill() {
        crate::process::fs::test_reset();
        frame::test_reset();
        setup_fs("prog.dat", &[7u8; 10]);
        let handle = crate::process::fs::with(|fs| fs.open("prog.dat")).unwrap();
        let mut spt = crate::vm::Spt::new();
        let va = do_mmap(&mut spt, 0x8000, 10, true, handle, 0).unwrap();
        assert_eq!(va, 0x8000);
        assert_eq!(spt.pages.len(), 1);

        let mut space = MemAddressSpace::new();
        claim_page(ThreadId(1), &mut spt, &mut space, 0x8000).unwrap();
        let frame_id = spt.pages.get(&0x8000).unwrap().frame.unwrap();
        frame::with_bytes(frame_id, |b| {
            assert!(b[..10].iter().all(|&x| x == 7));
            assert!(b[10..].iter().all(|&x| x == 0));
        });
    }

    #[test]
    fn munmap_writes_back_dirty_page_and_clears_spt() {
        crate::process::fs::test_reset();
        frame::test_reset();
        setup_fs("data.bin", &[0u8; 4096]);
        let handle = crate::process::fs::with(|fs| fs.open("data.bin")).unwrap();
        let mut spt = crate::vm::Spt::new();
        do_mmap(&mut spt, 0x9000, 4096, true, handle, 0).unwrap();
        let mut space = MemAddressSpace::new();
        claim_page(ThreadId(1), &mut spt, &mut space, 0x9000).unwrap();
        let frame_id = spt.pages.get(&0x9000).unwrap().frame.unwrap();
        frame::with_bytes_mut(frame_id, |b| b[0] = 99);
        space.touch_write(0x9000);

        do_munmap(&mut spt, &mut space, 0x9000);
        assert!(spt.pages.is_empty());

        let handle = crate::process::fs::with(|fs| fs.open("data.bin")).unwrap();
        let mut buf = [0u8; 1];
        crate::process::fs::with(|fs| fs.read_at(handle, 0, &mut buf));
        assert_eq!(buf[0], 99);
    }

    #[test]
    fn mmap_rejects_zero_length_and_misaligned_offset() {
        crate::process::fs::test_reset();
        frame::test_reset();
        setup_fs("f.bin", &[1u8; 4096]);
        let handle = crate::process::fs::with(|fs| fs.open("f.bin")).unwrap();
        let mut spt = crate::vm::Spt::new();
        assert!(do_mmap(&mut spt, 0xa000, 0, true, handle, 0).is_err());
        assert!(do_mmap(&mut spt, 0xa000, 4096, true, handle, 10).is_err());
    }

    #[test]
    fn mmap_at_offset_reads_tail_of_file() {
        crate::process::fs::test_reset();
        frame::test_reset();
        setup_fs("f2.bin", &[5u8; 4096 + 10]);
        let handle = crate::process::fs::with(|fs| fs.open("f2.bin")).unwrap();
        let mut spt = crate::vm::Spt::new();
        let va = do_mmap(&mut spt, 0xb000, 10, true, handle, 4096).unwrap();
        assert_eq!(va, 0xb000);
        let mut space = MemAddressSpace::new();
        claim_page(ThreadId(1), &mut spt, &mut space, 0xb000).unwrap();
        let frame_id = spt.pages.get(&0xb000).unwrap().frame.unwrap();
        frame::with_bytes(frame_id, |b| {
            assert!(b[..10].iter().all(|&x| x == 5));
            assert!(b[10..].iter().all(|&x| x == 0));
        });
    }
}

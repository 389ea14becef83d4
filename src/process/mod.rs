//! §4.5 — the POSIX-like process layer built on top of a `Thread` whose
//! `user` field is populated. Grounded on the teacher's `process` module
//! (fork/exec/wait wired straight into `scheduler::task`), generalized to a
//! real open-file table and demand-paged address space.

pub mod elf;
pub mod exec;
pub mod fork;
pub mod wait;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::config::FDT_MAX;
use crate::errors::ResourceExhaustion;
use crate::hal::{AddressSpace, FileHandle, FileStore};
use crate::thread::ThreadId;
use crate::vm::Spt;

/// Parent/child exit-status handoff (§4.5 `wait`). No embedded semaphore:
/// the parent is woken by direct `ThreadId`, the same simplification
/// `sync::condvar` makes, and for the same reason — it is never correct to
/// block while holding the `Mutex` guard a waker would need to re-acquire
/// to post the wakeup.
pub struct ChildStatus {
    pub child_id: ThreadId,
    pub exit_status: i32,
    pub has_exited: bool,
    pub waited: bool,
    pub fork_failed: bool,
    pub waiting_parent: Option<ThreadId>,
}

impl ChildStatus {
    pub fn new(child_id: ThreadId) -> Self {
        ChildStatus {
            child_id,
            exit_status: -1,
            has_exited: false,
            waited: false,
            fork_failed: false,
            waiting_parent: None,
        }
    }
}

/// Per-process open-file table: syscall fd (>= 2; 0/1 are reserved for
/// stdin/stdout and never enter this table) → store handle plus the fd's
/// own read/write cursor (§4.6 `seek`/`tell`; `read`/`write` advance it).
pub struct FdTable {
    slots: [Option<(FileHandle, u64)>; FDT_MAX],
}

impl FdTable {
    pub fn new() -> Self {
        FdTable { slots: [None; FDT_MAX] }
    }

    /// Lowest free fd at or above 2, §4.5/§6. Cursor starts at 0.
    pub fn insert(&mut self, handle: FileHandle) -> Result<i32, ResourceExhaustion> {
        let idx = self.slots.iter().position(|s| s.is_none()).ok_or(ResourceExhaustion::FdTableFull)?;
        self.slots[idx] = Some((handle, 0));
        Ok(idx as i32 + 2)
    }

    /// Installs `handle` at an explicit fd with the given starting cursor —
    /// used by `fork` to duplicate a parent's open files (§4.5: "independent
    /// cursors on the same inode", starting from the parent's position at
    /// fork time).
    pub fn insert_at(&mut self, fd: i32, handle: FileHandle, cursor: u64) -> bool {
        let Some(idx) = fd.checked_sub(2) else { return false };
        let Some(slot) = self.slots.get_mut(idx as usize) else { return false };
        *slot = Some((handle, cursor));
        true
    }

    pub fn get(&self, fd: i32) -> Option<FileHandle> {
        let idx = fd.checked_sub(2)?;
        self.slots.get(idx as usize).copied().flatten().map(|(h, _)| h)
    }

    pub fn cursor(&self, fd: i32) -> Option<u64> {
        let idx = fd.checked_sub(2)?;
        self.slots.get(idx as usize).copied().flatten().map(|(_, c)| c)
    }

    pub fn set_cursor(&mut self, fd: i32, cursor: u64) {
        if let Some(idx) = fd.checked_sub(2) {
            if let Some(Some((_, c))) = self.slots.get_mut(idx as usize) {
                *c = cursor;
            }
        }
    }

    pub fn remove(&mut self, fd: i32) -> Option<FileHandle> {
        let idx = fd.checked_sub(2)?;
        self.slots.get_mut(idx as usize).and_then(|s| s.take()).map(|(h, _)| h)
    }

    /// `(fd, handle, cursor)` for every occupied slot — used by `fork` to
    /// duplicate the whole table.
    pub fn all_entries(&self) -> Vec<(i32, FileHandle, u64)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|(h, c)| (i as i32 + 2, h, c)))
            .collect()
    }

    pub fn all_open(&self) -> Vec<FileHandle> {
        self.slots.iter().filter_map(|s| s.map(|(h, _)| h)).collect()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The user-process half of a `Thread` (§3/§4.5): address space, demand
/// paging metadata, open files, and the fork/wait bookkeeping the parent
/// and child share through `Arc<Mutex<ChildStatus>>`.
pub struct ProcessImage {
    pub addr_space: Box<dyn AddressSpace>,
    pub spt: Spt,
    pub fd_table: FdTable,
    pub exit_status: i32,
    pub executable: Option<FileHandle>,
    /// Status records for every child this process has spawned, kept until
    /// `wait` consumes them.
    pub children: Vec<Arc<Mutex<ChildStatus>>>,
    /// This process's own status record, shared with its parent, if any.
    pub child_info: Option<Arc<Mutex<ChildStatus>>>,
}

impl ProcessImage {
    pub fn new(addr_space: Box<dyn AddressSpace>) -> Self {
        ProcessImage {
            addr_space,
            spt: Spt::new(),
            fd_table: FdTable::new(),
            exit_status: -1,
            executable: None,
            children: Vec::new(),
            child_info: None,
        }
    }
}

/// Releases everything a dead process was holding: its mapped pages and
/// frames/swap slots (open fds are already closed by `wait::exit` before
/// this runs; see §4.5). Called by the scheduler's reaper once a DYING
/// thread's context is no longer live.
pub fn reap_resources(mut user: ProcessImage) {
    crate::vm::kill(&mut user.spt, user.addr_space.as_mut());
}

/// The on-disk file store every process's `FileStore` operations go
/// through (§3 AMBIENT: kept fully opaque, per spec.md's excluded
/// file-system-format collaborator).
pub mod fs {
    use super::*;
    use lazy_static::lazy_static;

    lazy_static! {
        static ref FS: Mutex<Option<Box<dyn FileStore>>> = Mutex::new(None);
    }

    /// Installs the backing file store. Call once at boot (or once per test
    /// setup).
    pub fn init(store: Box<dyn FileStore>) {
        *FS.lock() = Some(store);
    }

    #[cfg(test)]
    pub fn test_reset() {
        *FS.lock() = None;
    }

    /// Runs `f` against the installed store. Panics if none is installed —
    /// every code path that reaches here runs after boot/test setup.
    pub fn with<R>(f: impl FnOnce(&mut dyn FileStore) -> R) -> R {
        let mut guard = FS.lock();
        let store = guard.as_mut().expect("file store not initialized");
        f(store.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MemFileStore;

    #[test]
    fn fd_table_assigns_lowest_free_slot_starting_at_two() {
        let mut t = FdTable::new();
        let a = t.insert(FileHandle(1)).unwrap();
        let b = t.insert(FileHandle(2)).unwrap();
        assert_eq!(a, 2);
        assert_eq!(b, 3);
        t.remove(a);
        let c = t.insert(FileHandle(3)).unwrap();
        assert_eq!(c, 2);
    }

    #[test]
    fn fd_table_rejects_unknown_fd() {
        let t = FdTable::new();
        assert!(t.get(2).is_none());
        assert!(t.get(0).is_none());
    }

    #[test]
    fn fd_table_full_returns_resource_exhaustion() {
        let mut t = FdTable::new();
        for _ in 0..FDT_MAX {
            t.insert(FileHandle(1)).unwrap();
        }
        assert_eq!(t.insert(FileHandle(1)), Err(ResourceExhaustion::FdTableFull));
    }

    #[test]
    fn fs_with_reaches_installed_store() {
        fs::test_reset();
        let mut store = MemFileStore::new();
        store.seed("a.txt", b"hi");
        fs::init(Box::new(store));
        let len = fs::with(|fs| {
            let h = fs.open("a.txt").unwrap();
            fs.length(h)
        });
        assert_eq!(len, 2);
        fs::test_reset();
    }
}

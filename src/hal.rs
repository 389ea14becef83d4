//! Traits standing in for the hardware and on-disk collaborators a bootable
//! kernel would supply: console I/O, a block device, and an opaque
//! byte-addressable file store. A real kernel binary implements these over
//! actual hardware; tests implement them over in-memory buffers.

use alloc::string::String;
use alloc::vec::Vec;

use crate::errors::{LoadError, ResourceExhaustion};

/// Minimal character console. Buffered output only — no line editing or
/// scrollback, that belongs to the excluded CLI/TUI collaborator.
pub trait ConsoleDevice: Send {
    fn write_str(&mut self, s: &str);
}

/// Stand-in for the MMU: install/remove a single page-aligned mapping and
/// read/clear the accessed and dirty bits the clock-algorithm evictor and
/// the file-backed swap-out path need. A real kernel binary implements this
/// over `x86_64::structures::paging::OffsetPageTable`; tests implement it
/// over a plain hash map so eviction/fault logic can run on the host.
pub trait AddressSpace: Send {
    /// Install `va -> pa` (both page-aligned), creating intermediate paging
    /// structures as needed. Overwrites any existing mapping at `va`.
    fn map(&mut self, va: u64, pa: u64, writable: bool);
    /// Remove the mapping at `va`, if any.
    fn unmap(&mut self, va: u64);
    /// Physical address currently mapped at `va`, if resident.
    fn translate(&self, va: u64) -> Option<u64>;
    fn is_accessed(&self, va: u64) -> bool;
    fn clear_accessed(&mut self, va: u64);
    fn is_dirty(&self, va: u64) -> bool;
    fn clear_dirty(&mut self, va: u64);
}

/// Sector-addressed backing store for the swap area. One "page" here is
/// always exactly `config::PGSIZE` bytes regardless of the device's native
/// sector size; the implementor is responsible for that translation.
pub trait BlockDevice: Send {
    /// Total number of `PGSIZE`-sized slots available.
    fn slot_count(&self) -> usize;
    fn read_slot(&mut self, slot: usize, buf: &mut [u8]);
    fn write_slot(&mut self, slot: usize, buf: &[u8]);
}

/// Opaque handle into a `FileStore`. Stores never interpret it; it is
/// whatever the implementation needs to find the file again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle(pub u64);

/// Stand-in for "the on-disk file-system format", which spec.md explicitly
/// keeps opaque: open/read/write/seek/length/close/remove/create, nothing
/// about directory structure or allocation. Implementations hold their own
/// read/write-deny bookkeeping.
pub trait FileStore: Send {
    fn open(&mut self, path: &str) -> Result<FileHandle, LoadError>;
    fn create(&mut self, path: &str) -> Result<FileHandle, LoadError>;
    fn close(&mut self, handle: FileHandle);
    fn length(&self, handle: FileHandle) -> u64;
    fn read_at(&mut self, handle: FileHandle, offset: u64, buf: &mut [u8]) -> usize;
    fn write_at(&mut self, handle: FileHandle, offset: u64, buf: &[u8]) -> Result<usize, ResourceExhaustion>;
    fn remove(&mut self, path: &str) -> Result<(), LoadError>;
    /// Executables stay open read-only for the life of the running process;
    /// reject further writers until `allow_write` is called on exit.
    fn deny_write(&mut self, handle: FileHandle);
    fn allow_write(&mut self, handle: FileHandle);
}

/// Trivial in-memory `FileStore`, used by unit tests in place of a real
/// on-disk implementation.
pub struct MemFileStore {
    files: Vec<(String, Vec<u8>, u32)>,
    next_handle: u64,
    open_by_handle: Vec<(FileHandle, usize)>,
}

impl MemFileStore {
    pub fn new() -> Self {
        Self { files: Vec::new(), next_handle: 1, open_by_handle: Vec::new() }
    }

    pub fn seed(&mut self, path: &str, data: &[u8]) {
        self.files.push((String::from(path), Vec::from(data), 0));
    }

    fn index_of(&self, path: &str) -> Option<usize> {
        self.files.iter().position(|(p, _, _)| p == path)
    }

    fn index_of_handle(&self, handle: FileHandle) -> Option<usize> {
        self.open_by_handle.iter().find(|(h, _)| *h == handle).map(|(_, i)| *i)
    }
}

impl FileStore for MemFileStore {
    fn open(&mut self, path: &str) -> Result<FileHandle, LoadError> {
        let idx = self.index_of(path).ok_or(LoadError::FileNotFound)?;
        let handle = FileHandle(self.next_handle);
        self.next_handle += 1;
        self.open_by_handle.push((handle, idx));
        Ok(handle)
    }

    fn create(&mut self, path: &str) -> Result<FileHandle, LoadError> {
        if self.index_of(path).is_none() {
            self.files.push((String::from(path), Vec::new(), 0));
        }
        self.open(path)
    }

    fn close(&mut self, handle: FileHandle) {
        self.open_by_handle.retain(|(h, _)| *h != handle);
    }

    fn length(&self, handle: FileHandle) -> u64 {
        match self.index_of_handle(handle) {
            Some(idx) => self.files[idx].1.len() as u64,
            None => 0,
        }
    }

    fn read_at(&mut self, handle: FileHandle, offset: u64, buf: &mut [u8]) -> usize {
        let Some(idx) = self.index_of_handle(handle) else { return 0 };
        let data = &self.files[idx].1;
        let offset = offset as usize;
        if offset >= data.len() {
            return 0;
        }
        let n = core::cmp::min(buf.len(), data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    fn write_at(&mut self, handle: FileHandle, offset: u64, buf: &[u8]) -> Result<usize, ResourceExhaustion> {
        let Some(idx) = self.index_of_handle(handle) else { return Ok(0) };
        if self.files[idx].2 > 0 {
            return Ok(0);
        }
        let data = &mut self.files[idx].1;
        let offset = offset as usize;
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn remove(&mut self, path: &str) -> Result<(), LoadError> {
        let idx = self.index_of(path).ok_or(LoadError::FileNotFound)?;
        self.files.remove(idx);
        Ok(())
    }

    fn deny_write(&mut self, handle: FileHandle) {
        if let Some(idx) = self.index_of_handle(handle) {
            self.files[idx].2 += 1;
        }
    }

    fn allow_write(&mut self, handle: FileHandle) {
        if let Some(idx) = self.index_of_handle(handle) {
            if self.files[idx].2 > 0 {
                self.files[idx].2 -= 1;
            }
        }
    }
}

/// In-memory `AddressSpace` double for unit tests: a page map plus per-page
/// accessed/dirty bits, no real MMU involved.
pub struct MemAddressSpace {
    mappings: Vec<(u64, u64, bool)>, // (va, pa, writable)
    accessed: Vec<u64>,
    dirty: Vec<u64>,
}

impl MemAddressSpace {
    pub fn new() -> Self {
        Self { mappings: Vec::new(), accessed: Vec::new(), dirty: Vec::new() }
    }

    fn index_of(&self, va: u64) -> Option<usize> {
        self.mappings.iter().position(|(v, _, _)| *v == va)
    }

    /// Test hook: mark `va` written (sets the dirty bit), as real hardware
    /// would on a store instruction.
    pub fn touch_write(&mut self, va: u64) {
        if !self.dirty.contains(&va) {
            self.dirty.push(va);
        }
        self.touch_read(va);
    }

    /// Test hook: mark `va` accessed, as real hardware would on any load.
    pub fn touch_read(&mut self, va: u64) {
        if !self.accessed.contains(&va) {
            self.accessed.push(va);
        }
    }
}

impl AddressSpace for MemAddressSpace {
    fn map(&mut self, va: u64, pa: u64, writable: bool) {
        match self.index_of(va) {
            Some(i) => self.mappings[i] = (va, pa, writable),
            None => self.mappings.push((va, pa, writable)),
        }
    }

    fn unmap(&mut self, va: u64) {
        self.mappings.retain(|(v, _, _)| *v != va);
        self.accessed.retain(|v| *v != va);
        self.dirty.retain(|v| *v != va);
    }

    fn translate(&self, va: u64) -> Option<u64> {
        self.index_of(va).map(|i| self.mappings[i].1)
    }

    fn is_accessed(&self, va: u64) -> bool {
        self.accessed.contains(&va)
    }

    fn clear_accessed(&mut self, va: u64) {
        self.accessed.retain(|v| *v != va);
    }

    fn is_dirty(&self, va: u64) -> bool {
        self.dirty.contains(&va)
    }

    fn clear_dirty(&mut self, va: u64) {
        self.dirty.retain(|v| *v != va);
    }
}

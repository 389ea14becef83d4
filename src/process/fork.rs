//! §4.5 `fork`. Duplicates the calling process's address space, SPT, and
//! open-file table into a freshly created child thread, and hands the
//! caller back a `ChildStatus` record to `wait` on later.
//!
//! Simplification over a from-scratch hardware kernel (recorded in
//! DESIGN.md): fd-table duplication copies the `FileHandle` values
//! directly rather than reopening each path (the same underlying store
//! handle is shared), while each fd's cursor is duplicated by value so
//! parent and child read/write independently from that point on, matching
//! §4.5's "independent cursors on the same inode". The syscall layer is
//! expected to ask the HAL for a blank child address space (its own
//! fresh page table) before calling `fork`, the same way a real fork
//! implementation allocates page directories before copying PTEs.

use alloc::boxed::Box;
use alloc::sync::Arc;
use spin::Mutex;

use crate::hal::AddressSpace;
use crate::process::{ChildStatus, FdTable, ProcessImage};
use crate::thread::{scheduler, ThreadId};

/// The subset of the parent's trap-time register state the child resumes
/// with: same `rip`/`rsp` as the parent's syscall instruction, `rax`
/// forced to 0 (§4.5: "the child's fork call returns 0").
pub struct TrapFrame {
    pub rip: u64,
    pub rsp: u64,
}

struct ChildBoot {
    frame: TrapFrame,
}

/// Duplicates the current process into a new child thread. Returns the
/// child's `ThreadId` to the parent (the syscall layer translates this to
/// the child's pid) or `None` if the child's resources couldn't be set up,
/// in which case the child thread (if created) is marked failed and never
/// reaches user mode.
pub fn fork(parent_frame: TrapFrame, child_addr_space: Box<dyn AddressSpace>) -> Option<ThreadId> {
    let parent = scheduler::current_id();
    let priority = scheduler::priority_of(parent);

    let boot = Box::new(ChildBoot { frame: parent_frame });
    let aux = Box::into_raw(boot) as usize;
    let child = scheduler::create("", priority, child_trampoline, aux).ok()?;

    let record = Arc::new(Mutex::new(ChildStatus::new(child)));

    let built = scheduler::with_thread(parent, |t| {
        let u = t.user.as_ref()?;
        let mut image = ProcessImage::new(child_addr_space);
        if !crate::vm::copy(child, &mut image.spt, image.addr_space.as_mut(), &u.spt) {
            return None;
        }
        let mut fd_table = FdTable::new();
        for (fd, handle, cursor) in u.fd_table.all_entries() {
            fd_table.insert_at(fd, handle, cursor);
        }
        image.fd_table = fd_table;
        image.executable = u.executable;
        image.child_info = Some(record.clone());
        Some(image)
    })
    .flatten();

    let Some(image) = built else {
        crate::process::wait::mark_fork_failed(&record);
        scheduler::with_thread_mut(child, |t| t.state = crate::thread::ThreadState::Dying);
        return None;
    };

    scheduler::with_thread_mut(child, |t| t.user = Some(image));
    scheduler::with_thread_mut(parent, |t| {
        if let Some(u) = t.user.as_mut() {
            u.children.push(record);
        }
    });

    Some(child)
}

/// Every freshly forked thread's context first resumes here (mirrors
/// `scheduler::kernel_thread_trampoline`'s r12/r13 convention, but for a
/// user-mode child the payload is a full `TrapFrame` rather than a plain
/// `(entry, aux)` pair).
extern "C" fn child_trampoline(aux: usize) -> ! {
    let boot = unsafe { Box::from_raw(aux as *mut ChildBoot) };
    resume_child(boot.frame)
}

#[cfg(all(target_arch = "x86_64", not(test)))]
fn resume_child(frame: TrapFrame) -> ! {
    // rax=0 is set by the syscall return-value convention the dispatcher
    // uses when it sees this thread was never actually inside the
    // original `syscall` instruction; see `syscall::dispatch`.
    unsafe { crate::process::exec::enter_user_mode(frame.rip, frame.rsp) }
}

#[cfg(any(not(target_arch = "x86_64"), test))]
fn resume_child(_frame: TrapFrame) -> ! {
    loop {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BootConfig;
    use crate::hal::MemAddressSpace;
    use crate::vm::{alloc_page_with_initializer, claim_page};

    extern "C" fn noop_entry(_aux: usize) -> ! {
        loop {}
    }

    #[test]
    fn fork_duplicates_resident_page_independently() {
        let _g = scheduler::test_reset();
        scheduler::init(BootConfig::default());
        crate::vm::frame::test_reset();

        let parent = scheduler::create("parent", 20, noop_entry, 0).unwrap();
        let mut parent_image = ProcessImage::new(Box::new(MemAddressSpace::new()));
        alloc_page_with_initializer(&mut parent_image.spt, 0x3000, true, crate::vm::page::UninitTarget::Anon).unwrap();
        claim_page(parent, &mut parent_image.spt, parent_image.addr_space.as_mut(), 0x3000).unwrap();
        let parent_frame = parent_image.spt.pages.get(&0x3000).unwrap().frame.unwrap();
        crate::vm::frame::with_bytes_mut(parent_frame, |b| b[0] = 42);
        scheduler::with_thread_mut(parent, |t| t.user = Some(parent_image));

        let child = fork(TrapFrame { rip: 0x1000, rsp: 0x2000 }, Box::new(MemAddressSpace::new())).unwrap();

        let child_frame = scheduler::with_thread(child, |t| t.user.as_ref().unwrap().spt.pages.get(&0x3000).unwrap().frame.unwrap()).unwrap();
        crate::vm::frame::with_bytes(child_frame, |b| assert_eq!(b[0], 42));
        crate::vm::frame::with_bytes_mut(child_frame, |b| b[0] = 99);
        crate::vm::frame::with_bytes(parent_frame, |b| assert_eq!(b[0], 42));

        let has_record = scheduler::with_thread(parent, |t| t.user.as_ref().unwrap().children.len()).unwrap();
        assert_eq!(has_record, 1);
    }
}

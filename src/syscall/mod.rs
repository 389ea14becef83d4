//! §4.6 syscall dispatch table. Grounded on the teacher's
//! `syscall::handler` match-on-number-then-validate-then-act shape,
//! generalized from a handful of console/thread calls to the full
//! file/process/mmap surface. Argument decoding from the raw trap frame
//! (§6 calling convention) is the excluded boot/trap-entry collaborator's
//! job; this module starts from already-decoded arguments.

use alloc::string::String;
use alloc::vec::Vec;

use crate::config::USER_BOUNDARY;
use crate::errors::{SyscallOutcome, UserError};
use crate::hal::FileHandle;
use crate::process::fork::TrapFrame;
use crate::thread::{scheduler, ThreadId};

/// One decoded syscall invocation (§4.6). `Ptr` fields are raw user
/// virtual addresses; this module validates them before ever dereferencing.
pub enum Syscall {
    Halt,
    Exit(i32),
    Fork(TrapFrame),
    Exec(u64),
    Wait(ThreadId),
    Create(u64, u64),
    Remove(u64),
    Open(u64),
    Filesize(i32),
    Read(i32, u64, u64),
    Write(i32, u64, u64),
    Seek(i32, u64),
    Tell(i32),
    Close(i32),
    /// `(addr, length, writable, fd, offset)`, per §4.6/§6's `mmap` ordering.
    Mmap(u64, u64, bool, i32, u64),
    Munmap(u64),
}

/// Reads a NUL-terminated string out of user memory, one page-claim at a
/// time, bailing out past a generous length cap rather than scanning
/// unbounded user input (§7: malformed input is a `UserError`, not a
/// kernel hang).
const MAX_CSTR_LEN: usize = 4096;

fn read_user_cstr(va: u64) -> Result<String, UserError> {
    if va == 0 || va >= USER_BOUNDARY {
        return Err(UserError::BadPointer);
    }
    let owner = scheduler::current_id();
    let mut bytes = Vec::new();
    for i in 0..MAX_CSTR_LEN {
        let chunk = with_process(|spt, addr_space| crate::vm::copy_from_user(owner, spt, addr_space, va + i as u64, 1))
            .ok_or(UserError::BadPointer)?;
        if chunk[0] == 0 {
            return String::from_utf8(bytes).map_err(|_| UserError::InvalidArgument);
        }
        bytes.push(chunk[0]);
    }
    Err(UserError::InvalidArgument)
}

fn read_user_buf(va: u64, len: u64) -> Result<Vec<u8>, UserError> {
    if va == 0 || va.checked_add(len).map(|e| e > USER_BOUNDARY).unwrap_or(true) {
        return Err(UserError::BadPointer);
    }
    let owner = scheduler::current_id();
    with_process(|spt, addr_space| crate::vm::copy_from_user(owner, spt, addr_space, va, len as usize)).ok_or(UserError::BadPointer)
}

fn write_user_buf(va: u64, data: &[u8]) -> Result<(), UserError> {
    if va == 0 || va.checked_add(data.len() as u64).map(|e| e > USER_BOUNDARY).unwrap_or(true) {
        return Err(UserError::BadPointer);
    }
    let owner = scheduler::current_id();
    let ok = with_process(|spt, addr_space| crate::vm::copy_to_user(owner, spt, addr_space, va, data));
    if ok { Ok(()) } else { Err(UserError::BadPointer) }
}

/// Runs `f` against the current thread's `Spt`/`AddressSpace`. Panics if
/// the current thread isn't a user process — every syscall path only runs
/// on behalf of one.
fn with_process<R>(f: impl FnOnce(&mut crate::vm::Spt, &mut dyn crate::hal::AddressSpace) -> R) -> R {
    let current = scheduler::current_id();
    scheduler::with_thread_mut(current, |t| {
        let u = t.user.as_mut().expect("syscall dispatched outside a user process");
        f(&mut u.spt, u.addr_space.as_mut())
    })
    .expect("current thread missing from arena")
}

/// §4.5 `exec`: destroys the current address space (`process_cleanup` in
/// `original_source/userprog/process.c`), parses `cmd_line`, loads the ELF
/// image into the now-empty SPT, and builds the argv stack. Returns the
/// `(entry, user_rsp)` pair the caller enters user mode at, or the load
/// error on failure. Shared by the `exec` syscall and
/// `process::exec::create_initd`'s trampoline — the latter's SPT is already
/// empty, so the `kill` there is a no-op.
pub(crate) fn exec_command(cmd_line: &str) -> Result<(u64, u64), crate::errors::LoadError> {
    let current = scheduler::current_id();
    with_process(|spt, addr_space| crate::vm::kill(spt, addr_space));
    let (entry, handle) = with_process(|spt, _| crate::process::exec::load_elf(spt, cmd_line))?;
    let argv = crate::process::exec::parse_argv(cmd_line);
    let sp = with_process(|spt, addr_space| crate::process::exec::build_user_stack(current, spt, addr_space, &argv))?;
    scheduler::with_thread_mut(current, |t| {
        if let Some(u) = t.user.as_mut() {
            u.executable = Some(handle);
        }
    });
    Ok((entry, sp))
}

fn current_fd_op<R>(fd: i32, f: impl FnOnce(FileHandle) -> R) -> Result<R, UserError> {
    let current = scheduler::current_id();
    let handle = scheduler::with_thread(current, |t| t.user.as_ref().and_then(|u| u.fd_table.get(fd)))
        .flatten()
        .ok_or(UserError::BadFileDescriptor)?;
    Ok(f(handle))
}

fn fd_cursor(fd: i32) -> Option<u64> {
    let current = scheduler::current_id();
    scheduler::with_thread(current, |t| t.user.as_ref().and_then(|u| u.fd_table.cursor(fd))).flatten()
}

fn set_fd_cursor(fd: i32, pos: u64) {
    let current = scheduler::current_id();
    scheduler::with_thread_mut(current, |t| {
        if let Some(u) = t.user.as_mut() {
            u.fd_table.set_cursor(fd, pos);
        }
    });
}

/// §4.6: decode, validate, act. A `UserError` terminates the calling
/// process (`SyscallOutcome::Terminate`); a `ResourceExhaustion` just
/// fails the one call.
pub fn dispatch(call: Syscall) -> SyscallOutcome {
    match call {
        Syscall::Halt => {
            crate::log_info!("halt");
            SyscallOutcome::Return(0)
        }
        Syscall::Exit(status) => {
            crate::process::wait::exit(status);
        }
        Syscall::Fork(frame) => {
            let child_space = alloc::boxed::Box::new(crate::hal::MemAddressSpace::new());
            match crate::process::fork::fork(frame, child_space) {
                Some(child) => SyscallOutcome::Return(child.0 as i64),
                None => SyscallOutcome::Return(-1),
            }
        }
        Syscall::Exec(path_ptr) => match read_user_cstr(path_ptr) {
            Ok(path) => match exec_command(&path) {
                Ok((entry, sp)) => {
                    // §4.5: exec never returns to its caller on success — it
                    // falls straight into user mode via the ring-3 trampoline.
                    #[cfg(all(target_arch = "x86_64", not(test)))]
                    unsafe {
                        crate::process::exec::enter_user_mode(entry, sp)
                    }
                    #[cfg(any(not(target_arch = "x86_64"), test))]
                    {
                        let _ = (entry, sp);
                        SyscallOutcome::Return(0)
                    }
                }
                Err(_) => SyscallOutcome::Return(-1),
            },
            Err(e) => e.into(),
        },
        Syscall::Wait(pid) => SyscallOutcome::Return(crate::process::wait::wait(pid) as i64),
        Syscall::Create(path_ptr, initial_size) => match read_user_cstr(path_ptr) {
            Ok(path) => {
                let created = crate::process::fs::with(|fs| fs.create(&path));
                match created {
                    Ok(handle) => {
                        if initial_size > 0 {
                            let zeros = alloc::vec![0u8; initial_size as usize];
                            let _ = crate::process::fs::with(|fs| fs.write_at(handle, 0, &zeros));
                        }
                        crate::process::fs::with(|fs| fs.close(handle));
                        SyscallOutcome::Return(1)
                    }
                    Err(_) => SyscallOutcome::Return(0),
                }
            }
            Err(e) => e.into(),
        },
        Syscall::Remove(path_ptr) => match read_user_cstr(path_ptr) {
            Ok(path) => match crate::process::fs::with(|fs| fs.remove(&path)) {
                Ok(()) => SyscallOutcome::Return(1),
                Err(_) => SyscallOutcome::Return(0),
            },
            Err(e) => e.into(),
        },
        Syscall::Open(path_ptr) => match read_user_cstr(path_ptr) {
            Ok(path) => match crate::process::fs::with(|fs| fs.open(&path)) {
                Ok(handle) => {
                    let current = scheduler::current_id();
                    let fd = scheduler::with_thread_mut(current, |t| t.user.as_mut().unwrap().fd_table.insert(handle));
                    match fd {
                        Some(Ok(fd)) => SyscallOutcome::Return(fd as i64),
                        _ => {
                            crate::process::fs::with(|fs| fs.close(handle));
                            SyscallOutcome::Return(-1)
                        }
                    }
                }
                Err(_) => SyscallOutcome::Return(-1),
            },
            Err(e) => e.into(),
        },
        Syscall::Filesize(fd) => match current_fd_op(fd, |h| crate::process::fs::with(|fs| fs.length(h))) {
            Ok(len) => SyscallOutcome::Return(len as i64),
            Err(e) => e.into(),
        },
        Syscall::Read(fd, buf_ptr, len) => {
            if fd == 0 {
                // A real console read would pull bytes from `input_getc`
                // here, the excluded console-input collaborator; stubbed to
                // report EOF immediately.
                return SyscallOutcome::Return(0);
            }
            if fd == 1 {
                return UserError::BadFileDescriptor.into();
            }
            let Some(cursor) = fd_cursor(fd) else { return UserError::BadFileDescriptor.into() };
            let result = current_fd_op(fd, |h| {
                let mut tmp = alloc::vec![0u8; len as usize];
                let n = crate::process::fs::with(|fs| fs.read_at(h, cursor, &mut tmp));
                (tmp, n)
            });
            match result {
                Ok((tmp, n)) => match write_user_buf(buf_ptr, &tmp[..n]) {
                    Ok(()) => {
                        set_fd_cursor(fd, cursor + n as u64);
                        SyscallOutcome::Return(n as i64)
                    }
                    Err(e) => e.into(),
                },
                Err(e) => e.into(),
            }
        }
        Syscall::Write(fd, buf_ptr, len) => {
            if fd == 0 {
                return UserError::BadFileDescriptor.into();
            }
            if len == 0 {
                return SyscallOutcome::Return(0);
            }
            if fd == 1 {
                match read_user_buf(buf_ptr, len) {
                    Ok(bytes) => match String::from_utf8(bytes) {
                        Ok(s) => {
                            crate::log_info!("{}", s);
                            SyscallOutcome::Return(len as i64)
                        }
                        Err(_) => UserError::InvalidArgument.into(),
                    },
                    Err(e) => e.into(),
                }
            } else {
                // §4.6: writing to the currently executing file returns 0 —
                // the store itself enforces this via `deny_write`.
                let Some(cursor) = fd_cursor(fd) else { return UserError::BadFileDescriptor.into() };
                match read_user_buf(buf_ptr, len) {
                    Ok(bytes) => match current_fd_op(fd, |h| crate::process::fs::with(|fs| fs.write_at(h, cursor, &bytes))) {
                        Ok(Ok(n)) => {
                            set_fd_cursor(fd, cursor + n as u64);
                            SyscallOutcome::Return(n as i64)
                        }
                        Ok(Err(_)) => SyscallOutcome::Return(-1),
                        Err(e) => e.into(),
                    },
                    Err(e) => e.into(),
                }
            }
        }
        Syscall::Seek(fd, pos) => {
            set_fd_cursor(fd, pos);
            SyscallOutcome::Return(0)
        }
        Syscall::Tell(fd) => match fd_cursor(fd) {
            Some(pos) => SyscallOutcome::Return(pos as i64),
            None => UserError::BadFileDescriptor.into(),
        },
        Syscall::Close(fd) => {
            let current = scheduler::current_id();
            let handle = scheduler::with_thread_mut(current, |t| t.user.as_mut().unwrap().fd_table.remove(fd)).flatten();
            if let Some(handle) = handle {
                crate::process::fs::with(|fs| fs.close(handle));
                SyscallOutcome::Return(0)
            } else {
                UserError::BadFileDescriptor.into()
            }
        }
        Syscall::Mmap(va, length, writable, fd, offset) => match current_fd_op(fd, |h| h) {
            Ok(handle) => match with_process(|spt, _| crate::vm::file_backed::do_mmap(spt, va, length, writable, handle, offset)) {
                Ok(mapped_va) => SyscallOutcome::Return(mapped_va as i64),
                Err(_) => SyscallOutcome::Return(-1),
            },
            Err(e) => e.into(),
        },
        Syscall::Munmap(va) => {
            with_process(|spt, addr_space| crate::vm::file_backed::do_munmap(spt, addr_space, va));
            SyscallOutcome::Return(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BootConfig;
    use crate::hal::{MemAddressSpace, MemFileStore};
    use crate::process::ProcessImage;

    extern "C" fn noop_entry(_aux: usize) -> ! {
        loop {}
    }

    fn setup_process() -> ThreadId {
        scheduler::init(BootConfig::default());
        let id = scheduler::create("p", 20, noop_entry, 0).unwrap();
        scheduler::with_thread_mut(id, |t| {
            t.user = Some(ProcessImage::new(alloc::boxed::Box::new(MemAddressSpace::new())));
            t.state = crate::thread::ThreadState::Running;
        });
        scheduler::with_thread_mut(ThreadId(0), |t| t.state = crate::thread::ThreadState::Ready);
        id
    }

    #[test]
    fn close_unknown_fd_terminates() {
        let _g = scheduler::test_reset();
        setup_process();
        let outcome = dispatch(Syscall::Close(7));
        assert_eq!(outcome, SyscallOutcome::Terminate);
    }

    #[test]
    fn create_and_remove_round_trip() {
        let _g = scheduler::test_reset();
        crate::process::fs::test_reset();
        crate::process::fs::init(alloc::boxed::Box::new(MemFileStore::new()));
        let id = setup_process();
        let _ = id;

        let mut spt = crate::vm::Spt::new();
        crate::vm::alloc_page_with_initializer(&mut spt, 0x4000, true, crate::vm::page::UninitTarget::Anon).unwrap();
        scheduler::with_thread_mut(scheduler::current_id(), |t| t.user.as_mut().unwrap().spt = spt);
        let owner = scheduler::current_id();
        scheduler::with_thread_mut(owner, |t| {
            let u = t.user.as_mut().unwrap();
            crate::vm::claim_page(owner, &mut u.spt, u.addr_space.as_mut(), 0x4000).unwrap();
        });

        write_user_buf(0x4000, b"test.txt\0").unwrap();
        let outcome = dispatch(Syscall::Create(0x4000, 0));
        assert_eq!(outcome, SyscallOutcome::Return(1));
        let outcome = dispatch(Syscall::Remove(0x4000));
        assert_eq!(outcome, SyscallOutcome::Return(1));
        crate::process::fs::test_reset();
    }

    #[test]
    fn read_advances_cursor_so_repeated_reads_see_fresh_bytes() {
        let _g = scheduler::test_reset();
        crate::process::fs::test_reset();
        let mut store = MemFileStore::new();
        store.seed("data.txt", b"abcdef");
        crate::process::fs::init(alloc::boxed::Box::new(store));
        setup_process();

        let mut spt = crate::vm::Spt::new();
        crate::vm::alloc_page_with_initializer(&mut spt, 0x5000, true, crate::vm::page::UninitTarget::Anon).unwrap();
        scheduler::with_thread_mut(scheduler::current_id(), |t| t.user.as_mut().unwrap().spt = spt);
        let owner = scheduler::current_id();
        scheduler::with_thread_mut(owner, |t| {
            let u = t.user.as_mut().unwrap();
            crate::vm::claim_page(owner, &mut u.spt, u.addr_space.as_mut(), 0x5000).unwrap();
        });

        write_user_buf(0x5000, b"data.txt\0").unwrap();
        let fd = match dispatch(Syscall::Open(0x5000)) {
            SyscallOutcome::Return(fd) => fd as i32,
            other => panic!("unexpected open outcome: {:?}", other),
        };

        let first = dispatch(Syscall::Read(fd, 0x5100, 3));
        assert_eq!(first, SyscallOutcome::Return(3));
        assert_eq!(read_user_buf(0x5100, 3).unwrap(), b"abc");
        assert_eq!(fd_cursor(fd), Some(3));

        let second = dispatch(Syscall::Read(fd, 0x5100, 3));
        assert_eq!(second, SyscallOutcome::Return(3));
        assert_eq!(read_user_buf(0x5100, 3).unwrap(), b"def");

        let tell = dispatch(Syscall::Tell(fd));
        assert_eq!(tell, SyscallOutcome::Return(6));

        dispatch(Syscall::Seek(fd, 1));
        assert_eq!(fd_cursor(fd), Some(1));

        crate::process::fs::test_reset();
    }
}

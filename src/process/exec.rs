//! ELF loading and user-stack construction (§4.5 `exec`, §6 layout).
//! Grounded on the teacher's `process::load`/`setup_stack`, generalized
//! from "copy bytes straight into the one already-mapped stack frame" to
//! "install lazy FILE pages for every loadable segment, then reach into
//! the frame table directly to build argv" since nothing here goes through
//! `AddressSpace`'s byte-level API (it has none — only mapping/bits).

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use crate::config::{PGSIZE, PRI_DEFAULT, USER_STACK_TOP};
use crate::errors::{LoadError, ResourceExhaustion};
use crate::hal::{AddressSpace, FileHandle};
use crate::process::elf::{self, Phdr};
use crate::process::ProcessImage;
use crate::thread::{scheduler, ThreadId};
use crate::vm::page::UninitTarget;
use crate::vm::{alloc_page_with_initializer, claim_page, frame, Spt};

/// Splits a command line into words on ASCII whitespace (§6). No quoting
/// or escaping — that belongs to the excluded shell collaborator.
pub fn parse_argv(cmd_line: &str) -> Vec<String> {
    cmd_line.split_whitespace().map(String::from).collect()
}

fn page_align(addr: u64) -> u64 {
    addr & !(PGSIZE - 1)
}

/// Payload carried through `scheduler::create`'s `usize aux` slot to
/// `initd_trampoline`: the command line to exec, and the blank address
/// space the caller (the excluded boot collaborator) allocated for it —
/// the same handoff `fork::ChildBoot` uses for a forked child.
struct InitdBoot {
    command: String,
    addr_space: Box<dyn AddressSpace>,
}

/// §4.5 `create_initd`: spawns a kernel thread whose entry point installs a
/// fresh `ProcessImage` and execs `command` — the first user process the
/// boot collaborator starts. Returns the new thread's id immediately; the
/// thread itself runs `exec` asynchronously once scheduled.
pub fn create_initd(command: &str, addr_space: Box<dyn AddressSpace>) -> Result<ThreadId, ResourceExhaustion> {
    let boot = Box::new(InitdBoot { command: String::from(command), addr_space });
    let aux = Box::into_raw(boot) as usize;
    scheduler::create(command, PRI_DEFAULT, initd_trampoline, aux).map_err(|_| ResourceExhaustion::OutOfMemory)
}

extern "C" fn initd_trampoline(aux: usize) -> ! {
    let boot = unsafe { Box::from_raw(aux as *mut InitdBoot) };
    let InitdBoot { command, addr_space } = *boot;
    let current = scheduler::current_id();
    scheduler::with_thread_mut(current, |t| t.user = Some(ProcessImage::new(addr_space)));

    let loaded = crate::syscall::exec_command(&command);
    match loaded {
        Ok((entry, sp)) => {
            #[cfg(all(target_arch = "x86_64", not(test)))]
            unsafe {
                enter_user_mode(entry, sp)
            }
            #[cfg(any(not(target_arch = "x86_64"), test))]
            {
                let _ = (entry, sp);
                loop {}
            }
        }
        Err(_) => crate::process::wait::exit(-1),
    }
}

/// Installs one PT_LOAD segment's pages as lazy FILE-backed entries, one
/// `alloc_page_with_initializer` per page, splitting each page's bytes
/// into the portion read from the file and the portion zero-filled
/// (bss tail, and the gap before/after `filesz` within a page).
fn install_segment(spt: &mut Spt, handle: FileHandle, p: &Phdr) -> Result<(), LoadError> {
    let va_start = page_align(p.p_vaddr);
    let in_page_off = p.p_vaddr - va_start;
    let total = in_page_off + p.p_memsz;
    let mut page_va = va_start;
    let mut consumed = 0u64;
    while consumed < total {
        let page_off_in_segment = consumed.saturating_sub(in_page_off);
        let this_page_start_in_segment = if consumed >= in_page_off { page_off_in_segment } else { 0 };
        let remaining_in_page = (page_va + PGSIZE) - (va_start + consumed).max(page_va);
        let chunk = remaining_in_page.min(total - consumed);

        let file_off = p.p_offset + this_page_start_in_segment;
        let read_bytes = if this_page_start_in_segment < p.p_filesz {
            (p.p_filesz - this_page_start_in_segment).min(chunk)
        } else {
            0
        };
        let zero_bytes = chunk - read_bytes;
        let writable = p.p_flags & 0x2 != 0;

        if !spt.pages.contains_key(&page_va) {
            alloc_page_with_initializer(
                spt,
                page_va,
                writable,
                UninitTarget::File { handle, offset: file_off, read_bytes: read_bytes as u32, zero_bytes: zero_bytes as u32 },
            )
            .map_err(|_| LoadError::SegmentOutOfBounds)?;
        }

        consumed += chunk;
        page_va += PGSIZE;
    }
    Ok(())
}

/// §4.5/§6: opens `path`, validates the ELF header and every program
/// header, installs each PT_LOAD segment lazily, and denies further
/// writers to the executable for the life of the process.
pub fn load_elf(spt: &mut Spt, path: &str) -> Result<(u64, FileHandle), LoadError> {
    let handle = crate::process::fs::with(|fs| fs.open(path)).map_err(|_| LoadError::FileNotFound)?;
    let len = crate::process::fs::with(|fs| fs.length(handle));
    let mut buf = alloc::vec![0u8; len as usize];
    crate::process::fs::with(|fs| fs.read_at(handle, 0, &mut buf));

    let ehdr = elf::parse_ehdr(&buf).map_err(|e| {
        crate::process::fs::with(|fs| fs.close(handle));
        e
    })?;

    for i in 0..ehdr.phnum as usize {
        let off = ehdr.phoff as usize + i * ehdr.phentsize as usize;
        let p = elf::parse_phdr(&buf, off).map_err(|e| {
            crate::process::fs::with(|fs| fs.close(handle));
            e
        })?;
        if elf::is_banned_type(p.p_type) {
            crate::process::fs::with(|fs| fs.close(handle));
            return Err(LoadError::UnsupportedType);
        }
        if !elf::is_load(p.p_type) {
            continue;
        }
        elf::validate_load_segment(&p, PGSIZE).map_err(|e| {
            crate::process::fs::with(|fs| fs.close(handle));
            e
        })?;
        install_segment(spt, handle, &p).map_err(|e| {
            crate::process::fs::with(|fs| fs.close(handle));
            e
        })?;
    }

    crate::process::fs::with(|fs| fs.deny_write(handle));
    Ok((ehdr.entry, handle))
}

/// §6 user stack layout, built at the top page of the stack region:
/// argv strings (reverse order) — 0-7 bytes of padding for 8-byte
/// alignment — a NULL sentinel — argv pointers (reverse order) — the
/// address of argv[0]'s pointer — argc — a fake zero return address.
/// Written directly into the stack page's frame bytes since
/// `AddressSpace` has no byte-level read/write of its own.
pub fn build_user_stack(owner: ThreadId, spt: &mut Spt, addr_space: &mut dyn AddressSpace, argv: &[String]) -> Result<u64, LoadError> {
    let stack_page_va = USER_STACK_TOP - PGSIZE;
    alloc_page_with_initializer(spt, stack_page_va, true, UninitTarget::Anon).map_err(|_| LoadError::SegmentOutOfBounds)?;
    claim_page(owner, spt, addr_space, stack_page_va).map_err(|_| LoadError::SegmentOutOfBounds)?;
    let frame_id = spt.pages.get(&stack_page_va).unwrap().frame.unwrap();

    let mut sp = USER_STACK_TOP;
    let mut ptrs: Vec<u64> = Vec::with_capacity(argv.len());

    for arg in argv.iter().rev() {
        let bytes = arg.as_bytes();
        sp -= (bytes.len() + 1) as u64;
        if sp < stack_page_va {
            return Err(LoadError::SegmentOutOfBounds);
        }
        let off = (sp - stack_page_va) as usize;
        frame::with_bytes_mut(frame_id, |buf| {
            buf[off..off + bytes.len()].copy_from_slice(bytes);
            buf[off + bytes.len()] = 0;
        });
        ptrs.push(sp);
    }

    sp &= !0x7;

    sp -= 8;
    if sp < stack_page_va {
        return Err(LoadError::SegmentOutOfBounds);
    }
    write_u64(frame_id, stack_page_va, sp, 0);

    for &ptr in &ptrs {
        sp -= 8;
        if sp < stack_page_va {
            return Err(LoadError::SegmentOutOfBounds);
        }
        write_u64(frame_id, stack_page_va, sp, ptr);
    }
    let argv_addr = sp;

    sp -= 8;
    if sp < stack_page_va {
        return Err(LoadError::SegmentOutOfBounds);
    }
    write_u64(frame_id, stack_page_va, sp, argv_addr);

    sp -= 8;
    if sp < stack_page_va {
        return Err(LoadError::SegmentOutOfBounds);
    }
    write_u32(frame_id, stack_page_va, sp, ptrs.len() as u32);

    sp -= 8;
    if sp < stack_page_va {
        return Err(LoadError::SegmentOutOfBounds);
    }
    write_u64(frame_id, stack_page_va, sp, 0);

    Ok(sp)
}

fn write_u64(frame_id: frame::FrameId, page_va: u64, addr: u64, value: u64) {
    let off = (addr - page_va) as usize;
    frame::with_bytes_mut(frame_id, |buf| buf[off..off + 8].copy_from_slice(&value.to_le_bytes()));
}

/// Writes a 4-byte value (§6: argc is 4 bytes) at `addr`'s 8-byte-aligned
/// slot, leaving the upper 4 bytes whatever the frame already holds.
fn write_u32(frame_id: frame::FrameId, page_va: u64, addr: u64, value: u32) {
    let off = (addr - page_va) as usize;
    frame::with_bytes_mut(frame_id, |buf| buf[off..off + 4].copy_from_slice(&value.to_le_bytes()));
}

/// Ring-3 entry trampoline (§4.5): loads the user `rip`/`rsp` and executes
/// `iretq`. Real hardware only; host tests never reach this (they stop at
/// building the stack and checking its bytes).
#[cfg(all(target_arch = "x86_64", not(test)))]
pub unsafe fn enter_user_mode(entry: u64, user_rsp: u64) -> ! {
    use core::arch::asm;
    asm!(
        "push {ss}",
        "push {rsp}",
        "push {rflags}",
        "push {cs}",
        "push {rip}",
        "iretq",
        ss = in(reg) crate::thread::context::USER_DATA_SELECTOR,
        rsp = in(reg) user_rsp,
        rflags = in(reg) 0x202u64,
        cs = in(reg) crate::thread::context::USER_CODE_SELECTOR,
        rip = in(reg) entry,
        options(noreturn)
    );
}

#[cfg(any(not(target_arch = "x86_64"), test))]
pub unsafe fn enter_user_mode(_entry: u64, _user_rsp: u64) -> ! {
    unreachable!("ring-3 entry is only meaningful on real x86_64 hardware")
}

//! Saved-register frame and the raw context switch. §4.3/§9 DESIGN NOTES:
//! "isolate as a platform-specific primitive callable from safe code; all
//! other code remains target-language-idiomatic." Grounded line-for-line on
//! the teacher's `scheduler::context` naked-asm switch/restore pair.
//!
//! Logging (or any allocation) during the window between saving `old` and
//! jumping into `new` is unsound — the stack is in an inconsistent state.

/// User-mode GDT selectors the ring-3 entry trampoline (`process::exec::
/// enter_user_mode`) loads via `iretq`. RPL 3 set in the low two bits,
/// matching a Pintos-style flat GDT: kernel code/data at 0x08/0x10, user
/// code/data at 0x18/0x20.
#[cfg(target_arch = "x86_64")]
pub const USER_CODE_SELECTOR: u64 = 0x18 | 3;
#[cfg(target_arch = "x86_64")]
pub const USER_DATA_SELECTOR: u64 = 0x20 | 3;

/// Callee-saved x86_64 System V registers, plus the resume address.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl Context {
    pub fn empty() -> Self {
        Context { rsp: 0, rbp: 0, rbx: 0, r12: 0, r13: 0, r14: 0, r15: 0, rip: 0 }
    }

    /// Context for a never-before-run thread: `rip` resumes at `entry`,
    /// `rsp` at the 16-byte-aligned top of its kernel stack.
    pub fn new(entry: u64, stack_top: u64) -> Self {
        let aligned_sp = (stack_top - 8) & !0xF;
        Context { rsp: aligned_sp, rbp: 0, rbx: 0, r12: 0, r13: 0, r14: 0, r15: 0, rip: entry }
    }
}

/// Save callee-saved registers into `old`, restore from `new`, and resume
/// execution there. Returns (to the caller of the *original* `switch_context`
/// that saved into `old`) once some later switch restores `old` again.
///
/// # Safety
/// `old` and `new` must point at live `Context`s whose `rsp` is a valid,
/// currently-unused kernel stack. Interrupts must be disabled by the caller.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(old: *mut Context, new: *const Context) {
    core::arch::naked_asm!(
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x38], rax",

        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "jmp [rsi + 0x38]",

        "2:",
        "ret",
    );
}

/// Restore `new` without saving anywhere — used when the outgoing thread is
/// DYING and its context will never be resumed.
///
/// # Safety
/// `new` must point at a live `Context` with a valid `rsp`.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub unsafe extern "C" fn restore_context(new: *const Context) {
    core::arch::naked_asm!(
        "mov rsp, [rdi + 0x00]",
        "mov rbp, [rdi + 0x08]",
        "mov rbx, [rdi + 0x10]",
        "mov r12, [rdi + 0x18]",
        "mov r13, [rdi + 0x20]",
        "mov r14, [rdi + 0x28]",
        "mov r15, [rdi + 0x30]",
        "jmp [rdi + 0x38]",
    );
}

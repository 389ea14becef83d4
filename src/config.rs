//! Boot-time constants. Numbers spec.md leaves as prose live here, named the
//! way Pintos names them, so the rest of the crate never hand-writes magic
//! numbers.

pub const PRI_MIN: u8 = 0;
pub const PRI_MAX: u8 = 63;
pub const PRI_DEFAULT: u8 = 31;

/// Timer ticks a thread runs before yielding to the next ready thread.
pub const TIME_SLICE: u64 = 4;

/// Ticks between MLFQS priority/load_avg/recent_cpu recomputation.
pub const MLFQS_PRIORITY_FREQ: u64 = 4;
pub const MLFQS_RECALC_FREQ: u64 = 100;

/// Fixed-point scale factor (17.14 format) used by the MLFQS formulas.
pub const FIXED_POINT_F: i64 = 1 << 14;

/// Maximum open file descriptors per process (spec §9 Open Question,
/// resolved to the upper end of the observed range).
pub const FDT_MAX: usize = 128;

/// Bound on how many locks a priority donation chain is followed through.
pub const DONATION_DEPTH_MAX: usize = 8;

pub const PGSIZE: u64 = 4096;
pub const PGMASK: u64 = PGSIZE - 1;

/// Lowest address considered kernel-only; user pointers must fall strictly
/// below this boundary or syscall argument validation rejects them.
pub const USER_BOUNDARY: u64 = 0x0000_8000_0000_0000;

/// Highest user virtual address a process's stack may grow down from.
pub const USER_STACK_TOP: u64 = 0x4747_7000_0000;
/// Growth is rejected once the faulting address would fall below this
/// address relative to the current stack pointer.
pub const STACK_GROWTH_LIMIT: u64 = 8 * 1024 * 1024;

/// Kernel stack size allocated per thread.
pub const KERNEL_STACK_SIZE: usize = 4096 * 4;
/// Initial user stack reservation at `exec` time.
pub const USER_STACK_SIZE: u64 = 4096 * 4;

/// The in-scope half of the boot command line: whether the 4.4BSD MLFQ
/// scheduler is enabled instead of plain priority scheduling. Parsing the
/// actual command line is the excluded boot collaborator's job.
#[derive(Debug, Clone, Copy, Default)]
pub struct BootConfig {
    pub mlfqs: bool,
}

/// Frequency the external PIT drives `timer::tick()` at. §4.1 requires
/// `>= 19` Hz; 100 Hz matches the teacher/Pintos default.
pub const TIMER_FREQ_HZ: u32 = 100;

/// Upper bound on live threads, standing in for "kernel ran out of pages to
/// allocate a new kernel stack" (§7 ResourceExhaustion, `TID_ERROR`).
pub const MAX_THREADS: usize = 4096;

/// Upper bound on physical frames in the user pool, standing in for the
/// real RAM size the boot collaborator discovers.
pub const FRAME_POOL_SIZE: usize = 2048;

/// Upper bound on swap slots, standing in for the real swap block device's
/// size (`channel=1, device=1` per §6).
pub const SWAP_SLOT_COUNT: usize = 4096;

//! Error taxonomy. Hand-rolled `Display` impls, no `std::error::Error` —
//! matching the rest of the no_std stack this crate is built from.

use core::fmt;

/// A fault attributable to the user program: bad pointer, bad syscall
/// argument, invalid ELF image. The syscall dispatcher responds to these by
/// terminating the offending process with exit status -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserError {
    BadPointer,
    BadFileDescriptor,
    InvalidArgument,
    NotExecutable,
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserError::BadPointer => write!(f, "bad pointer"),
            UserError::BadFileDescriptor => write!(f, "bad file descriptor"),
            UserError::InvalidArgument => write!(f, "invalid argument"),
            UserError::NotExecutable => write!(f, "not executable"),
        }
    }
}

/// Kernel ran out of a bounded resource: frames, swap slots, fd table
/// slots. The single call that asked for the resource fails; the process
/// is not killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceExhaustion {
    OutOfFrames,
    OutOfSwap,
    FdTableFull,
    OutOfMemory,
}

impl fmt::Display for ResourceExhaustion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceExhaustion::OutOfFrames => write!(f, "out of physical frames"),
            ResourceExhaustion::OutOfSwap => write!(f, "swap space exhausted"),
            ResourceExhaustion::FdTableFull => write!(f, "file descriptor table full"),
            ResourceExhaustion::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

/// `exec`/ELF-load failures distinct from a general user error, since exec
/// reports failure to the caller (fork's return value of -1) rather than
/// killing anyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    FileNotFound,
    InvalidMagic,
    UnsupportedClass,
    UnsupportedMachine,
    UnsupportedType,
    BadProgramHeader,
    SegmentOutOfBounds,
    TooManyProgramHeaders,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::FileNotFound => write!(f, "file not found"),
            LoadError::InvalidMagic => write!(f, "not an ELF file"),
            LoadError::UnsupportedClass => write!(f, "unsupported ELF class"),
            LoadError::UnsupportedMachine => write!(f, "unsupported machine type"),
            LoadError::UnsupportedType => write!(f, "unsupported ELF type"),
            LoadError::BadProgramHeader => write!(f, "malformed program header"),
            LoadError::SegmentOutOfBounds => write!(f, "segment outside user address space"),
            LoadError::TooManyProgramHeaders => write!(f, "too many program headers"),
        }
    }
}

/// An internal invariant the kernel itself is supposed to guarantee was
/// violated (stack canary smashed, SPT/frame-table bookkeeping mismatch).
/// Not recoverable; the only correct response is to panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyAssertion {
    StackOverflow,
    FrameTableCorrupt,
    DoubleFree,
}

impl fmt::Display for ConsistencyAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyAssertion::StackOverflow => write!(f, "kernel stack overflow"),
            ConsistencyAssertion::FrameTableCorrupt => write!(f, "frame table corrupt"),
            ConsistencyAssertion::DoubleFree => write!(f, "double free"),
        }
    }
}

/// What the syscall dispatcher does once a call fails: whether the calling
/// process is terminated, or only the call returns an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Return this value from the syscall normally.
    Return(i64),
    /// Terminate the calling process with exit status -1.
    Terminate,
}

impl From<UserError> for SyscallOutcome {
    fn from(_: UserError) -> Self {
        SyscallOutcome::Terminate
    }
}

impl From<ResourceExhaustion> for SyscallOutcome {
    fn from(_: ResourceExhaustion) -> Self {
        SyscallOutcome::Return(-1)
    }
}

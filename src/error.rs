//! Error taxonomy for the bridge
//!
//! Everything here is fatal for the co-simulation. Host-kernel failures are
//! not errors of the bridge: they travel back to the guest as return value
//! and errno.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("physical address {addr:#x} beyond physical memory ({limit:#x} bytes)")]
    OutOfRange { addr: u64, limit: u64 },

    #[error("virtual address {vaddr:#x} beyond the guest address space ({limit:#x} bytes)")]
    VirtualOutOfRange { vaddr: u64, limit: u64 },

    #[error("no free physical pages left")]
    OutOfPhysicalPages,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid program image: {0}")]
    InvalidImage(String),

    #[error("ELF parse error: {0}")]
    Elf(#[from] goblin::error::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("host mapping failed: {0}")]
    HostMapping(#[source] std::io::Error),

    #[error("unsupported mmap request (addr={addr:#x}, flags={flags:#x})")]
    UnsupportedMmap { addr: u64, flags: u64 },

    #[error("heap allocation of {size} bytes at {cursor:#x} exceeds physical memory")]
    HeapExhausted { cursor: u64, size: u64 },

    #[error("unknown bus command class {class:#06b} (tag {tag:#06x})")]
    UnknownCommand { class: u8, tag: u16 },

    #[error("misaligned bus address {addr:#x}")]
    Misaligned { addr: u64 },

    #[error("request readiness dropped while a transfer was in progress")]
    ReadyDroppedMidTransfer,

    #[error("timing model completed {addr:#x} with no outstanding request")]
    UnexpectedCompletion { addr: u64 },

    #[error("timing model rejected a transaction for {addr:#x}")]
    TransactionRejected { addr: u64 },

    #[error("unsupported syscall {number} ({name})")]
    UnsupportedSyscall { number: u64, name: &'static str },

    #[error("unsupported arch-specific syscall operation {op}")]
    UnsupportedArchCall { op: u64 },

    #[error("pipeline script: {0}")]
    Script(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("the simulation has already halted")]
    Halted,
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// The guest terminated (exit, exit_group or a fatal signal).
    Exit(i64),
    /// A fatal bridge condition, kept as its diagnostic text.
    Fatal(String),
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::Exit(code) => write!(f, "guest exited with status {}", code),
            HaltReason::Fatal(msg) => write!(f, "fatal: {}", msg),
        }
    }
}

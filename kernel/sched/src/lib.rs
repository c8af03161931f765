//! Process and thread scheduling for the Muon kernel.
//!
//! A fixed-timeslice round-robin scheduler over a single FIFO ready
//! queue. Threads carry their own kernel stacks with the saved trap frame
//! at the top; processes own an optional page-directory root (`None`
//! means the kernel directory, which only `init` borrows).
//!
//! Everything here is policy and bookkeeping: [`Scheduler::tick`] returns
//! a [`scheduler::TickAction`] describing what should happen, and the
//! kernel's timer handler performs the actual TSS update, directory
//! switch, and `iret`. That split keeps the whole scheduler host-testable.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod process;
pub mod queue;
pub mod scheduler;
pub mod thread;

use core::fmt;

pub use process::Process;
pub use queue::ReadyQueue;
pub use scheduler::{DirTarget, Scheduler, TickAction};
pub use thread::{KernelStack, Thread, ThreadState};

/// Timer ticks a thread runs before being preempted.
pub const DEFAULT_TIMESLICE: u32 = 10;

/// Kernel stack size per thread: two pages.
pub const KSTACK_SIZE: usize = 2 * 4096;

/// Top of the user-mode stack; it grows down from the kernel half
/// boundary.
pub const USER_STACK_TOP: u32 = 0xC000_0000;

/// Errors from scheduler operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// A kernel stack or control block allocation failed.
    OutOfMemory,
    /// The operation needs a current thread and none exists.
    NoCurrentThread,
    /// Fork was requested from a process without its own address space.
    NotUserProcess,
    /// No process with the given PID.
    NotFound,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("out of memory"),
            Self::NoCurrentThread => f.write_str("no current thread"),
            Self::NotUserProcess => f.write_str("process has no user address space"),
            Self::NotFound => f.write_str("no such process"),
        }
    }
}

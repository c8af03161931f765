//! Process control blocks.
//!
//! A process owns its threads by ID; the thread objects themselves live
//! in the scheduler's table, so the ownership graph stays a tree.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use muon_core::addr::PhysAddr;
use muon_core::id::{Pid, Tid};

/// A process control block.
pub struct Process {
    /// Process ID.
    pub pid: Pid,
    /// Human-readable name (the spawn path, or `init`).
    pub name: String,
    /// Recorded but never consulted by the FIFO scheduler.
    pub priority: i32,
    /// Exit status, meaningful once every thread is terminated.
    pub exit_code: i32,
    /// Root of the process's page directory. `None` means the kernel
    /// directory is borrowed: only `init` does that, and the borrowed
    /// directory is never freed with the process.
    pub page_dir: Option<PhysAddr>,
    /// The thread created first (the one `spawn` and `fork` post).
    pub main_thread: Option<Tid>,
    /// All live threads of this process.
    pub threads: Vec<Tid>,
}

impl Process {
    /// Creates an empty process with no threads yet.
    #[must_use]
    pub fn new(pid: Pid, name: String, priority: i32, page_dir: Option<PhysAddr>) -> Self {
        Self {
            pid,
            name,
            priority,
            exit_code: 0,
            page_dir,
            main_thread: None,
            threads: Vec::new(),
        }
    }

    /// Attaches a thread, making it the main thread if there is none.
    pub fn attach_thread(&mut self, tid: Tid) {
        if self.main_thread.is_none() {
            self.main_thread = Some(tid);
        }
        self.threads.push(tid);
    }

    /// Detaches a thread; returns `true` if the process has no threads
    /// left.
    pub fn detach_thread(&mut self, tid: Tid) -> bool {
        self.threads.retain(|&t| t != tid);
        if self.main_thread == Some(tid) {
            self.main_thread = self.threads.first().copied();
        }
        self.threads.is_empty()
    }
}

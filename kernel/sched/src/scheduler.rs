//! The round-robin scheduler.
//!
//! [`Scheduler::tick`] runs on every timer interrupt and returns a
//! [`TickAction`]; the kernel's handler applies it (TSS `esp0`, directory
//! switch, `iret` into the next frame). All scheduler state is mutated
//! with interrupts disabled, so plain bookkeeping suffices here.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use muon_core::addr::PhysAddr;
use muon_core::arch::x86::TrapFrame;
use muon_core::id::{Pid, Tid};

use crate::process::Process;
use crate::queue::ReadyQueue;
use crate::thread::{Thread, ThreadState};
use crate::{DEFAULT_TIMESLICE, SchedError};

/// Which page directory a context switch must load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirTarget {
    /// The kernel directory (the target process borrows it).
    Kernel,
    /// A process-owned directory root.
    User(PhysAddr),
}

/// What the timer handler should do after a tick.
#[derive(Debug)]
pub enum TickAction {
    /// The current thread keeps the CPU.
    Continue,
    /// Nothing is runnable; halt until the next interrupt.
    Halt,
    /// Switch to another thread.
    Switch {
        /// The next thread's saved trap frame; the switch primitive
        /// unwinds it and never returns.
        frame: *mut TrapFrame,
        /// New TSS `esp0` value.
        kstack_top: usize,
        /// Directory to load, or `None` when the process is unchanged.
        switch_dir: Option<DirTarget>,
    },
}

/// The scheduler: process table, thread table, and the ready queue.
pub struct Scheduler {
    processes: BTreeMap<Pid, Process>,
    threads: BTreeMap<Tid, Thread>,
    ready: ReadyQueue,
    current: Option<Tid>,
    next_pid: u32,
    next_tid: u32,
    ticks: u64,
    /// Page-directory roots of processes destroyed during reaping. The
    /// scheduler cannot free address spaces itself; the kernel drains
    /// this and hands them to the VMM.
    orphaned_dirs: Vec<PhysAddr>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            processes: BTreeMap::new(),
            threads: BTreeMap::new(),
            ready: ReadyQueue::new(),
            current: None,
            next_pid: 1,
            next_tid: 1,
            ticks: 0,
            orphaned_dirs: Vec::new(),
        }
    }

    fn alloc_pid(&mut self) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        pid
    }

    fn alloc_tid(&mut self) -> Tid {
        let tid = Tid(self.next_tid);
        self.next_tid += 1;
        tid
    }

    /// Builds the `init` process around the boot thread.
    ///
    /// `init` borrows the kernel directory (`page_dir = None`) and its
    /// thread starts out RUNNING as the current thread; the caller
    /// programs the TSS `esp0` from
    /// [`current_kstack_top`](Self::current_kstack_top).
    pub fn init(&mut self) -> Result<Pid, SchedError> {
        let pid = self.alloc_pid();
        let tid = self.alloc_tid();
        let thread = Thread::new_bootstrap(tid, pid).ok_or(SchedError::OutOfMemory)?;

        let mut proc = Process::new(pid, String::from("init"), 0, None);
        proc.attach_thread(tid);
        self.threads.insert(tid, thread);
        self.processes.insert(pid, proc);
        self.current = Some(tid);
        Ok(pid)
    }

    // -- accessors -----------------------------------------------------------

    /// The current thread's ID.
    #[must_use]
    pub fn current(&self) -> Option<Tid> {
        self.current
    }

    /// The current thread's owning process.
    #[must_use]
    pub fn current_pid(&self) -> Option<Pid> {
        self.current.and_then(|tid| self.owner_of(tid))
    }

    /// The owner of a thread.
    #[must_use]
    pub fn owner_of(&self, tid: Tid) -> Option<Pid> {
        self.threads.get(&tid).map(|t| t.owner)
    }

    /// A thread's lifecycle state.
    #[must_use]
    pub fn thread_state(&self, tid: Tid) -> Option<ThreadState> {
        self.threads.get(&tid).map(|t| t.state)
    }

    /// Looks up a process by PID.
    #[must_use]
    pub fn find_by_pid(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(&pid)
    }

    /// The current thread's kernel stack top (the TSS `esp0` value).
    #[must_use]
    pub fn current_kstack_top(&self) -> Option<usize> {
        self.current
            .and_then(|tid| self.threads.get(&tid))
            .map(Thread::kstack_top)
    }

    /// Number of threads waiting in the ready queue.
    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// A copy of a thread's saved trap frame, if it has one.
    #[must_use]
    pub fn thread_frame(&self, tid: Tid) -> Option<TrapFrame> {
        self.threads.get(&tid).and_then(Thread::saved_frame)
    }

    /// Monotonic count of timer ticks seen.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Drains the page-directory roots orphaned by process destruction.
    pub fn take_orphaned_dirs(&mut self) -> Vec<PhysAddr> {
        core::mem::take(&mut self.orphaned_dirs)
    }

    // -- thread and process lifecycle ----------------------------------------

    /// Marks a thread READY and appends it to the ready queue.
    ///
    /// Callers hold interrupts disabled; the queue is the only structure
    /// the timer path and thread context both touch.
    pub fn post(&mut self, tid: Tid) {
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.state = ThreadState::Ready;
            self.ready.push(tid);
        }
    }

    /// Creates a user process around an already-populated address space
    /// and posts its main thread.
    ///
    /// The caller loads the executable into `page_dir` first and tears
    /// the directory down again if this fails.
    pub fn spawn(
        &mut self,
        name: &str,
        page_dir: PhysAddr,
        entry: u32,
        priority: i32,
    ) -> Result<Pid, SchedError> {
        let pid = self.alloc_pid();
        let tid = self.alloc_tid();
        let thread =
            Thread::new(tid, pid, priority, entry, true).ok_or(SchedError::OutOfMemory)?;

        let mut proc = Process::new(pid, String::from(name), priority, Some(page_dir));
        proc.attach_thread(tid);
        self.threads.insert(tid, thread);
        self.processes.insert(pid, proc);
        self.post(tid);
        Ok(pid)
    }

    /// Creates a kernel-mode process (borrowing the kernel directory) and
    /// posts its main thread.
    pub fn spawn_kernel(&mut self, name: &str, entry: u32) -> Result<Pid, SchedError> {
        let pid = self.alloc_pid();
        let tid = self.alloc_tid();
        let thread = Thread::new(tid, pid, 0, entry, false).ok_or(SchedError::OutOfMemory)?;

        let mut proc = Process::new(pid, String::from(name), 0, None);
        proc.attach_thread(tid);
        self.threads.insert(tid, thread);
        self.processes.insert(pid, proc);
        self.post(tid);
        Ok(pid)
    }

    /// Adds a thread to an existing process and posts it.
    ///
    /// The thread runs in user mode iff the process owns an address
    /// space.
    pub fn create_thread(&mut self, pid: Pid, entry: u32) -> Result<Tid, SchedError> {
        let user = self
            .processes
            .get(&pid)
            .ok_or(SchedError::NotFound)?
            .page_dir
            .is_some();
        let priority = self.processes.get(&pid).map_or(0, |p| p.priority);

        let tid = self.alloc_tid();
        let thread =
            Thread::new(tid, pid, priority, entry, user).ok_or(SchedError::OutOfMemory)?;
        self.threads.insert(tid, thread);
        if let Some(proc) = self.processes.get_mut(&pid) {
            proc.attach_thread(tid);
        }
        self.post(tid);
        Ok(tid)
    }

    /// Forks the current user process.
    ///
    /// `parent_frame` is the parent's interrupt-time register state;
    /// `child_dir` is the already-cloned address space. The child gets a
    /// byte copy of the frame on a fresh kernel stack with `eax = 0`,
    /// the parent's `eax` becomes the child PID, and the child's main
    /// thread is posted.
    pub fn fork(
        &mut self,
        parent_frame: &mut TrapFrame,
        child_dir: PhysAddr,
    ) -> Result<Pid, SchedError> {
        let cur_tid = self.current.ok_or(SchedError::NoCurrentThread)?;
        let parent_pid = self.owner_of(cur_tid).ok_or(SchedError::NoCurrentThread)?;
        let parent_proc = self
            .processes
            .get(&parent_pid)
            .ok_or(SchedError::NoCurrentThread)?;
        if parent_proc.page_dir.is_none() {
            return Err(SchedError::NotUserProcess);
        }
        let mut name = parent_proc.name.clone();
        name.push_str("_child");
        let priority = parent_proc.priority;

        let child_pid = self.alloc_pid();
        let child_tid = self.alloc_tid();
        let parent_thread = self
            .threads
            .get(&cur_tid)
            .ok_or(SchedError::NoCurrentThread)?;
        let child_thread = Thread::forked(child_tid, child_pid, parent_thread, parent_frame)
            .ok_or(SchedError::OutOfMemory)?;

        parent_frame.eax = child_pid.as_u32();

        let mut child = Process::new(child_pid, name, priority, Some(child_dir));
        child.attach_thread(child_tid);
        self.threads.insert(child_tid, child_thread);
        self.processes.insert(child_pid, child);
        self.post(child_tid);
        Ok(child_pid)
    }

    /// Terminates a process.
    ///
    /// Every thread is marked TERMINATED. Returns `Ok(true)` if the
    /// process is the current one: the caller must then raise the timer
    /// interrupt so the tick path reaps and switches. Any other process
    /// is reaped synchronously and `Ok(false)` returned.
    pub fn exit(&mut self, pid: Pid, status: i32) -> Result<bool, SchedError> {
        let proc = self.processes.get_mut(&pid).ok_or(SchedError::NotFound)?;
        proc.exit_code = status;
        let tids = proc.threads.clone();

        for tid in &tids {
            if let Some(thread) = self.threads.get_mut(tid) {
                thread.state = ThreadState::Terminated;
            }
        }

        if self.current_pid() == Some(pid) {
            return Ok(true);
        }
        for tid in tids {
            self.reap_thread(tid);
        }
        Ok(false)
    }

    /// Removes a thread from every list and frees its kernel stack; a
    /// process losing its last thread is destroyed with it.
    fn reap_thread(&mut self, tid: Tid) {
        self.ready.remove(tid);
        let Some(thread) = self.threads.remove(&tid) else {
            return;
        };
        if let Some(proc) = self.processes.get_mut(&thread.owner) {
            if proc.detach_thread(tid) {
                let pid = proc.pid;
                self.destroy_process(pid);
            }
        }
    }

    /// Drops a thread-less process. An owned page directory is parked on
    /// the orphan list for the kernel to free; a borrowed kernel
    /// directory is left alone.
    fn destroy_process(&mut self, pid: Pid) {
        if let Some(proc) = self.processes.remove(&pid) {
            if let Some(dir) = proc.page_dir {
                self.orphaned_dirs.push(dir);
            }
        }
    }

    fn make_running(&mut self, tid: Tid) {
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.state = ThreadState::Running;
            thread.timeslice = DEFAULT_TIMESLICE;
        }
    }

    /// Pops the next live thread from the ready queue.
    ///
    /// A thread terminated from outside is reaped at the tick it would
    /// have been scheduled, which is exactly here: terminated entries are
    /// reaped and skipped instead of being handed the CPU.
    fn pop_ready_live(&mut self) -> Option<Tid> {
        while let Some(tid) = self.ready.pop() {
            if self.thread_state(tid) == Some(ThreadState::Terminated) {
                self.reap_thread(tid);
                continue;
            }
            return Some(tid);
        }
        None
    }

    fn switch_action(&self, next_tid: Tid, prev_owner: Option<Pid>) -> TickAction {
        let Some(next) = self.threads.get(&next_tid) else {
            return TickAction::Continue;
        };
        let switch_dir = if prev_owner != Some(next.owner) {
            let dir = self.processes.get(&next.owner).and_then(|p| p.page_dir);
            Some(match dir {
                Some(d) => DirTarget::User(d),
                None => DirTarget::Kernel,
            })
        } else {
            None
        };
        TickAction::Switch {
            frame: next.trap_frame(),
            kstack_top: next.kstack_top(),
            switch_dir,
        }
    }

    /// The timer tick.
    ///
    /// 1. Snapshot the interrupt frame pointer of a RUNNING current
    ///    thread.
    /// 2. Reap a TERMINATED current thread and switch to the ready head
    ///    (or halt when there is none).
    /// 3. Burn one timeslice tick; time left means keep running.
    /// 4. With an empty ready queue, refill and keep running; otherwise
    ///    rotate: demote current to READY, promote the head with a fresh
    ///    timeslice.
    pub fn tick(&mut self, ctx: *mut TrapFrame) -> TickAction {
        self.ticks += 1;
        let Some(cur_tid) = self.current else {
            return TickAction::Continue;
        };

        let state = {
            let Some(cur) = self.threads.get_mut(&cur_tid) else {
                self.current = None;
                return TickAction::Continue;
            };
            if cur.state == ThreadState::Running {
                cur.set_trap_frame(ctx);
            }
            cur.state
        };

        if state == ThreadState::Terminated {
            let Some(next) = self.pop_ready_live() else {
                return TickAction::Halt;
            };
            let prev_owner = self.owner_of(cur_tid);
            self.make_running(next);
            self.current = Some(next);
            self.reap_thread(cur_tid);
            return self.switch_action(next, prev_owner);
        }

        let (state, timeslice) = {
            let Some(cur) = self.threads.get_mut(&cur_tid) else {
                return TickAction::Continue;
            };
            cur.timeslice = cur.timeslice.saturating_sub(1);
            (cur.state, cur.timeslice)
        };
        if timeslice > 0 && state == ThreadState::Running {
            return TickAction::Continue;
        }

        if self.ready.is_empty() {
            if let Some(cur) = self.threads.get_mut(&cur_tid) {
                cur.timeslice = DEFAULT_TIMESLICE;
            }
            return TickAction::Continue;
        }

        if state == ThreadState::Running {
            self.post(cur_tid);
        }
        let Some(next) = self.pop_ready_live() else {
            return TickAction::Continue;
        };
        let prev_owner = self.owner_of(cur_tid);
        self.make_running(next);
        self.current = Some(next);
        if next == cur_tid {
            return TickAction::Continue;
        }
        self.switch_action(next, prev_owner)
    }
}

#[cfg(test)]
mod tests;

//! Process management glue.
//!
//! Owns the scheduler singleton and wires it to the VMM, the VFS, and
//! the timer interrupt: `spawn` pulls an executable through the VFS into
//! a fresh address space, `fork` clones the current one, `exit` defers to
//! the tick path when the current process is the target, and the timer
//! handler applies whatever [`TickAction`] the scheduler returns.
//!
//! [`TickAction`]: muon_sched::TickAction

pub mod exec;

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

use muon_core::id::Pid;
use muon_core::kinfo;
use muon_core::sync::SpinLock;
use muon_elf::ElfError;
use muon_fs::{FsError, OpenFlags};
use muon_mm::VmmError;
use muon_sched::{SchedError, Scheduler};

use crate::mm::with_vmm_and_pfa;

/// Errors from process-level operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcError {
    /// The executable could not be opened or read.
    Fs(FsError),
    /// The executable is not a loadable ELF.
    Elf(ElfError),
    /// Address-space construction failed.
    Vmm(VmmError),
    /// The scheduler refused the operation.
    Sched(SchedError),
    /// More `PT_LOAD` segments than the loader supports.
    TooManySegments,
    /// A mapped segment page went missing during the copy.
    LoadFailed,
}

impl fmt::Display for ProcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fs(e) => write!(f, "filesystem error: {e}"),
            Self::Elf(e) => write!(f, "invalid executable: {e}"),
            Self::Vmm(e) => write!(f, "address space error: {e}"),
            Self::Sched(e) => write!(f, "scheduler error: {e}"),
            Self::TooManySegments => f.write_str("too many loadable segments"),
            Self::LoadFailed => f.write_str("segment copy failed"),
        }
    }
}

impl From<FsError> for ProcError {
    fn from(e: FsError) -> Self {
        Self::Fs(e)
    }
}

impl From<ElfError> for ProcError {
    fn from(e: ElfError) -> Self {
        Self::Elf(e)
    }
}

impl From<VmmError> for ProcError {
    fn from(e: VmmError) -> Self {
        Self::Vmm(e)
    }
}

impl From<SchedError> for ProcError {
    fn from(e: SchedError) -> Self {
        Self::Sched(e)
    }
}

static SCHEDULER: SpinLock<Option<Scheduler>> = SpinLock::new(None);

/// Runs a closure with the global scheduler.
///
/// # Panics
///
/// Panics if the scheduler has not been initialised.
pub fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    let mut sched = SCHEDULER.lock();
    f(sched.as_mut().expect("scheduler not initialized"))
}

/// Builds the scheduler and its `init` process, and points the TSS at
/// the init thread's kernel stack.
///
/// # Panics
///
/// Panics if called twice or if the kernel heap cannot back the init
/// thread.
pub fn init() {
    let mut slot = SCHEDULER.lock();
    assert!(slot.is_none(), "scheduler already initialized");

    let mut sched = Scheduler::new();
    let pid = sched.init().expect("failed to create init process");
    let kstack_top = sched
        .current_kstack_top()
        .expect("init thread has a kernel stack");
    *slot = Some(sched);
    drop(slot);

    #[cfg(target_arch = "x86")]
    crate::arch::x86::gdt::set_esp0(kstack_top as u32);
    #[cfg(not(target_arch = "x86"))]
    let _ = kstack_top;

    kinfo!("scheduler: init process is PID {}", pid);
}

/// Reads a whole file through the VFS.
fn read_file(path: &str) -> Result<Vec<u8>, ProcError> {
    let mut file = crate::fs::vfs_open(path, OpenFlags::READ)?;
    let mut image = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        image.extend_from_slice(&chunk[..n]);
        if n < chunk.len() {
            break;
        }
    }
    Ok(image)
}

/// Spawns a process from an executable on the VFS.
///
/// Open → read → fresh address space → ELF load → scheduler post. A
/// failure after the address space exists tears it down again before the
/// error propagates.
pub fn process_spawn(path: &str) -> Result<Pid, ProcError> {
    let image = read_file(path)?;

    let (dir, entry) = with_vmm_and_pfa(|vmm, pfa| {
        let dir = vmm.create_address_space(pfa)?;
        match exec::load_elf(vmm, pfa, dir, &image) {
            Ok(entry) => Ok((dir, entry)),
            Err(e) => {
                vmm.destroy_address_space(dir, pfa);
                Err(e)
            }
        }
    })?;

    let pid = with_scheduler(|sched| sched.spawn(path, dir, entry, 0)).map_err(|e| {
        with_vmm_and_pfa(|vmm, pfa| vmm.destroy_address_space(dir, pfa));
        ProcError::Sched(e)
    })?;

    kinfo!("spawned {} as PID {} (entry {:#010x})", path, pid, entry);
    Ok(pid)
}

/// Forks the current user process.
///
/// Deep-clones the current address space, then hands the clone to the
/// scheduler, which copies `ctx` onto the child's kernel stack and sets
/// the two return values. Returns the child PID (the parent's view).
pub fn process_fork(ctx: &mut muon_core::arch::x86::TrapFrame) -> Result<Pid, ProcError> {
    let child_dir = with_vmm_and_pfa(|vmm, pfa| vmm.clone_pagedir(pfa))?;

    let pid = with_scheduler(|sched| sched.fork(ctx, child_dir)).map_err(|e| {
        with_vmm_and_pfa(|vmm, pfa| vmm.destroy_address_space(child_dir, pfa));
        ProcError::Sched(e)
    })?;

    kinfo!("forked PID {}", pid);
    Ok(pid)
}

/// Terminates a process.
///
/// A non-current target is reaped synchronously (its address space is
/// freed here). The current process is only marked terminated; the timer
/// interrupt is raised so the tick path reaps it and switches away.
pub fn process_exit(pid: Pid, status: i32) -> Result<(), ProcError> {
    let was_current = with_scheduler(|sched| sched.exit(pid, status))?;
    free_orphaned_dirs();

    if was_current {
        #[cfg(target_arch = "x86")]
        crate::arch::x86::instructions::raise_timer_interrupt();
    }
    Ok(())
}

/// Frees the address spaces of processes the scheduler destroyed.
fn free_orphaned_dirs() {
    let dirs = with_scheduler(Scheduler::take_orphaned_dirs);
    if dirs.is_empty() {
        return;
    }
    with_vmm_and_pfa(|vmm, pfa| {
        for dir in dirs {
            vmm.destroy_address_space(dir, pfa);
        }
    });
}

/// The timer-tick interrupt handler (vector 32).
///
/// Runs the scheduler's tick and applies the outcome: update TSS `esp0`,
/// switch the page directory when the process changed, and unwind into
/// the next thread's trap frame. Halts forever when nothing is runnable.
#[cfg(target_arch = "x86")]
pub fn timer_handler(ctx: &mut muon_core::arch::x86::TrapFrame) {
    use muon_sched::{DirTarget, TickAction};

    // The scheduler lock must be released before a switch path that never
    // returns.
    let action = with_scheduler(|sched| sched.tick(ctx));
    free_orphaned_dirs();

    match action {
        TickAction::Continue => {}
        TickAction::Halt => loop {
            crate::arch::x86::instructions::halt();
        },
        TickAction::Switch { frame, kstack_top, switch_dir } => {
            crate::arch::x86::gdt::set_esp0(kstack_top as u32);
            if let Some(target) = switch_dir {
                crate::mm::with_vmm(|vmm| {
                    let dir = match target {
                        DirTarget::Kernel => vmm.kernel_dir(),
                        DirTarget::User(dir) => dir,
                    };
                    vmm.switch_pagedir(dir);
                });
            }
            // The PIC never saw an EOI for this tick: the common dispatch
            // path is being abandoned, so acknowledge here before leaving
            // through the new frame.
            crate::arch::x86::pic::send_eoi(crate::arch::x86::interrupts::TIMER_VECTOR);
            // SAFETY: The frame was saved by the interrupt entry path (or
            // hand-built by the scheduler) and esp0/CR3 are consistent.
            unsafe { crate::arch::x86::entry::switch_to_frame(frame) };
        }
    }
}

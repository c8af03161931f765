//! Threads and their kernel stacks.
//!
//! Each thread owns a kernel stack; the saved trap frame lives at the top
//! of that stack and `trap_frame` points to wherever the state was last
//! saved (the initial hand-built frame for a thread that has never run,
//! or the interrupt-time frame afterwards).

extern crate alloc;

use core::alloc::Layout;

use muon_core::arch::x86::{
    EFLAGS_IF, KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, TrapFrame, USER_CODE_SELECTOR,
    USER_DATA_SELECTOR,
};
use muon_core::id::{Pid, Tid};

use crate::{DEFAULT_TIMESLICE, KSTACK_SIZE, USER_STACK_TOP};

/// Thread lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Queued, waiting for a timeslice.
    Ready,
    /// Currently on the CPU.
    Running,
    /// Waiting for a wakeup (reserved; nothing blocks in this kernel yet).
    Blocked,
    /// Finished; reaped on the next tick at which it would run.
    Terminated,
}

/// An owned, 16-byte-aligned kernel stack.
pub struct KernelStack {
    base: *mut u8,
    size: usize,
}

// SAFETY: The stack memory is exclusively owned and only reached through
// this handle.
unsafe impl Send for KernelStack {}

impl KernelStack {
    /// Allocates a zeroed stack of `size` bytes, or `None` when the heap
    /// is exhausted.
    #[must_use]
    pub fn new(size: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size, 16).ok()?;
        // SAFETY: `layout` has nonzero size.
        let base = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if base.is_null() {
            return None;
        }
        Some(Self { base, size })
    }

    /// One past the highest byte; the stack grows down from here.
    #[must_use]
    pub fn top(&self) -> usize {
        self.base as usize + self.size
    }

    /// Stack size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        // SAFETY: `base` was allocated with exactly this layout.
        unsafe {
            alloc::alloc::dealloc(self.base, Layout::from_size_align_unchecked(self.size, 16));
        }
    }
}

/// A thread control block.
pub struct Thread {
    /// Thread ID.
    pub tid: Tid,
    /// Owning process.
    pub owner: Pid,
    /// Lifecycle state.
    pub state: ThreadState,
    /// Recorded but never consulted; the ready queue is strict FIFO.
    pub priority: i32,
    /// Timer ticks left before preemption.
    pub timeslice: u32,
    kstack: KernelStack,
    trap_frame: *mut TrapFrame,
}

// SAFETY: `trap_frame` points into the owned kernel stack (or at the
// interrupt-time frame while the thread is current); the scheduler lock
// serialises all access.
unsafe impl Send for Thread {}

impl Thread {
    /// Creates a thread with a hand-built initial trap frame.
    ///
    /// `user` selects ring-3 segment selectors and the fixed user stack
    /// top; kernel threads get ring-0 selectors and start on their own
    /// kernel stack. Returns `None` when the stack allocation fails.
    #[must_use]
    pub fn new(tid: Tid, owner: Pid, priority: i32, entry: u32, user: bool) -> Option<Self> {
        let kstack = KernelStack::new(KSTACK_SIZE)?;

        let mut frame = TrapFrame::default();
        if user {
            frame.cs = USER_CODE_SELECTOR;
            frame.ds = USER_DATA_SELECTOR;
            frame.ss = USER_DATA_SELECTOR;
            frame.useresp = USER_STACK_TOP;
        } else {
            frame.cs = KERNEL_CODE_SELECTOR;
            frame.ds = KERNEL_DATA_SELECTOR;
            frame.ss = KERNEL_DATA_SELECTOR;
            frame.useresp = kstack.top() as u32;
        }
        frame.eip = entry;
        frame.eflags = EFLAGS_IF;

        let trap_frame = Self::install_frame(&kstack, &frame);
        Some(Self {
            tid,
            owner,
            state: ThreadState::Ready,
            priority,
            timeslice: DEFAULT_TIMESLICE,
            kstack,
            trap_frame,
        })
    }

    /// Creates the bootstrap thread for `init`.
    ///
    /// It is already running on the boot stack, so it gets no initial
    /// frame; the first timer interrupt snapshots one.
    #[must_use]
    pub fn new_bootstrap(tid: Tid, owner: Pid) -> Option<Self> {
        let kstack = KernelStack::new(KSTACK_SIZE)?;
        Some(Self {
            tid,
            owner,
            state: ThreadState::Running,
            priority: 0,
            timeslice: DEFAULT_TIMESLICE,
            kstack,
            trap_frame: core::ptr::null_mut(),
        })
    }

    /// Creates the fork child: a byte copy of the parent's saved trap
    /// frame on a fresh kernel stack, with the return-value register
    /// cleared so the child observes 0.
    #[must_use]
    pub fn forked(tid: Tid, owner: Pid, parent: &Thread, parent_frame: &TrapFrame) -> Option<Self> {
        let kstack = KernelStack::new(KSTACK_SIZE)?;

        let mut frame = *parent_frame;
        frame.eax = 0;
        let trap_frame = Self::install_frame(&kstack, &frame);

        Some(Self {
            tid,
            owner,
            state: ThreadState::Ready,
            priority: parent.priority,
            timeslice: DEFAULT_TIMESLICE,
            kstack,
            trap_frame,
        })
    }

    /// Copies `frame` to the top of `kstack` and returns its address.
    fn install_frame(kstack: &KernelStack, frame: &TrapFrame) -> *mut TrapFrame {
        let slot = (kstack.top() - TrapFrame::SIZE) as *mut TrapFrame;
        // SAFETY: The slot lies within the freshly allocated stack.
        unsafe { slot.write(*frame) };
        slot
    }

    /// Where the thread's CPU state was last saved.
    #[must_use]
    pub fn trap_frame(&self) -> *mut TrapFrame {
        self.trap_frame
    }

    /// Records where the interrupt path saved this thread's state.
    pub fn set_trap_frame(&mut self, frame: *mut TrapFrame) {
        self.trap_frame = frame;
    }

    /// Reads the saved trap frame, if any.
    #[must_use]
    pub fn saved_frame(&self) -> Option<TrapFrame> {
        if self.trap_frame.is_null() {
            None
        } else {
            // SAFETY: A non-null trap_frame points at a valid frame on
            // this thread's kernel stack (or the interrupt stack while
            // current).
            Some(unsafe { *self.trap_frame })
        }
    }

    /// Top of this thread's kernel stack (the TSS `esp0` value while it
    /// runs).
    #[must_use]
    pub fn kstack_top(&self) -> usize {
        self.kstack.top()
    }
}

//! Privileged instruction wrappers.

use muon_core::addr::{PhysAddr, VirtAddr};

/// Enables interrupts.
#[inline]
pub fn sti() {
    // SAFETY: Enabling interrupts has no memory effects.
    unsafe { core::arch::asm!("sti", options(nomem, nostack)) };
}

/// Disables interrupts.
#[inline]
pub fn cli() {
    // SAFETY: Masking interrupts has no memory effects.
    unsafe { core::arch::asm!("cli", options(nomem, nostack)) };
}

/// Halts until the next interrupt.
#[inline]
pub fn halt() {
    // SAFETY: HLT resumes on the next (enabled) interrupt.
    unsafe { core::arch::asm!("hlt", options(nomem, nostack)) };
}

/// Returns the EFLAGS register.
#[inline]
#[must_use]
pub fn read_eflags() -> u32 {
    let flags: u32;
    // SAFETY: pushfd/pop only touches the stack slot it creates.
    unsafe {
        core::arch::asm!("pushfd", "pop {}", out(reg) flags, options(nomem));
    }
    flags
}

/// Runs `f` with interrupts masked, restoring the previous interrupt flag
/// afterwards.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    const IF: u32 = 1 << 9;
    let was_enabled = read_eflags() & IF != 0;
    cli();
    let result = f();
    if was_enabled {
        sti();
    }
    result
}

/// Invalidates the TLB entry for one page.
#[inline]
pub fn invlpg(virt: VirtAddr) {
    // SAFETY: invlpg only drops a TLB entry.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) virt.as_u32(), options(nostack));
    }
}

/// Loads a page-directory root into CR3.
#[inline]
pub fn write_cr3(dir: PhysAddr) {
    // SAFETY: The caller provides a valid page-directory frame; the VMM
    // guarantees the kernel half is mapped in every directory it hands
    // out.
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) dir.as_u32(), options(nostack));
    }
}

/// Reads the faulting address after a page fault.
#[inline]
#[must_use]
pub fn read_cr2() -> u32 {
    let value: u32;
    // SAFETY: Reading CR2 has no side effects.
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) value, options(nomem, nostack));
    }
    value
}

/// Raises the timer interrupt, forcing a scheduler tick.
#[inline]
pub fn raise_timer_interrupt() {
    // SAFETY: Vector 32 is the scheduler tick; raising it voluntarily is
    // how a terminated current process hands the CPU back.
    unsafe { core::arch::asm!("int 32", options(nomem, nostack)) };
}
